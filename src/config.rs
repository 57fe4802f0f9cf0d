// Network Configuration
// Bundles every transport's settings, the enable flags and the orchestrator policy

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::orchestrator::OrchestratorConfig;
use crate::transport::{
    AccessPointConfig, CellularConfig, Interface, RadioTransportConfig, StationConfig,
    StationTransportConfig, TransportError,
};

/// Complete communication configuration of the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub enable_radio: bool,
    pub radio: RadioTransportConfig,

    pub enable_wifi: bool,
    pub wifi: StationTransportConfig,
    /// Network joined at start-up, if any
    pub station: Option<StationConfig>,
    /// Soft AP started at start-up, if any
    pub access_point: Option<AccessPointConfig>,

    pub enable_cellular: bool,
    pub cellular: CellularConfig,

    pub orchestrator: OrchestratorConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable_radio: true,
            radio: RadioTransportConfig::default(),
            enable_wifi: true,
            wifi: StationTransportConfig::default(),
            station: None,
            access_point: None,
            enable_cellular: true,
            cellular: CellularConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_radio(mut self, radio: RadioTransportConfig) -> Self {
        self.radio = radio;
        self.enable_radio = true;
        self
    }

    pub fn with_wifi(mut self, wifi: StationTransportConfig) -> Self {
        self.wifi = wifi;
        self.enable_wifi = true;
        self
    }

    pub fn with_station(mut self, station: StationConfig) -> Self {
        self.station = Some(station);
        self
    }

    pub fn with_access_point(mut self, access_point: AccessPointConfig) -> Self {
        self.access_point = Some(access_point);
        self
    }

    pub fn with_cellular(mut self, cellular: CellularConfig) -> Self {
        self.cellular = cellular;
        self.enable_cellular = true;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn without(mut self, interface: Interface) -> Self {
        match interface {
            Interface::Radio => self.enable_radio = false,
            Interface::Wifi => self.enable_wifi = false,
            Interface::Cellular => self.enable_cellular = false,
        }
        self
    }

    pub fn is_enabled(&self, interface: Interface) -> bool {
        match interface {
            Interface::Radio => self.enable_radio,
            Interface::Wifi => self.enable_wifi,
            Interface::Cellular => self.enable_cellular,
        }
    }

    pub fn enabled_interfaces(&self) -> Vec<Interface> {
        Interface::ALL
            .iter()
            .copied()
            .filter(|i| self.is_enabled(*i))
            .collect()
    }

    /// Short timings for simulated hardware
    pub fn for_simulation() -> Self {
        Self {
            cellular: CellularConfig::for_simulation(),
            ..Self::default()
        }
    }

    /// Validate every enabled part; disabled transports are not checked
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.enabled_interfaces().is_empty() {
            return Err(TransportError::ConfigurationRejected(
                "at least one interface must be enabled".to_string(),
            ));
        }
        if self.enable_radio {
            self.radio.validate()?;
        }
        if self.enable_wifi {
            self.wifi.validate()?;
            if let Some(station) = &self.station {
                station.validate()?;
            }
            if let Some(access_point) = &self.access_point {
                access_point.validate()?;
            }
        }
        if self.enable_cellular {
            self.cellular.validate()?;
        }
        if !self.is_enabled(self.orchestrator.preferred) {
            return Err(TransportError::ConfigurationRejected(format!(
                "preferred interface {} is disabled",
                self.orchestrator.preferred
            )));
        }
        self.orchestrator.validate()?;
        debug!(interfaces = ?self.enabled_interfaces(), "network configuration valid");
        Ok(())
    }
}
