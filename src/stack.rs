// Network Stack - THE BRING-UP
// Starts the enabled transports of a NetworkConfig and puts an orchestrator over them

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::orchestrator::CommunicationOrchestrator;
use crate::transport::{
    Interface, ModemControl, ModemTransport, RadioHardware, RadioTransport, StationTransport,
    Transport, TransportError, WifiDriver,
};

/// Drivers handed to [`NetworkStack::start`]; parts for disabled interfaces may be left out
pub struct StackHardware<R, W, C, S> {
    pub radio: Option<R>,
    pub wifi: Option<W>,
    pub modem: Option<(S, C)>,
}

impl<R, W, C, S> Default for StackHardware<R, W, C, S> {
    fn default() -> Self {
        Self {
            radio: None,
            wifi: None,
            modem: None,
        }
    }
}

impl<R, W, C, S> StackHardware<R, W, C, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_radio(mut self, radio: R) -> Self {
        self.radio = Some(radio);
        self
    }

    pub fn with_wifi(mut self, wifi: W) -> Self {
        self.wifi = Some(wifi);
        self
    }

    pub fn with_modem(mut self, serial: S, control: C) -> Self {
        self.modem = Some((serial, control));
        self
    }
}

/// Transports started from one [`NetworkConfig`] and the orchestrator routing over them
pub struct NetworkStack<S> {
    pub orchestrator: Arc<CommunicationOrchestrator>,
    pub radio: Option<Arc<RadioTransport>>,
    pub wifi: Option<Arc<StationTransport>>,
    pub modem: Option<Arc<ModemTransport<S>>>,
}

impl<S> NetworkStack<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Bring up every enabled interface that has hardware.
    ///
    /// A transport that fails to start is left out; one that starts but cannot
    /// join its network is kept so it can recover later. Fails only when no
    /// transport started at all.
    pub async fn start<R, W, C>(
        config: &NetworkConfig,
        hardware: StackHardware<R, W, C, S>,
    ) -> Result<Self, TransportError>
    where
        R: RadioHardware,
        W: WifiDriver,
        C: ModemControl,
    {
        config.validate()?;

        let radio = match enabled_part(config, Interface::Radio, hardware.radio) {
            Some(chip) => tolerate(Interface::Radio, async {
                RadioTransport::start(chip, config.radio.clone()).map(Arc::new)
            })
            .await,
            None => None,
        };

        let wifi = match enabled_part(config, Interface::Wifi, hardware.wifi) {
            Some(driver) => tolerate(Interface::Wifi, start_wifi(config, driver)).await,
            None => None,
        };

        let modem = match enabled_part(config, Interface::Cellular, hardware.modem) {
            Some((serial, control)) => tolerate(Interface::Cellular, start_modem(config, serial, control)).await,
            None => None,
        };

        let mut builder = CommunicationOrchestrator::builder().with_config(config.orchestrator.clone());
        if let Some(wifi) = &wifi {
            let transport: Arc<dyn Transport> = wifi.clone();
            builder = builder.with_transport(transport);
        }
        if let Some(modem) = &modem {
            let transport: Arc<dyn Transport> = modem.clone();
            builder = builder.with_transport(transport);
        }
        if let Some(radio) = &radio {
            let transport: Arc<dyn Transport> = radio.clone();
            builder = builder.with_transport(transport);
        }
        if radio.is_none() && wifi.is_none() && modem.is_none() {
            return Err(TransportError::HardwareInitFailure(
                "no interface came up".to_string(),
            ));
        }

        let orchestrator = Arc::new(builder.build()?);
        orchestrator.start().await?;
        info!(
            interfaces = ?orchestrator.interfaces(),
            active = ?orchestrator.active_interface().await?,
            "network stack up"
        );

        Ok(Self {
            orchestrator,
            radio,
            wifi,
            modem,
        })
    }

    /// Stop the orchestrator, then every transport; the first error is reported
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.orchestrator.shutdown().await;

        let mut first_error = None;
        if let Some(radio) = &self.radio {
            if let Err(e) = radio.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(wifi) = &self.wifi {
            if let Err(e) = wifi.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(modem) = &self.modem {
            if let Err(e) = modem.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        info!("network stack down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn enabled_part<T>(config: &NetworkConfig, interface: Interface, part: Option<T>) -> Option<T> {
    if !config.is_enabled(interface) {
        debug!(%interface, "interface disabled, not started");
        return None;
    }
    if part.is_none() {
        warn!(%interface, "interface enabled but no hardware given");
    }
    part
}

async fn tolerate<T>(
    interface: Interface,
    bring_up: impl Future<Output = Result<T, TransportError>>,
) -> Option<T> {
    match bring_up.await {
        Ok(part) => Some(part),
        Err(e) => {
            warn!(%interface, error = %e, "interface failed to start");
            None
        }
    }
}

async fn start_wifi<W: WifiDriver>(
    config: &NetworkConfig,
    driver: W,
) -> Result<Arc<StationTransport>, TransportError> {
    let wifi = Arc::new(StationTransport::start(driver, config.wifi.clone())?);

    if let Some(access_point) = config.access_point.clone() {
        if let Err(e) = wifi.start_ap(access_point).await {
            warn!(error = %e, "access point did not start");
        }
    }
    if let Some(station) = config.station.clone() {
        let wait = Duration::from_millis(station.connect_timeout_ms).saturating_mul(2);
        if let Err(e) = wifi.connect_and_wait(station, None, wait).await {
            warn!(error = %e, "wifi station did not join at start-up");
        }
    }
    Ok(wifi)
}

async fn start_modem<S, C>(
    config: &NetworkConfig,
    serial: S,
    control: C,
) -> Result<Arc<ModemTransport<S>>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: ModemControl,
{
    let modem = Arc::new(ModemTransport::start(serial, control, config.cellular.clone())?);

    let online = async {
        modem.power_on().await?;
        modem.connect(None).await
    }
    .await;
    if let Err(e) = online {
        warn!(error = %e, "cellular link did not come up at start-up");
    }
    Ok(modem)
}
