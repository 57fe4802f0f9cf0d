// Cellular Configuration
// APN, power sequencing and timing settings for the AT modem

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::transport::{TransportConfig, TransportError};

/// Authentication used for the PDP context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApnAuth {
    None,
    Pap,
    Chap,
}

impl ApnAuth {
    /// Code expected by `AT+CGAUTH`
    pub fn code(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Pap => 1,
            Self::Chap => 2,
        }
    }
}

/// Access point name and credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApnConfig {
    pub apn: String,
    pub username: String,
    pub password: String,
    pub auth: ApnAuth,
}

impl Default for ApnConfig {
    fn default() -> Self {
        Self {
            apn: "internet".to_string(),
            username: String::new(),
            password: String::new(),
            auth: ApnAuth::Pap,
        }
    }
}

impl ApnConfig {
    pub fn new(apn: &str) -> Self {
        Self {
            apn: apn.to_string(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str, auth: ApnAuth) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self.auth = auth;
        self
    }
}

/// Transport protocol of the socket data path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// Remote peer for the modem's socket data path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEndpoint {
    pub protocol: SocketProtocol,
    pub host: String,
    pub port: u16,
}

impl DataEndpoint {
    pub fn udp(host: &str, port: u16) -> Self {
        Self {
            protocol: SocketProtocol::Udp,
            host: host.to_string(),
            port,
        }
    }

    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            protocol: SocketProtocol::Tcp,
            host: host.to_string(),
            port,
        }
    }
}

/// Pulse widths of the reset and power-key lines, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerTiming {
    pub reset_pulse_ms: u64,
    pub reset_settle_ms: u64,
    pub power_key_pulse_ms: u64,
    pub boot_wait_ms: u64,
    pub power_off_command_ms: u64,
    pub power_off_pulse_ms: u64,
    pub power_cycle_pause_ms: u64,
}

impl Default for PowerTiming {
    fn default() -> Self {
        Self {
            reset_pulse_ms: 100,
            reset_settle_ms: 100,
            power_key_pulse_ms: 1000,
            boot_wait_ms: 2000,
            power_off_command_ms: 5000,
            power_off_pulse_ms: 3000,
            power_cycle_pause_ms: 5000,
        }
    }
}

impl PowerTiming {
    /// Zero-length pulses for simulated hardware
    pub fn immediate() -> Self {
        Self {
            reset_pulse_ms: 0,
            reset_settle_ms: 0,
            power_key_pulse_ms: 0,
            boot_wait_ms: 0,
            power_off_command_ms: 200,
            power_off_pulse_ms: 0,
            power_cycle_pause_ms: 0,
        }
    }
}

const SUPPORTED_BAUD_RATES: [u32; 8] = [9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600];

/// Configuration of the cellular transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellularConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    pub pin: Option<String>,
    pub apn: ApnConfig,
    pub baud_rate: u32,
    pub command_timeout_ms: u64,
    /// Bounded wait for the serial link before a command gives up
    pub link_lock_timeout_ms: u64,
    pub registration_timeout_ms: u64,
    pub registration_poll_ms: u64,
    pub power_on_attempts: u32,
    pub power_on_retry_ms: u64,
    pub power: PowerTiming,
    pub sms_timeout_ms: u64,
    /// Timeout for SMS listing and other storage reads
    pub storage_timeout_ms: u64,
    pub pdp_timeout_ms: u64,
    pub data_timeout_ms: u64,
    pub keepalive_ms: u64,
    /// How long an idle poll listens for unsolicited traffic
    pub idle_read_ms: u64,
    pub data_endpoint: Option<DataEndpoint>,
}

impl Default for CellularConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default().with_worker_tick(100),
            pin: None,
            apn: ApnConfig::default(),
            baud_rate: 115_200,
            command_timeout_ms: 1000,
            link_lock_timeout_ms: 1000,
            registration_timeout_ms: 30_000,
            registration_poll_ms: 1000,
            power_on_attempts: 10,
            power_on_retry_ms: 1000,
            power: PowerTiming::default(),
            sms_timeout_ms: 30_000,
            storage_timeout_ms: 5000,
            pdp_timeout_ms: 30_000,
            data_timeout_ms: 10_000,
            keepalive_ms: 60_000,
            idle_read_ms: 20,
            data_endpoint: None,
        }
    }
}

impl CellularConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self
    }

    pub fn with_apn(mut self, apn: ApnConfig) -> Self {
        self.apn = apn;
        self
    }

    pub fn with_baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    pub fn with_command_timeout(mut self, ms: u64) -> Self {
        self.command_timeout_ms = ms;
        self
    }

    pub fn with_registration_timeout(mut self, ms: u64) -> Self {
        self.registration_timeout_ms = ms;
        self
    }

    pub fn with_registration_poll(mut self, ms: u64) -> Self {
        self.registration_poll_ms = ms;
        self
    }

    pub fn with_power_on_attempts(mut self, attempts: u32, retry_ms: u64) -> Self {
        self.power_on_attempts = attempts;
        self.power_on_retry_ms = retry_ms;
        self
    }

    pub fn with_power_timing(mut self, timing: PowerTiming) -> Self {
        self.power = timing;
        self
    }

    pub fn with_sms_timeout(mut self, ms: u64) -> Self {
        self.sms_timeout_ms = ms;
        self
    }

    pub fn with_keepalive(mut self, ms: u64) -> Self {
        self.keepalive_ms = ms;
        self
    }

    pub fn with_data_endpoint(mut self, endpoint: DataEndpoint) -> Self {
        self.data_endpoint = Some(endpoint);
        self
    }

    /// Short timings for simulated modems
    pub fn for_simulation() -> Self {
        Self {
            base: TransportConfig::default()
                .with_worker_tick(10)
                .with_lock_timeout(500),
            command_timeout_ms: 200,
            registration_timeout_ms: 1000,
            registration_poll_ms: 20,
            power_on_attempts: 3,
            power_on_retry_ms: 20,
            power: PowerTiming::immediate(),
            sms_timeout_ms: 500,
            storage_timeout_ms: 500,
            pdp_timeout_ms: 500,
            data_timeout_ms: 500,
            ..Self::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        self.base.validate()?;
        let reject = |msg: String| Err(TransportError::ConfigurationRejected(msg));

        if self.apn.apn.is_empty() {
            return reject("APN cannot be empty".to_string());
        }
        if let Some(pin) = &self.pin {
            if !(4..=8).contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
                return reject("PIN must be 4-8 digits".to_string());
            }
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return reject(format!("unsupported baud rate {}", self.baud_rate));
        }
        if self.command_timeout_ms == 0 || self.registration_timeout_ms == 0 {
            return reject("timeouts cannot be 0".to_string());
        }
        if self.power_on_attempts == 0 {
            return reject("power_on_attempts cannot be 0".to_string());
        }
        if let Some(endpoint) = &self.data_endpoint {
            if endpoint.host.is_empty() || endpoint.port == 0 {
                return reject("data endpoint needs a host and a non-zero port".to_string());
            }
        }
        Ok(())
    }
}
