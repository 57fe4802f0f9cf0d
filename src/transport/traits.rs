// Transport Traits and Core Types
// Defines the Transport trait and the types shared by the radio, WiFi and cellular transports

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::transport::modem::{CellularStatus, SimStatus};
use crate::transport::radio::RadioMode;
use crate::transport::station::WifiStatus;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Base configuration shared by every transport worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bounded wait for the transport's state mutex, in milliseconds
    pub lock_timeout_ms: u64,
    /// Idle tick of the background worker, in milliseconds
    pub worker_tick_ms: u64,
    /// Capacity of the hardware event channel
    pub event_queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 100,
            worker_tick_ms: 1000,
            event_queue_depth: 10,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    pub fn with_worker_tick(mut self, ms: u64) -> Self {
        self.worker_tick_ms = ms;
        self
    }

    pub fn with_event_queue_depth(mut self, depth: usize) -> Self {
        self.event_queue_depth = depth;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.lock_timeout_ms == 0 {
            return Err(TransportError::ConfigurationRejected(
                "lock_timeout_ms cannot be 0".to_string(),
            ));
        }
        if self.worker_tick_ms == 0 {
            return Err(TransportError::ConfigurationRejected(
                "worker_tick_ms cannot be 0".to_string(),
            ));
        }
        if self.event_queue_depth == 0 {
            return Err(TransportError::ConfigurationRejected(
                "event_queue_depth cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// INTERFACE
// ============================================================================

/// The physical communication channels managed by the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interface {
    Radio,
    Wifi,
    Cellular,
}

impl Interface {
    pub const ALL: [Interface; 3] = [Self::Radio, Self::Wifi, Self::Cellular];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Radio => "radio",
            Self::Wifi => "wifi",
            Self::Cellular => "cellular",
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Interface {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "radio" | "lora" => Ok(Self::Radio),
            "wifi" => Ok(Self::Wifi),
            "cellular" | "modem" => Ok(Self::Cellular),
            other => Err(TransportError::InvalidArgument(format!(
                "unknown interface '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// TRANSPORT STATUS
// ============================================================================

/// Normalized connectivity state common to all transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Error,
}

/// Transport-specific status, tagged by interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportStatus {
    Radio(RadioMode),
    Wifi(WifiStatus),
    Cellular(CellularStatus),
}

impl TransportStatus {
    pub fn interface(&self) -> Interface {
        match self {
            Self::Radio(_) => Interface::Radio,
            Self::Wifi(_) => Interface::Wifi,
            Self::Cellular(_) => Interface::Cellular,
        }
    }

    /// Project the transport-specific status onto the common link states
    pub fn link_state(&self) -> LinkState {
        match self {
            Self::Radio(mode) => match mode {
                RadioMode::Off => LinkState::Disconnected,
                RadioMode::Sleep => LinkState::Degraded,
                RadioMode::Idle | RadioMode::Transmit | RadioMode::Receive => LinkState::Connected,
            },
            Self::Wifi(status) => match status {
                WifiStatus::Disconnected => LinkState::Disconnected,
                WifiStatus::Connecting => LinkState::Connecting,
                WifiStatus::Connected => LinkState::Connected,
                WifiStatus::LostConnection => LinkState::Degraded,
                WifiStatus::Failed => LinkState::Error,
            },
            Self::Cellular(status) => match status {
                CellularStatus::Off | CellularStatus::Disconnected => LinkState::Disconnected,
                CellularStatus::Initializing | CellularStatus::Searching => LinkState::Connecting,
                CellularStatus::Registered => LinkState::Degraded,
                CellularStatus::Connected => LinkState::Connected,
                CellularStatus::Error => LinkState::Error,
            },
        }
    }

    /// Whether the transport can carry traffic right now
    pub fn is_usable(&self) -> bool {
        self.link_state() == LinkState::Connected
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Radio(mode) => write!(f, "radio:{:?}", mode),
            Self::Wifi(status) => write!(f, "wifi:{:?}", status),
            Self::Cellular(status) => write!(f, "cellular:{:?}", status),
        }
    }
}

// ============================================================================
// PACKET
// ============================================================================

/// An inbound message together with its link metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Signal-to-noise ratio in dB (radio only)
    pub snr: Option<f32>,
    /// Carrier frequency offset in Hz (radio only)
    pub frequency_error: Option<f32>,
    pub received_at: DateTime<Utc>,
    pub source: Interface,
    pub valid: bool,
}

impl Packet {
    pub fn new(source: Interface, data: Vec<u8>) -> Self {
        Self {
            data,
            rssi: 0,
            snr: None,
            frequency_error: None,
            received_at: Utc::now(),
            source,
            valid: true,
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_snr(mut self, snr: f32) -> Self {
        self.snr = Some(snr);
        self
    }

    pub fn with_frequency_error(mut self, hz: f32) -> Self {
        self.frequency_error = Some(hz);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Hardware initialization failed: {0}")]
    HardwareInitFailure(String),

    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration rejected: {0}")]
    ConfigurationRejected(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Command '{command}' timed out after {timeout_ms} ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("Command '{command}' rejected: {reason}")]
    CommandRejected { command: String, reason: String },

    #[error("Network registration timed out after {waited_ms} ms")]
    RegistrationTimeout { waited_ms: u64 },

    #[error("SIM not ready: {0:?}")]
    SimNotReady(SimStatus),

    #[error("Integrity check failed")]
    ChecksumMismatch,

    #[error("Timed out waiting for {0} lock")]
    MutexTimeout(&'static str),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("All transports exhausted")]
    AllTransportsExhausted,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::CommandTimeout { .. }
                | Self::RegistrationTimeout { .. }
                | Self::MutexTimeout(_)
        )
    }

    /// Check if the operation can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::CommandTimeout { .. }
                | Self::MutexTimeout(_)
                | Self::SendFailed(_)
                | Self::ConnectionFailed(_)
                | Self::NotConnected
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<postcard::Error> for TransportError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// ============================================================================
// TRANSPORT STATISTICS
// ============================================================================

/// Normalized counters reported by every transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub disconnections: u64,
    /// Protocol-level errors (CRC, command timeouts, failed transmissions)
    pub errors: u64,
    /// Time since start or the last reset
    pub uptime: Duration,
}

impl TransportStats {
    /// Add another transport's counters into this one; uptime keeps the longest
    pub fn accumulate(&mut self, other: &TransportStats) {
        self.messages_sent = self.messages_sent.saturating_add(other.messages_sent);
        self.messages_received = self.messages_received.saturating_add(other.messages_received);
        self.bytes_sent = self.bytes_sent.saturating_add(other.bytes_sent);
        self.bytes_received = self.bytes_received.saturating_add(other.bytes_received);
        self.connection_attempts = self.connection_attempts.saturating_add(other.connection_attempts);
        self.successful_connections = self
            .successful_connections
            .saturating_add(other.successful_connections);
        self.disconnections = self.disconnections.saturating_add(other.disconnections);
        self.errors = self.errors.saturating_add(other.errors);
        self.uptime = self.uptime.max(other.uptime);
    }
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Common surface the orchestrator drives every transport through
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which interface this transport drives
    fn interface(&self) -> Interface;

    /// Latest published status; never takes the transport lock
    fn status(&self) -> TransportStatus;

    /// Subscribe to status changes
    fn subscribe(&self) -> watch::Receiver<TransportStatus>;

    /// Non-blocking availability check
    fn is_available(&self) -> bool {
        self.status().is_usable()
    }

    /// Largest payload accepted by `send`
    fn max_payload(&self) -> usize;

    /// Send one message, returning the number of bytes accepted
    async fn send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Pop the next inbound message, if any is waiting
    async fn try_receive(&self) -> Option<Packet>;

    /// Get normalized statistics
    async fn stats(&self) -> Result<TransportStats, TransportError>;

    /// Zero all counters and rebase uptime
    async fn reset_stats(&self) -> Result<(), TransportError>;
}
