// commhub - failover-capable communication layer
// Packet radio, WiFi and cellular transports behind one orchestrator

pub mod config;
pub mod hal;
pub mod orchestrator;
pub mod stack;
pub mod transport;

pub use config::NetworkConfig;
pub use orchestrator::{CommunicationOrchestrator, OrchestratorConfig, Route};
pub use stack::{NetworkStack, StackHardware};
pub use transport::{Interface, Transport, TransportError};
