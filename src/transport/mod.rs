// Transport module - THE WIRE (abstract)
// Uniform surface over the packet radio, WiFi station/AP and cellular modem transports

mod guard;
mod traits;

pub mod modem;
pub mod radio;
pub mod station;

pub use traits::{
    // Core trait
    Transport,
    // Configuration
    TransportConfig,
    // Interfaces and status
    Interface, LinkState, TransportStatus,
    // Data
    Packet,
    // Errors and statistics
    TransportError, TransportStats,
};

pub use guard::{lock_with_timeout, Shutdown, ShutdownListener, UptimeClock};

pub use radio::{
    RadioConfig, RadioEvent, RadioFault, RadioFrame, RadioHardware, RadioIrq, RadioMode,
    RadioParam, RadioStats, RadioTransport, RadioTransportConfig, ReceiveCallback,
    TransmitCallback, MAX_RADIO_PAYLOAD,
};

pub use station::{
    AccessPointConfig, DriverFault, IpSettings, LinkInfo, ScanCallback, ScanRecord, StationConfig,
    StationStats, StationTransport, StationTransportConfig, WifiDriver, WifiEvent,
    WifiEventCallback, WifiEventSender, WifiMode, WifiNetwork, WifiSecurity, WifiStatus, MAX_WIFI_PAYLOAD,
    REASON_ASSOC_LEAVE,
};

pub use modem::{
    CellularConfig, CellularStatus, ModemControl, ModemStats, ModemTransport, SimStatus,
};
