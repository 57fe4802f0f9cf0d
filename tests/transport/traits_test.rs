// Transport Trait Tests
// Shared types: interfaces, status projection, packets, errors and statistics

use commhub::transport::modem::{CellularStatus, SimStatus};
use commhub::transport::{
    Interface, LinkState, Packet, RadioMode, TransportConfig, TransportError, TransportStats,
    TransportStatus, WifiStatus,
};
use std::time::Duration;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

#[test]
fn test_transport_config_default() {
    let config = TransportConfig::default();

    assert_eq!(config.lock_timeout_ms, 100);
    assert_eq!(config.worker_tick_ms, 1000);
    assert_eq!(config.event_queue_depth, 10);
    assert!(config.validate().is_ok());
}

#[test]
fn test_transport_config_builder() {
    let config = TransportConfig::new()
        .with_lock_timeout(50)
        .with_worker_tick(20)
        .with_event_queue_depth(4);

    assert_eq!(config.lock_timeout(), Duration::from_millis(50));
    assert_eq!(config.worker_tick(), Duration::from_millis(20));
    assert_eq!(config.event_queue_depth, 4);
}

#[test]
fn test_transport_config_rejects_zeroes() {
    assert!(TransportConfig::new().with_lock_timeout(0).validate().is_err());
    assert!(TransportConfig::new().with_worker_tick(0).validate().is_err());
    assert!(matches!(
        TransportConfig::new().with_event_queue_depth(0).validate(),
        Err(TransportError::ConfigurationRejected(_))
    ));
}

// ============================================================================
// INTERFACE
// ============================================================================

#[test]
fn test_interface_names() {
    assert_eq!(Interface::Radio.to_string(), "radio");
    assert_eq!(Interface::Wifi.to_string(), "wifi");
    assert_eq!(Interface::Cellular.to_string(), "cellular");
}

#[test]
fn test_interface_parse() {
    assert_eq!("WiFi".parse::<Interface>().unwrap(), Interface::Wifi);
    assert_eq!("lora".parse::<Interface>().unwrap(), Interface::Radio);
    assert_eq!("modem".parse::<Interface>().unwrap(), Interface::Cellular);
    assert!(matches!(
        "ethernet".parse::<Interface>(),
        Err(TransportError::InvalidArgument(_))
    ));
}

// ============================================================================
// STATUS PROJECTION
// ============================================================================

#[test]
fn test_radio_status_projection() {
    assert_eq!(TransportStatus::Radio(RadioMode::Off).link_state(), LinkState::Disconnected);
    assert_eq!(TransportStatus::Radio(RadioMode::Sleep).link_state(), LinkState::Degraded);
    assert!(TransportStatus::Radio(RadioMode::Idle).is_usable());
    assert!(TransportStatus::Radio(RadioMode::Receive).is_usable());
    assert!(!TransportStatus::Radio(RadioMode::Sleep).is_usable());
}

#[test]
fn test_wifi_status_projection() {
    assert!(TransportStatus::Wifi(WifiStatus::Connected).is_usable());
    assert_eq!(
        TransportStatus::Wifi(WifiStatus::LostConnection).link_state(),
        LinkState::Degraded
    );
    assert_eq!(TransportStatus::Wifi(WifiStatus::Failed).link_state(), LinkState::Error);
    assert!(!TransportStatus::Wifi(WifiStatus::Connecting).is_usable());
}

#[test]
fn test_cellular_status_projection() {
    assert!(TransportStatus::Cellular(CellularStatus::Connected).is_usable());
    // Registered without a data bearer cannot carry payloads
    assert!(!TransportStatus::Cellular(CellularStatus::Registered).is_usable());
    assert_eq!(
        TransportStatus::Cellular(CellularStatus::Searching).link_state(),
        LinkState::Connecting
    );
    assert_eq!(
        TransportStatus::Cellular(CellularStatus::Off).link_state(),
        LinkState::Disconnected
    );
}

#[test]
fn test_status_reports_interface() {
    assert_eq!(TransportStatus::Radio(RadioMode::Idle).interface(), Interface::Radio);
    assert_eq!(TransportStatus::Wifi(WifiStatus::Failed).interface(), Interface::Wifi);
    assert_eq!(
        TransportStatus::Cellular(CellularStatus::Error).interface(),
        Interface::Cellular
    );
    assert_eq!(TransportStatus::Wifi(WifiStatus::Connected).to_string(), "wifi:Connected");
}

// ============================================================================
// PACKET
// ============================================================================

#[test]
fn test_packet_builder() {
    let packet = Packet::new(Interface::Radio, vec![1, 2, 3])
        .with_rssi(-98)
        .with_snr(7.25)
        .with_frequency_error(-120.0);

    assert_eq!(packet.len(), 3);
    assert!(!packet.is_empty());
    assert!(packet.valid);
    assert_eq!(packet.rssi, -98);
    assert_eq!(packet.snr, Some(7.25));
    assert_eq!(packet.frequency_error, Some(-120.0));
    assert_eq!(packet.source, Interface::Radio);
}

#[test]
fn test_packet_without_radio_metadata() {
    let packet = Packet::new(Interface::Wifi, Vec::new());

    assert!(packet.is_empty());
    assert_eq!(packet.snr, None);
    assert_eq!(packet.frequency_error, None);
}

// ============================================================================
// ERRORS
// ============================================================================

#[test]
fn test_error_classification() {
    assert!(TransportError::MutexTimeout("radio").is_timeout());
    assert!(TransportError::RegistrationTimeout { waited_ms: 10 }.is_timeout());
    assert!(TransportError::CommandTimeout {
        command: "AT".to_string(),
        timeout_ms: 5
    }
    .is_retryable());
    assert!(TransportError::NotConnected.is_retryable());
    assert!(!TransportError::InvalidArgument("x".to_string()).is_retryable());
    assert!(!TransportError::SimNotReady(SimStatus::PinRequired).is_retryable());
}

#[test]
fn test_error_messages() {
    let err = TransportError::CommandRejected {
        command: "AT+CPIN?".to_string(),
        reason: "SIM not inserted".to_string(),
    };
    assert_eq!(err.to_string(), "Command 'AT+CPIN?' rejected: SIM not inserted");
    assert_eq!(TransportError::AllTransportsExhausted.to_string(), "All transports exhausted");
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "serial gone");
    let err: TransportError = io.into();
    assert!(matches!(err, TransportError::Io(msg) if msg.contains("serial gone")));
}

// ============================================================================
// STATISTICS
// ============================================================================

#[test]
fn test_stats_accumulate() {
    let mut total = TransportStats::default();
    total.accumulate(&TransportStats {
        messages_sent: 2,
        bytes_sent: 40,
        uptime: Duration::from_secs(3),
        ..TransportStats::default()
    });
    total.accumulate(&TransportStats {
        messages_sent: 1,
        errors: 4,
        uptime: Duration::from_secs(9),
        ..TransportStats::default()
    });

    assert_eq!(total.messages_sent, 3);
    assert_eq!(total.bytes_sent, 40);
    assert_eq!(total.errors, 4);
    assert_eq!(total.uptime, Duration::from_secs(9));
}

#[test]
fn test_stats_accumulate_saturates() {
    let mut total = TransportStats {
        bytes_received: u64::MAX - 1,
        ..TransportStats::default()
    };
    total.accumulate(&TransportStats {
        bytes_received: 10,
        ..TransportStats::default()
    });
    assert_eq!(total.bytes_received, u64::MAX);
}
