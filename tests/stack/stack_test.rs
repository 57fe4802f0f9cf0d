// Network Stack Tests
// Bring-up from a NetworkConfig: enable flags, soft AP start and partial hardware

use commhub::hal::{SimModem, SimModemControl, SimRadio, SimWifi, SimWifiHandle};
use commhub::orchestrator::{OrchestratorConfig, Route};
use commhub::transport::modem::DataEndpoint;
use commhub::transport::{
    AccessPointConfig, Interface, StationConfig, TransportError, WifiMode, WifiStatus,
};
use commhub::{NetworkConfig, NetworkStack, StackHardware};
use tokio::io::DuplexStream;

type SimHardware = StackHardware<SimRadio, SimWifi, SimModemControl, DuplexStream>;

fn sim_wifi() -> (SimWifi, SimWifiHandle) {
    let (driver, handle) = SimWifi::new();
    handle.add_network("FieldNet", "fieldpass1", -50, 6, 3);
    (driver, handle)
}

fn field_config() -> NetworkConfig {
    NetworkConfig::for_simulation()
        .with_station(StationConfig::new("FieldNet", "fieldpass1").with_connect_timeout(500))
}

fn full_hardware() -> (SimHardware, SimWifiHandle) {
    let (chip, _radio) = SimRadio::new();
    let (driver, wifi) = sim_wifi();
    let (serial, control, _modem) = SimModem::spawn();
    let hardware = StackHardware::new()
        .with_radio(chip)
        .with_wifi(driver)
        .with_modem(serial, control);
    (hardware, wifi)
}

// ============================================================================
// ENABLE FLAGS
// ============================================================================

#[tokio::test]
async fn test_disabled_interface_is_not_started() {
    let config = field_config().without(Interface::Cellular);
    let (hardware, _wifi) = full_hardware();

    let stack = NetworkStack::start(&config, hardware).await.unwrap();

    assert!(stack.modem.is_none());
    assert!(stack.radio.is_some());
    assert_eq!(
        stack.orchestrator.interfaces(),
        vec![Interface::Wifi, Interface::Radio]
    );
    assert_eq!(
        stack.orchestrator.active_interface().await.unwrap(),
        Some(Interface::Wifi)
    );
    assert!(matches!(
        stack.orchestrator.send(b"x", Route::Only(Interface::Cellular)).await,
        Err(TransportError::InvalidArgument(_))
    ));

    stack.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_every_enabled_interface_comes_up() {
    let mut config = field_config();
    config.cellular = config
        .cellular
        .with_data_endpoint(DataEndpoint::udp("203.0.113.10", 5000));
    let (hardware, _wifi) = full_hardware();

    let stack = NetworkStack::start(&config, hardware).await.unwrap();

    assert_eq!(
        stack.orchestrator.interfaces(),
        vec![Interface::Wifi, Interface::Cellular, Interface::Radio]
    );
    assert!(stack.orchestrator.is_interface_available(Interface::Wifi));
    assert!(stack.orchestrator.is_interface_available(Interface::Cellular));
    assert!(stack.orchestrator.is_interface_available(Interface::Radio));

    stack.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_disable_moves_traffic() {
    let config = field_config().without(Interface::Cellular);
    let (hardware, wifi) = full_hardware();
    let stack = NetworkStack::start(&config, hardware).await.unwrap();

    stack
        .orchestrator
        .enable_interface(Interface::Wifi, false)
        .await
        .unwrap();

    assert_eq!(
        stack.orchestrator.send(b"reading", Route::Auto).await.unwrap(),
        Interface::Radio
    );
    assert!(wifi.sent().is_empty());

    stack.shutdown().await.unwrap();
}

// ============================================================================
// WIFI START-UP
// ============================================================================

#[tokio::test]
async fn test_access_point_started_from_config() {
    let config = field_config()
        .without(Interface::Cellular)
        .with_access_point(AccessPointConfig::new("Hub-AP", "hubsecret").with_channel(6));
    let (hardware, wifi) = full_hardware();

    let stack = NetworkStack::start(&config, hardware).await.unwrap();

    assert_eq!(wifi.access_point().map(|ap| ap.ssid), Some("Hub-AP".to_string()));
    assert_eq!(wifi.mode(), WifiMode::StationAndAp);
    let station = stack.wifi.as_ref().unwrap();
    assert_eq!(station.wifi_status(), WifiStatus::Connected);
    assert_eq!(station.mode().await.unwrap(), WifiMode::StationAndAp);

    stack.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_station_that_cannot_join_is_kept() {
    let config = NetworkConfig::for_simulation()
        .with_station(StationConfig::new("FieldNet", "wrongpass1").with_connect_timeout(500))
        .without(Interface::Cellular);
    let (hardware, _wifi) = full_hardware();

    let stack = NetworkStack::start(&config, hardware).await.unwrap();

    assert!(stack.orchestrator.interfaces().contains(&Interface::Wifi));
    assert_eq!(stack.wifi.as_ref().unwrap().wifi_status(), WifiStatus::Failed);
    assert_eq!(
        stack.orchestrator.active_interface().await.unwrap(),
        Some(Interface::Radio)
    );

    stack.shutdown().await.unwrap();
}

// ============================================================================
// PARTIAL HARDWARE
// ============================================================================

#[tokio::test]
async fn test_missing_hardware_is_skipped() {
    let (chip, _radio) = SimRadio::new();
    let hardware = SimHardware::new().with_radio(chip);

    let stack = NetworkStack::start(&field_config(), hardware).await.unwrap();

    assert!(stack.wifi.is_none());
    assert!(stack.modem.is_none());
    assert_eq!(stack.orchestrator.interfaces(), vec![Interface::Radio]);
    assert_eq!(
        stack.orchestrator.active_interface().await.unwrap(),
        Some(Interface::Radio)
    );

    stack.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nothing_started_is_an_error() {
    let config = NetworkConfig::for_simulation()
        .without(Interface::Wifi)
        .without(Interface::Cellular)
        .with_orchestrator(OrchestratorConfig::new().with_preferred(Interface::Radio));
    let (driver, _wifi) = sim_wifi();
    let hardware = SimHardware::new().with_wifi(driver);

    let result = NetworkStack::start(&config, hardware).await;
    assert!(matches!(result, Err(TransportError::HardwareInitFailure(_))));
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_start() {
    let config = field_config().without(Interface::Wifi);
    let (hardware, wifi) = full_hardware();

    let result = NetworkStack::start(&config, hardware).await;

    // Preferred interface is wifi, which is disabled
    assert!(matches!(result, Err(TransportError::ConfigurationRejected(_))));
    assert_eq!(wifi.associations(), 0);
}
