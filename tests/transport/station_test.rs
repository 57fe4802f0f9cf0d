// WiFi Station Transport Tests
// Association, automatic reconnection, scanning and access point control on the simulated stack

use commhub::hal::{SimWifi, SimWifiHandle};
use commhub::transport::{
    AccessPointConfig, Interface, StationConfig, StationTransport, StationTransportConfig,
    Transport, TransportConfig, TransportError, WifiEvent, WifiEventCallback, WifiMode,
    WifiNetwork, WifiSecurity, WifiStatus, MAX_WIFI_PAYLOAD,
};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const SSID: &str = "FieldNet";
const PASSWORD: &str = "fieldpass1";

fn start_station() -> (StationTransport, SimWifiHandle) {
    let (driver, handle) = SimWifi::new();
    handle.add_network(SSID, PASSWORD, -48, 6, 3);
    handle.add_network("Cafe-Guest", "", -75, 11, 0);
    let config = StationTransportConfig::new()
        .with_base_config(TransportConfig::new().with_worker_tick(10).with_event_queue_depth(20));
    let station = StationTransport::start(driver, config).unwrap();
    (station, handle)
}

fn station_config() -> StationConfig {
    StationConfig::new(SSID, PASSWORD)
        .with_connect_timeout(500)
        .with_reconnect_cooldown(20)
        .with_max_retries(2)
}

async fn connected_station() -> (StationTransport, SimWifiHandle) {
    let (station, handle) = start_station();
    station
        .connect_and_wait(station_config(), None, Duration::from_secs(2))
        .await
        .unwrap();
    (station, handle)
}

async fn wait_for(station: &StationTransport, status: WifiStatus) {
    let mut rx = station.subscribe();
    let reached = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if station.wifi_status() == status {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "station never reached {:?}", status);
    assert_eq!(station.wifi_status(), status);
}

/// A link is never re-entered without first reporting that it went down
fn assert_no_connected_to_connecting(statuses: &[WifiStatus]) {
    for pair in statuses.windows(2) {
        assert!(
            pair != [WifiStatus::Connected, WifiStatus::Connecting],
            "connected link restarted without a disconnect: {:?}",
            statuses
        );
    }
}

fn recording_callback() -> (WifiEventCallback, Arc<Mutex<Vec<(WifiStatus, String)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let callback: WifiEventCallback = Arc::new(move |status: WifiStatus, info: &str| {
        sink.lock().unwrap().push((status, info.to_string()));
    });
    (callback, log)
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn test_station_config_defaults() {
    let config = StationConfig::new(SSID, PASSWORD);

    assert!(config.auto_reconnect);
    assert_eq!(config.connect_timeout_ms, 10_000);
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.reconnect_cooldown_ms, 5_000);
    assert!(config.validate().is_ok());
}

#[test]
fn test_station_config_rejects_bad_credentials() {
    assert!(StationConfig::new("", PASSWORD).validate().is_err());
    assert!(StationConfig::new(&"x".repeat(33), PASSWORD).validate().is_err());
    assert!(StationConfig::new(SSID, "short").validate().is_err());
    assert!(StationConfig::new(SSID, &"p".repeat(65)).validate().is_err());
    // Open networks take an empty password
    assert!(StationConfig::new(SSID, "").validate().is_ok());
}

#[test]
fn test_access_point_config_limits() {
    assert!(AccessPointConfig::new("Hub-AP", "hubpass99").validate().is_ok());
    assert!(AccessPointConfig::new("Hub-AP", "hubpass99")
        .with_channel(14)
        .validate()
        .is_err());
    assert!(AccessPointConfig::new("Hub-AP", "hubpass99")
        .with_max_clients(0)
        .validate()
        .is_err());
    assert!(AccessPointConfig::new("Hub-AP", "hubpass99")
        .with_max_clients(11)
        .validate()
        .is_err());
}

// ============================================================================
// CONNECTION
// ============================================================================

#[tokio::test]
async fn test_connect_reaches_connected() {
    let (station, handle) = start_station();
    let (callback, log) = recording_callback();

    assert_eq!(station.interface(), Interface::Wifi);
    assert!(!station.is_available());

    station
        .connect_and_wait(station_config(), Some(callback), Duration::from_secs(2))
        .await
        .unwrap();

    assert!(station.is_available());
    assert_eq!(station.mode().await.unwrap(), WifiMode::Station);
    assert_eq!(handle.mode(), WifiMode::Station);
    assert_eq!(station.ssid().await.unwrap(), Some(SSID.to_string()));
    assert_eq!(station.rssi().await.unwrap(), Some(-48));
    assert_eq!(station.channel().await.unwrap(), Some(6));
    assert_eq!(station.mac_address().await.unwrap(), "02:00:00:5e:00:01");

    // Callbacks run after the status is published
    tokio::time::sleep(Duration::from_millis(30)).await;
    let statuses: Vec<WifiStatus> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(statuses, vec![WifiStatus::Connecting, WifiStatus::Connected]);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dhcp_address_is_recorded() {
    let (station, _handle) = connected_station().await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(
        station.ip_address().await.unwrap(),
        Some(Ipv4Addr::new(192, 168, 1, 50))
    );

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_static_address_is_applied() {
    let (station, _handle) = start_station();
    let config = station_config().with_static_ip(
        Ipv4Addr::new(10, 0, 0, 20),
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(255, 255, 255, 0),
    );
    station
        .connect_and_wait(config, None, Duration::from_secs(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(
        station.ip_address().await.unwrap(),
        Some(Ipv4Addr::new(10, 0, 0, 20))
    );

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_fails() {
    let (station, _handle) = start_station();

    let result = station
        .connect_and_wait(
            StationConfig::new(SSID, "not-the-password"),
            None,
            Duration::from_secs(2),
        )
        .await;

    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    assert_eq!(station.wifi_status(), WifiStatus::Failed);
    assert!(!station.is_available());

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_network_fails() {
    let (station, _handle) = start_station();

    let result = station
        .connect_and_wait(
            StationConfig::new("Nowhere", PASSWORD),
            None,
            Duration::from_secs(2),
        )
        .await;
    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_rejects_invalid_config() {
    let (station, handle) = start_station();

    let result = station.connect(StationConfig::new("", PASSWORD), None).await;
    assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
    assert_eq!(station.wifi_status(), WifiStatus::Disconnected);
    assert_eq!(handle.associations(), 0);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_driver_times_out() {
    let (station, handle) = start_station();
    handle.set_auto_respond(false);

    station
        .connect(station_config().with_connect_timeout(50), None)
        .await
        .unwrap();
    assert_eq!(station.wifi_status(), WifiStatus::Connecting);

    wait_for(&station, WifiStatus::Failed).await;

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (station, _handle) = connected_station().await;

    station.disconnect().await.unwrap();
    assert_eq!(station.wifi_status(), WifiStatus::Disconnected);
    assert_eq!(station.ssid().await.unwrap(), None);
    assert_eq!(station.ip_address().await.unwrap(), None);

    station.disconnect().await.unwrap();
    assert_eq!(station.wifi_status(), WifiStatus::Disconnected);

    let stats = station.station_stats().await.unwrap();
    assert_eq!(stats.disconnections, 1);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_while_connected_leaves_first() {
    let (station, handle) = start_station();
    let (callback, log) = recording_callback();

    station
        .connect_and_wait(station_config(), Some(callback), Duration::from_secs(2))
        .await
        .unwrap();
    station
        .connect_and_wait(station_config(), None, Duration::from_secs(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let statuses: Vec<WifiStatus> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        statuses,
        vec![
            WifiStatus::Connecting,
            WifiStatus::Connected,
            WifiStatus::Disconnected,
            WifiStatus::Connecting,
            WifiStatus::Connected,
        ]
    );
    assert_no_connected_to_connecting(&statuses);
    assert_eq!(station.wifi_status(), WifiStatus::Connected);
    assert_eq!(handle.associations(), 2);

    let stats = station.station_stats().await.unwrap();
    assert_eq!(stats.disconnections, 1);
    assert_eq!(stats.successful_connections, 2);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_switching_networks_keeps_transition_order() {
    let (station, _handle) = start_station();
    let (callback, log) = recording_callback();

    station
        .connect_and_wait(station_config(), Some(callback), Duration::from_secs(2))
        .await
        .unwrap();
    station
        .connect_and_wait(StationConfig::new("Cafe-Guest", ""), None, Duration::from_secs(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(station.ssid().await.unwrap(), Some("Cafe-Guest".to_string()));
    let statuses: Vec<WifiStatus> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_no_connected_to_connecting(&statuses);
    assert_eq!(statuses.last(), Some(&WifiStatus::Connected));
    assert_eq!(station.station_stats().await.unwrap().disconnections, 1);

    station.shutdown().await.unwrap();
}

// ============================================================================
// RECONNECTION
// ============================================================================

#[tokio::test]
async fn test_lost_link_reconnects() {
    let (station, handle) = connected_station().await;

    handle.drop_link();
    wait_for(&station, WifiStatus::LostConnection).await;
    assert!(!station.is_available());

    wait_for(&station, WifiStatus::Connected).await;
    let stats = station.station_stats().await.unwrap();
    assert_eq!(stats.disconnections, 1);
    assert_eq!(stats.reconnections, 1);
    assert_eq!(stats.successful_connections, 2);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lost_link_transition_order() {
    let (station, handle) = start_station();
    let (callback, log) = recording_callback();
    station
        .connect_and_wait(station_config(), Some(callback), Duration::from_secs(2))
        .await
        .unwrap();

    handle.drop_link();
    wait_for(&station, WifiStatus::LostConnection).await;
    wait_for(&station, WifiStatus::Connected).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let statuses: Vec<WifiStatus> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        statuses,
        vec![
            WifiStatus::Connecting,
            WifiStatus::Connected,
            WifiStatus::LostConnection,
            WifiStatus::Connecting,
            WifiStatus::Connected,
        ]
    );
    assert_no_connected_to_connecting(&statuses);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_driver_rejoin_reports_connecting() {
    let (station, handle) = start_station();
    let (callback, log) = recording_callback();
    station
        .connect_and_wait(
            station_config().with_auto_reconnect(false),
            Some(callback),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    handle.drop_link();
    wait_for(&station, WifiStatus::LostConnection).await;
    // The driver rejoins without being asked
    handle.emit(WifiEvent::StationConnected);
    wait_for(&station, WifiStatus::Connected).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let statuses: Vec<WifiStatus> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        &statuses[2..],
        &[WifiStatus::LostConnection, WifiStatus::Connecting, WifiStatus::Connected]
    );
    assert_eq!(station.station_stats().await.unwrap().successful_connections, 2);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_gives_up_after_retries() {
    let (station, handle) = connected_station().await;

    handle.remove_network(SSID);
    handle.drop_link();

    wait_for(&station, WifiStatus::Failed).await;
    let stats = station.station_stats().await.unwrap();
    assert_eq!(stats.reconnections, 2);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_no_reconnect_when_disabled() {
    let (station, handle) = start_station();
    station
        .connect_and_wait(
            station_config().with_auto_reconnect(false),
            None,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    let associations = handle.associations();

    handle.drop_link();
    wait_for(&station, WifiStatus::LostConnection).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(station.wifi_status(), WifiStatus::LostConnection);
    assert_eq!(handle.associations(), associations);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_recovers_after_transient_failure() {
    let (station, handle) = connected_station().await;

    handle.fail_next_associations(1);
    handle.drop_link();

    wait_for(&station, WifiStatus::LostConnection).await;
    wait_for(&station, WifiStatus::Connected).await;
    assert_eq!(station.station_stats().await.unwrap().reconnections, 2);

    station.shutdown().await.unwrap();
}

// ============================================================================
// DATA
// ============================================================================

#[tokio::test]
async fn test_send_requires_connection() {
    let (station, _handle) = start_station();

    assert!(matches!(
        station.send(b"payload").await,
        Err(TransportError::NotConnected)
    ));

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_counts_traffic() {
    let (station, handle) = connected_station().await;

    assert_eq!(station.max_payload(), MAX_WIFI_PAYLOAD);
    assert_eq!(station.send(b"reading=42").await.unwrap(), 10);
    assert_eq!(handle.sent(), vec![b"reading=42".to_vec()]);

    handle.set_send_failure(true);
    assert!(matches!(
        station.send(b"lost").await,
        Err(TransportError::SendFailed(_))
    ));

    let stats = station.stats().await.unwrap();
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.bytes_sent, 10);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.successful_connections, 1);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_rejects_bad_payloads() {
    let (station, _handle) = connected_station().await;

    assert!(matches!(station.send(&[]).await, Err(TransportError::InvalidArgument(_))));
    let oversized = vec![0u8; MAX_WIFI_PAYLOAD + 1];
    assert!(matches!(
        station.send(&oversized).await,
        Err(TransportError::InvalidArgument(_))
    ));
    assert!(station.try_receive().await.is_none());

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reset_stats() {
    let (station, _handle) = connected_station().await;
    station.send(b"abc").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    station.reset_stats().await.unwrap();
    let stats = station.station_stats().await.unwrap();
    assert!(stats.uptime < Duration::from_millis(100), "uptime {:?}", stats.uptime);
    assert_eq!(stats.messages_sent, 0);
    assert_eq!(stats.connection_attempts, 0);
    // Link readings come from the driver, not the counters
    assert_eq!(stats.last_rssi, -48);

    station.shutdown().await.unwrap();
}

// ============================================================================
// SCANNING
// ============================================================================

#[tokio::test]
async fn test_blocking_scan() {
    let (station, handle) = start_station();
    handle.add_network("", "", -88, 1, 3);

    let networks = station.scan_networks().await.unwrap();
    assert_eq!(networks.len(), 3);

    let guest = networks.iter().find(|n| n.ssid == "Cafe-Guest").unwrap();
    assert_eq!(guest.security, WifiSecurity::Open);
    assert_eq!(guest.channel, 11);
    let field = networks.iter().find(|n| n.ssid == SSID).unwrap();
    assert_eq!(field.security, WifiSecurity::Wpa2Psk);
    assert!(networks.iter().any(|n| n.hidden));

    assert_eq!(station.station_stats().await.unwrap().scans, 1);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_async_scan_delivers_results() {
    let (station, _handle) = start_station();

    let (tx, rx) = oneshot::channel();
    station
        .scan_networks_async(Box::new(move |networks: Vec<WifiNetwork>| {
            let _ = tx.send(networks);
        }))
        .await
        .unwrap();

    let networks = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(networks.len(), 2);

    station.shutdown().await.unwrap();
}

// ============================================================================
// ACCESS POINT AND MODES
// ============================================================================

#[tokio::test]
async fn test_access_point_alongside_station() {
    let (station, handle) = connected_station().await;

    station
        .start_ap(AccessPointConfig::new("Hub-AP", "hubpass99").with_channel(6))
        .await
        .unwrap();
    assert_eq!(station.mode().await.unwrap(), WifiMode::StationAndAp);
    assert_eq!(handle.access_point().map(|ap| ap.ssid), Some("Hub-AP".to_string()));
    assert_eq!(station.wifi_status(), WifiStatus::Connected);

    handle.client_joined("aa:bb:cc:dd:ee:ff");
    assert_eq!(station.connected_clients().await.unwrap(), 1);

    station.stop_ap().await.unwrap();
    assert_eq!(station.mode().await.unwrap(), WifiMode::Station);
    assert!(handle.access_point().is_none());

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_access_point_only() {
    let (station, handle) = start_station();

    station
        .start_ap(AccessPointConfig::new("Hub-AP", ""))
        .await
        .unwrap();
    assert_eq!(station.mode().await.unwrap(), WifiMode::AccessPoint);
    assert_eq!(handle.mode(), WifiMode::AccessPoint);

    station.stop_ap().await.unwrap();
    assert_eq!(station.mode().await.unwrap(), WifiMode::Off);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leaving_station_mode_disconnects() {
    let (station, _handle) = connected_station().await;

    station.set_mode(WifiMode::AccessPoint).await.unwrap();
    assert_eq!(station.wifi_status(), WifiStatus::Disconnected);
    assert_eq!(station.station_stats().await.unwrap().disconnections, 1);

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_radio_tuning() {
    let (station, handle) = start_station();

    station.set_power_save(true).await.unwrap();
    assert!(handle.power_save());

    station.set_tx_power(8.5).await.unwrap();
    assert_eq!(handle.tx_power(), 8.5);
    assert!(matches!(
        station.set_tx_power(30.0).await,
        Err(TransportError::InvalidArgument(_))
    ));

    station.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsolicited_events_are_tolerated() {
    let (station, handle) = start_station();

    handle.emit(WifiEvent::StationConnected);
    handle.emit(WifiEvent::ApStopped);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(station.wifi_status(), WifiStatus::Disconnected);

    station.shutdown().await.unwrap();
}
