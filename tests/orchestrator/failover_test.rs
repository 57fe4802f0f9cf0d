// Failover Tests
// Send routing across transports: fallback order, exhaustion and pinned routes

mod mock;

use commhub::hal::{SimRadio, SimWifi};
use commhub::orchestrator::{OrchestratorConfig, Route, FALLBACK_ORDER};
use commhub::transport::{
    Interface, RadioConfig, RadioTransport, RadioTransportConfig, StationConfig,
    StationTransport, StationTransportConfig, Transport, TransportConfig, TransportError,
};
use commhub::CommunicationOrchestrator;
use mock::{all_up, orchestrator, MockTransport};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_fallback_order() {
    assert_eq!(
        FALLBACK_ORDER,
        [Interface::Wifi, Interface::Cellular, Interface::Radio]
    );
}

// ============================================================================
// AUTOMATIC ROUTE
// ============================================================================

#[tokio::test]
async fn test_send_uses_active_interface() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);

    let used = hub.send(b"reading", Route::Auto).await.unwrap();

    assert_eq!(used, Interface::Wifi);
    assert_eq!(wifi.sent(), vec![b"reading".to_vec()]);
    assert!(cellular.sent().is_empty());
    assert_eq!(hub.active_interface().await.unwrap(), Some(Interface::Wifi));
}

#[tokio::test]
async fn test_failed_send_moves_to_next_in_order() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();
    wifi.fail_sends(true);

    let used = hub.send(b"alarm", Route::Auto).await.unwrap();

    assert_eq!(used, Interface::Cellular);
    assert_eq!(cellular.sent(), vec![b"alarm".to_vec()]);
    assert!(radio.sent().is_empty());
    assert_eq!(hub.active_interface().await.unwrap(), Some(Interface::Cellular));

    let stats = hub.statistics().await.unwrap();
    assert_eq!(stats.counters.failovers, 1);
    assert_eq!(stats.counters.sends, 1);
    assert_eq!(stats.counters.send_failures, 0);
    assert_eq!(stats.interface(Interface::Wifi).unwrap().errors, 1);

    // Later sends stay on the new active link
    hub.send(b"next", Route::Auto).await.unwrap();
    assert_eq!(cellular.sent().len(), 2);
}

#[tokio::test]
async fn test_failover_skips_unusable_candidates() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();
    wifi.fail_sends(true);
    cellular.set_usable(false);

    let used = hub.send(b"alarm", Route::Auto).await.unwrap();

    assert_eq!(used, Interface::Radio);
    assert!(cellular.sent().is_empty());
}

#[tokio::test]
async fn test_failover_skips_disabled_candidates() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();
    hub.enable_interface(Interface::Cellular, false).await.unwrap();
    wifi.fail_sends(true);

    let used = hub.send(b"alarm", Route::Auto).await.unwrap();

    assert_eq!(used, Interface::Radio);
    assert!(cellular.sent().is_empty());
    assert_eq!(radio.sent(), vec![b"alarm".to_vec()]);
}

#[tokio::test]
async fn test_failover_follows_fallback_not_preference() {
    let (wifi, cellular, radio) = all_up();
    let config = OrchestratorConfig::new().with_preferred(Interface::Radio);
    let hub = orchestrator(config, &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();
    radio.fail_sends(true);

    let used = hub.send(b"alarm", Route::Auto).await.unwrap();
    assert_eq!(used, Interface::Wifi);
}

#[tokio::test]
async fn test_failover_tries_each_candidate() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();
    wifi.fail_sends(true);
    cellular.fail_sends(true);

    let used = hub.send(b"alarm", Route::Auto).await.unwrap();

    assert_eq!(used, Interface::Radio);
    let stats = hub.statistics().await.unwrap();
    assert_eq!(stats.interface(Interface::Cellular).unwrap().errors, 1);
    assert_eq!(stats.counters.failovers, 1);
}

#[tokio::test]
async fn test_all_transports_exhausted() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();
    for mock in [&wifi, &cellular, &radio] {
        mock.fail_sends(true);
    }

    let result = hub.send(b"alarm", Route::Auto).await;

    assert!(matches!(result, Err(TransportError::AllTransportsExhausted)));
    let stats = hub.statistics().await.unwrap();
    assert_eq!(stats.counters.send_failures, 1);
    assert_eq!(stats.counters.sends, 0);
    assert_eq!(stats.total.errors, 3);
}

#[tokio::test]
async fn test_send_without_usable_transport() {
    let wifi = MockTransport::down(Interface::Wifi);
    let radio = MockTransport::down(Interface::Radio);
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &radio]);

    let result = hub.send(b"alarm", Route::Auto).await;

    assert!(matches!(result, Err(TransportError::AllTransportsExhausted)));
    assert_eq!(hub.statistics().await.unwrap().counters.send_failures, 1);
}

#[tokio::test]
async fn test_failover_disabled_reports_original_error() {
    let (wifi, cellular, radio) = all_up();
    let config = OrchestratorConfig::new().with_auto_failover(false);
    let hub = orchestrator(config, &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();
    wifi.fail_sends(true);

    let result = hub.send(b"alarm", Route::Auto).await;

    assert!(matches!(result, Err(TransportError::SendFailed(_))));
    assert!(cellular.sent().is_empty());
    assert!(radio.sent().is_empty());
    assert_eq!(hub.active_interface().await.unwrap(), Some(Interface::Wifi));
}

#[tokio::test]
async fn test_failover_toggled_at_runtime() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();
    wifi.fail_sends(true);

    hub.set_auto_failover(false).await.unwrap();
    assert!(hub.send(b"one", Route::Auto).await.is_err());

    hub.set_auto_failover(true).await.unwrap();
    assert_eq!(hub.send(b"two", Route::Auto).await.unwrap(), Interface::Cellular);
}

#[tokio::test]
async fn test_empty_payload_rejected() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);

    let result = hub.send(&[], Route::Auto).await;
    assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
    assert!(wifi.sent().is_empty());
}

// ============================================================================
// PINNED ROUTE
// ============================================================================

#[tokio::test]
async fn test_pinned_route_bypasses_active() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    hub.select_best_interface().await.unwrap();

    let used = hub.send(b"beacon", Route::Only(Interface::Radio)).await.unwrap();

    assert_eq!(used, Interface::Radio);
    assert_eq!(radio.sent(), vec![b"beacon".to_vec()]);
    assert_eq!(hub.active_interface().await.unwrap(), Some(Interface::Wifi));
}

#[tokio::test]
async fn test_pinned_route_never_fails_over() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    cellular.fail_sends(true);

    let result = hub.send(b"sms", Route::Only(Interface::Cellular)).await;

    assert!(matches!(result, Err(TransportError::SendFailed(_))));
    assert!(wifi.sent().is_empty());
    assert!(radio.sent().is_empty());
    assert_eq!(hub.statistics().await.unwrap().counters.failovers, 0);
}

#[tokio::test]
async fn test_pinned_route_to_down_link() {
    let wifi = MockTransport::new(Interface::Wifi);
    let radio = MockTransport::down(Interface::Radio);
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &radio]);

    let result = hub.send(b"x", Route::Only(Interface::Radio)).await;
    assert!(matches!(result, Err(TransportError::NotConnected)));
}

#[tokio::test]
async fn test_pinned_route_to_disabled_interface() {
    let (wifi, cellular, radio) = all_up();
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi, &cellular, &radio]);
    hub.enable_interface(Interface::Radio, false).await.unwrap();

    let result = hub.send(b"beacon", Route::Only(Interface::Radio)).await;

    assert!(matches!(result, Err(TransportError::InvalidState(_))));
    assert!(radio.sent().is_empty());
}

#[tokio::test]
async fn test_pinned_route_to_missing_transport() {
    let wifi = MockTransport::new(Interface::Wifi);
    let hub = orchestrator(OrchestratorConfig::default(), &[&wifi]);

    let result = hub.send(b"x", Route::Only(Interface::Cellular)).await;
    assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
}

// ============================================================================
// SIMULATED HARDWARE
// ============================================================================

#[tokio::test]
async fn test_wifi_fault_falls_back_to_radio() {
    let (driver, wifi_handle) = SimWifi::new();
    wifi_handle.add_network("FieldNet", "fieldpass1", -50, 6, 3);
    let station = StationTransport::start(
        driver,
        StationTransportConfig::new().with_base_config(TransportConfig::new().with_worker_tick(10)),
    )
    .unwrap();
    station
        .connect_and_wait(StationConfig::new("FieldNet", "fieldpass1"), None, Duration::from_secs(2))
        .await
        .unwrap();
    let station = Arc::new(station);

    let (chip, radio_handle) = SimRadio::new();
    let radio = Arc::new(
        RadioTransport::start(
            chip,
            RadioTransportConfig::new()
                .with_base_config(TransportConfig::new().with_worker_tick(10))
                .with_radio(RadioConfig::new().with_spreading_factor(7)),
        )
        .unwrap(),
    );

    let wifi_transport: Arc<dyn Transport> = station.clone();
    let radio_transport: Arc<dyn Transport> = radio.clone();
    let hub = CommunicationOrchestrator::builder()
        .with_transport(wifi_transport)
        .with_transport(radio_transport)
        .build()
        .unwrap();

    assert_eq!(hub.send(b"status ok", Route::Auto).await.unwrap(), Interface::Wifi);
    assert_eq!(wifi_handle.sent(), vec![b"status ok".to_vec()]);

    wifi_handle.set_send_failure(true);
    assert_eq!(hub.send(b"status bad", Route::Auto).await.unwrap(), Interface::Radio);
    assert_eq!(radio_handle.transmitted(), vec![b"status bad".to_vec()]);
    assert_eq!(hub.active_interface().await.unwrap(), Some(Interface::Radio));

    station.shutdown().await.unwrap();
    radio.shutdown().await.unwrap();
}
