// Radio Transport Tests
// Packet radio driven through the simulated chip: transmit, receive, sleep and reconfiguration

use commhub::hal::{SimRadio, SimRadioHandle};
use commhub::transport::{
    Interface, Packet, RadioConfig, RadioFault, RadioMode, RadioParam, RadioTransport,
    RadioTransportConfig, ReceiveCallback, Transport, TransportConfig, TransportError,
    TransportStatus, MAX_RADIO_PAYLOAD,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

fn fast_config() -> RadioTransportConfig {
    RadioTransportConfig::new()
        .with_base_config(TransportConfig::new().with_worker_tick(10))
        .with_radio(RadioConfig::new().with_spreading_factor(7))
        .with_tx_timeout_margin(50)
}

fn start_radio() -> (RadioTransport, SimRadioHandle) {
    let (chip, handle) = SimRadio::new();
    let radio = RadioTransport::start(chip, fast_config()).unwrap();
    (radio, handle)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn test_radio_config_defaults() {
    let config = RadioConfig::default();

    assert_eq!(config.frequency_mhz, 850.0);
    assert_eq!(config.bandwidth_khz, 125.0);
    assert_eq!(config.spreading_factor, 10);
    assert_eq!(config.coding_rate, 6);
    assert_eq!(config.output_power_dbm, 22);
    assert_eq!(config.sync_word, 0xAB);
    assert!(!config.crc_enabled);
}

#[test]
fn test_radio_config_rejects_out_of_range() {
    assert!(RadioConfig::new().with_frequency(100.0).validate().is_err());
    assert!(RadioConfig::new().with_bandwidth(100.0).validate().is_err());
    assert!(RadioConfig::new().with_spreading_factor(13).validate().is_err());
    assert!(RadioConfig::new().with_coding_rate(4).validate().is_err());
    assert!(RadioConfig::new().with_output_power(23).validate().is_err());
    assert!(RadioConfig::new().with_preamble_length(0).validate().is_err());
    assert!(RadioConfig::new().with_tcxo_voltage(5.0).validate().is_err());
    assert!(RadioConfig::new().with_current_limit(200).validate().is_err());
}

#[test]
fn test_radio_config_accepts_edges() {
    let config = RadioConfig::new()
        .with_frequency(960.0)
        .with_bandwidth(500.0)
        .with_spreading_factor(5)
        .with_coding_rate(8)
        .with_output_power(-9)
        .with_tcxo_voltage(0.0);
    assert!(config.validate().is_ok());
}

#[test]
fn test_transport_config_rejects_empty_queue() {
    let config = RadioTransportConfig::new().with_rx_queue_capacity(0);
    assert!(matches!(
        config.validate(),
        Err(TransportError::ConfigurationRejected(_))
    ));
}

// ============================================================================
// START-UP
// ============================================================================

#[tokio::test]
async fn test_start_applies_configuration() {
    let (radio, handle) = start_radio();

    assert_eq!(radio.interface(), Interface::Radio);
    assert_eq!(radio.mode(), RadioMode::Idle);
    assert!(radio.is_available());
    assert_eq!(radio.max_payload(), MAX_RADIO_PAYLOAD);
    assert_eq!(handle.frequency_mhz(), 850.0);
    assert!(handle.applied().contains(&RadioParam::SpreadingFactor(7)));
    assert!(handle.applied().contains(&RadioParam::SyncWord(0xAB)));

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_fails_on_rejected_parameter() {
    let (chip, handle) = SimRadio::new();
    handle.reject_param(RadioParam::SpreadingFactor(7));

    let result = RadioTransport::start(chip, fast_config());
    assert!(matches!(result, Err(TransportError::ConfigurationRejected(_))));
}

// ============================================================================
// TRANSMIT
// ============================================================================

#[tokio::test]
async fn test_send_reaches_the_air() {
    let (radio, handle) = start_radio();

    let sent = radio.send(b"telemetry").await.unwrap();
    assert_eq!(sent, 9);
    assert_eq!(handle.transmitted(), vec![b"telemetry".to_vec()]);
    assert_eq!(radio.mode(), RadioMode::Idle);

    let stats = radio.radio_stats().await.unwrap();
    assert_eq!(stats.packets_transmitted, 1);
    assert_eq!(stats.bytes_sent, 9);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_rejects_bad_payloads() {
    let (radio, handle) = start_radio();

    assert!(matches!(radio.send(&[]).await, Err(TransportError::InvalidArgument(_))));
    let oversized = vec![0u8; MAX_RADIO_PAYLOAD + 1];
    assert!(matches!(
        radio.send(&oversized).await,
        Err(TransportError::InvalidArgument(_))
    ));
    assert!(handle.transmitted().is_empty());

    let largest = vec![7u8; MAX_RADIO_PAYLOAD];
    assert_eq!(radio.send(&largest).await.unwrap(), MAX_RADIO_PAYLOAD);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transmit_callback_reports_completion() {
    let (radio, handle) = start_radio();
    handle.set_auto_complete(false);

    let (tx, rx) = oneshot::channel();
    radio
        .transmit(
            b"deferred",
            Some(Box::new(move |outcome: Result<(), RadioFault>| {
                let _ = tx.send(outcome);
            })),
        )
        .await
        .unwrap();
    assert_eq!(radio.mode(), RadioMode::Transmit);
    assert!(radio.is_busy().await.unwrap());

    // Only one transmission at a time
    assert!(matches!(
        radio.transmit(b"second", None).await,
        Err(TransportError::InvalidState(_))
    ));

    handle.complete_transmit();
    let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Ok(()));
    assert_eq!(radio.mode(), RadioMode::Idle);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refused_transmission_counts_error() {
    let (radio, handle) = start_radio();
    handle.refuse_next_transmit(RadioFault::Busy);

    assert!(matches!(radio.send(b"x").await, Err(TransportError::SendFailed(_))));
    assert_eq!(radio.mode(), RadioMode::Idle);
    assert_eq!(radio.radio_stats().await.unwrap().transmission_errors, 1);

    // The radio recovers for the next attempt
    assert!(radio.send(b"y").await.is_ok());

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_completion_is_reported() {
    let (radio, handle) = start_radio();
    handle.fail_next_transmit(RadioFault::Code(-705));

    assert!(matches!(radio.send(b"x").await, Err(TransportError::SendFailed(_))));
    let stats = radio.stats().await.unwrap();
    assert_eq!(stats.messages_sent, 0);
    assert_eq!(stats.errors, 1);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_interrupt_times_out() {
    let (radio, handle) = start_radio();
    handle.set_auto_complete(false);

    let (tx, rx) = oneshot::channel();
    radio
        .transmit(
            b"lost",
            Some(Box::new(move |outcome: Result<(), RadioFault>| {
                let _ = tx.send(outcome);
            })),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Err(RadioFault::Timeout));
    assert_eq!(radio.mode(), RadioMode::Idle);
    assert_eq!(radio.radio_stats().await.unwrap().transmission_errors, 1);

    radio.shutdown().await.unwrap();
}

// ============================================================================
// RECEIVE
// ============================================================================

#[tokio::test]
async fn test_receive_delivers_packet_with_metadata() {
    let (radio, handle) = start_radio();
    handle.set_frequency_error(-312.5);

    let seen: Arc<Mutex<Vec<Packet>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ReceiveCallback = Arc::new(move |packet: &Packet| {
        sink.lock().unwrap().push(packet.clone());
    });
    radio.start_receive(Some(callback)).await.unwrap();
    assert_eq!(radio.mode(), RadioMode::Receive);
    assert!(handle.is_receiving());

    assert!(handle.deliver_frame(b"beacon", -101, 5.5));
    settle().await;

    let packets = seen.lock().unwrap().clone();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].data, b"beacon");
    assert_eq!(packets[0].rssi, -101);
    assert_eq!(packets[0].snr, Some(5.5));
    assert_eq!(packets[0].frequency_error, Some(-312.5));

    let queued = radio.try_receive().await.unwrap();
    assert_eq!(queued.data, b"beacon");
    assert!(radio.try_receive().await.is_none());

    assert_eq!(radio.last_rssi().await.unwrap(), -101);
    assert_eq!(radio.last_snr().await.unwrap(), 5.5);
    assert_eq!(radio.frequency_error().await.unwrap(), -312.5);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_frame_is_dropped() {
    let (radio, handle) = start_radio();
    radio.start_receive(None).await.unwrap();

    handle.deliver_corrupt_frame();
    settle().await;

    assert!(radio.try_receive().await.is_none());
    let stats = radio.radio_stats().await.unwrap();
    assert_eq!(stats.crc_errors, 1);
    assert_eq!(stats.packets_received, 0);
    assert_eq!(radio.mode(), RadioMode::Receive);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_frames_outside_receive_mode_are_ignored() {
    let (radio, handle) = start_radio();

    handle.deliver_frame(b"stray", -90, 3.0);
    settle().await;

    assert!(radio.try_receive().await.is_none());
    assert_eq!(radio.radio_stats().await.unwrap().packets_received, 0);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inbound_queue_drops_oldest() {
    let (chip, handle) = SimRadio::new();
    let radio = RadioTransport::start(chip, fast_config().with_rx_queue_capacity(2)).unwrap();
    radio.start_receive(None).await.unwrap();

    for payload in [b"one", b"two", b"six"] {
        handle.deliver_frame(payload, -80, 9.0);
        settle().await;
    }

    assert_eq!(radio.try_receive().await.unwrap().data, b"two");
    assert_eq!(radio.try_receive().await.unwrap().data, b"six");
    assert_eq!(radio.radio_stats().await.unwrap().dropped_packets, 1);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transmit_resumes_reception() {
    let (radio, handle) = start_radio();
    radio.start_receive(None).await.unwrap();

    radio.send(b"reply").await.unwrap();
    assert_eq!(radio.mode(), RadioMode::Receive);
    assert!(handle.is_receiving());

    radio.stop_receive().await.unwrap();
    assert_eq!(radio.mode(), RadioMode::Idle);
    assert!(!handle.is_receiving());

    radio.shutdown().await.unwrap();
}

// ============================================================================
// POWER AND RECONFIGURATION
// ============================================================================

#[tokio::test]
async fn test_sleep_blocks_traffic_until_wakeup() {
    let (radio, handle) = start_radio();

    radio.sleep().await.unwrap();
    assert_eq!(radio.mode(), RadioMode::Sleep);
    assert!(handle.is_sleeping());
    assert!(!radio.is_available());
    assert!(matches!(
        radio.transmit(b"x", None).await,
        Err(TransportError::InvalidState(_))
    ));

    radio.wakeup().await.unwrap();
    assert_eq!(radio.mode(), RadioMode::Idle);
    assert!(radio.send(b"x").await.is_ok());

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_config_restores_mode() {
    let (radio, handle) = start_radio();
    radio.start_receive(None).await.unwrap();

    let config = RadioConfig::new().with_frequency(915.0).with_spreading_factor(9);
    radio.update_config(config.clone()).await.unwrap();

    assert_eq!(radio.config().await.unwrap(), config);
    assert_eq!(handle.frequency_mhz(), 915.0);
    assert_eq!(radio.mode(), RadioMode::Receive);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_config_rolls_back_on_rejection() {
    let (radio, handle) = start_radio();
    handle.reject_param(RadioParam::SpreadingFactor(11));

    let result = radio
        .update_config(RadioConfig::new().with_frequency(433.0).with_spreading_factor(11))
        .await;
    assert!(matches!(result, Err(TransportError::ConfigurationRejected(_))));
    assert_eq!(radio.config().await.unwrap().spreading_factor, 7);
    assert_eq!(handle.frequency_mhz(), 850.0);

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_config_rejects_invalid_values() {
    let (radio, _handle) = start_radio();

    let result = radio
        .update_config(RadioConfig::new().with_spreading_factor(4))
        .await;
    assert!(matches!(result, Err(TransportError::ConfigurationRejected(_))));

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_turns_radio_off() {
    let (radio, handle) = start_radio();
    let mut status = radio.subscribe();

    radio.shutdown().await.unwrap();
    assert_eq!(radio.mode(), RadioMode::Off);
    assert!(handle.is_sleeping());
    assert_eq!(*status.borrow_and_update(), TransportStatus::Radio(RadioMode::Off));
    assert!(matches!(
        radio.transmit(b"x", None).await,
        Err(TransportError::InvalidState(_))
    ));

    // Idempotent
    radio.shutdown().await.unwrap();
}

// ============================================================================
// STATISTICS
// ============================================================================

#[tokio::test]
async fn test_stats_reset() {
    let (radio, handle) = start_radio();
    radio.start_receive(None).await.unwrap();
    radio.send(b"abc").await.unwrap();
    handle.deliver_frame(b"defg", -70, 10.0);
    settle().await;

    let stats = radio.stats().await.unwrap();
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.bytes_sent, 3);
    assert_eq!(stats.bytes_received, 4);

    radio.reset_stats().await.unwrap();
    let stats = radio.stats().await.unwrap();
    assert_eq!(stats.messages_sent, 0);
    assert_eq!(stats.messages_received, 0);
    assert!(stats.uptime < Duration::from_secs(1));

    radio.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_airtime_helpers() {
    let (radio, _handle) = start_radio();

    let short = radio.time_on_air(8).await.unwrap();
    let long = radio.time_on_air(200).await.unwrap();
    assert!(long > short);
    assert!(radio.data_rate_bps().await.unwrap() > 0);

    radio.shutdown().await.unwrap();
}
