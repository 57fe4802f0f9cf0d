// Packet Radio Transport
// SX126x-class LoRa radio driven through interrupt-signalled transmit/receive completion

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::guard::{lock_with_timeout, Shutdown, ShutdownListener, UptimeClock};
use crate::transport::{
    Interface, Packet, Transport, TransportConfig, TransportError, TransportStats, TransportStatus,
};

/// Largest payload the radio accepts in one frame
pub const MAX_RADIO_PAYLOAD: usize = 255;

/// LoRa bandwidths supported by the SX126x family, in kHz
pub const SUPPORTED_BANDWIDTHS_KHZ: [f32; 10] =
    [7.8, 10.4, 15.6, 20.8, 31.25, 41.7, 62.5, 125.0, 250.0, 500.0];

// ============================================================================
// RADIO MODE
// ============================================================================

/// Operating mode of the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioMode {
    Off,
    Idle,
    Transmit,
    Receive,
    Sleep,
}

// ============================================================================
// RADIO CONFIG
// ============================================================================

/// Modulation and front-end parameters applied to the radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    pub frequency_mhz: f32,
    pub bandwidth_khz: f32,
    pub spreading_factor: u8,
    /// Denominator of the 4/x coding rate
    pub coding_rate: u8,
    pub output_power_dbm: i8,
    pub preamble_length: u16,
    pub sync_word: u8,
    /// 0.0 disables the TCXO supply
    pub tcxo_voltage: f32,
    pub current_limit_ma: u8,
    pub crc_enabled: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 850.0,
            bandwidth_khz: 125.0,
            spreading_factor: 10,
            coding_rate: 6,
            output_power_dbm: 22,
            preamble_length: 15,
            sync_word: 0xAB,
            tcxo_voltage: 2.4,
            current_limit_ma: 140,
            crc_enabled: false,
        }
    }
}

impl RadioConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frequency(mut self, mhz: f32) -> Self {
        self.frequency_mhz = mhz;
        self
    }

    pub fn with_bandwidth(mut self, khz: f32) -> Self {
        self.bandwidth_khz = khz;
        self
    }

    pub fn with_spreading_factor(mut self, sf: u8) -> Self {
        self.spreading_factor = sf;
        self
    }

    pub fn with_coding_rate(mut self, denominator: u8) -> Self {
        self.coding_rate = denominator;
        self
    }

    pub fn with_output_power(mut self, dbm: i8) -> Self {
        self.output_power_dbm = dbm;
        self
    }

    pub fn with_preamble_length(mut self, len: u16) -> Self {
        self.preamble_length = len;
        self
    }

    pub fn with_sync_word(mut self, word: u8) -> Self {
        self.sync_word = word;
        self
    }

    pub fn with_tcxo_voltage(mut self, volts: f32) -> Self {
        self.tcxo_voltage = volts;
        self
    }

    pub fn with_current_limit(mut self, ma: u8) -> Self {
        self.current_limit_ma = ma;
        self
    }

    pub fn with_crc(mut self, enabled: bool) -> Self {
        self.crc_enabled = enabled;
        self
    }

    /// Check every parameter, naming the first one out of range
    pub fn validate(&self) -> Result<(), TransportError> {
        let reject = |msg: String| Err(TransportError::ConfigurationRejected(msg));

        if !(150.0..=960.0).contains(&self.frequency_mhz) {
            return reject(format!("frequency {} MHz outside 150-960 MHz", self.frequency_mhz));
        }
        if !SUPPORTED_BANDWIDTHS_KHZ
            .iter()
            .any(|bw| (bw - self.bandwidth_khz).abs() < 0.01)
        {
            return reject(format!("bandwidth {} kHz is not supported", self.bandwidth_khz));
        }
        if !(5..=12).contains(&self.spreading_factor) {
            return reject(format!("spreading factor {} outside 5-12", self.spreading_factor));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return reject(format!("coding rate 4/{} outside 4/5-4/8", self.coding_rate));
        }
        if !(-9..=22).contains(&self.output_power_dbm) {
            return reject(format!("output power {} dBm outside -9..22 dBm", self.output_power_dbm));
        }
        if self.preamble_length == 0 {
            return reject("preamble length cannot be 0".to_string());
        }
        if self.tcxo_voltage != 0.0 && !(1.6..=3.3).contains(&self.tcxo_voltage) {
            return reject(format!("TCXO voltage {} V outside 1.6-3.3 V", self.tcxo_voltage));
        }
        if self.current_limit_ma > 140 {
            return reject(format!("current limit {} mA above 140 mA", self.current_limit_ma));
        }
        Ok(())
    }

    /// Parameters in the order they are written to the hardware
    pub fn params(&self) -> [RadioParam; 10] {
        [
            RadioParam::Frequency(self.frequency_mhz),
            RadioParam::Bandwidth(self.bandwidth_khz),
            RadioParam::SpreadingFactor(self.spreading_factor),
            RadioParam::CodingRate(self.coding_rate),
            RadioParam::SyncWord(self.sync_word),
            RadioParam::OutputPower(self.output_power_dbm),
            RadioParam::CurrentLimit(self.current_limit_ma),
            RadioParam::PreambleLength(self.preamble_length),
            RadioParam::Crc(self.crc_enabled),
            RadioParam::TcxoVoltage(self.tcxo_voltage),
        ]
    }

    fn symbol_duration_ms(&self) -> f64 {
        2.0_f64.powi(self.spreading_factor as i32) / (self.bandwidth_khz as f64 * 1000.0) * 1000.0
    }

    /// Estimated airtime of a payload, explicit header mode
    pub fn time_on_air(&self, payload_bytes: usize) -> Duration {
        let sf = self.spreading_factor as f64;
        let cr = self.coding_rate as f64;
        let symbol_ms = self.symbol_duration_ms();
        let crc = if self.crc_enabled { 16.0 } else { 0.0 };
        // Low data rate optimisation kicks in above 16 ms symbols
        let de = if symbol_ms > 16.0 { 2.0 } else { 0.0 };

        let preamble_ms = (self.preamble_length as f64 + 4.25) * symbol_ms;
        let numerator = 8.0 * payload_bytes as f64 - 4.0 * sf + 28.0 + crc;
        let payload_symbols = 8.0 + ((numerator / (4.0 * (sf - de))).ceil() * cr).max(0.0);
        let total_ms = preamble_ms + payload_symbols * symbol_ms;

        Duration::from_micros((total_ms * 1000.0) as u64)
    }

    /// Calculate data rate in bits per second
    pub fn data_rate_bps(&self) -> u32 {
        let sf = self.spreading_factor as f64;
        let bw = self.bandwidth_khz as f64 * 1000.0;
        let cr = self.coding_rate as f64;
        // Data rate = SF * (BW / 2^SF) * (4 / CR)
        (sf * (bw / 2.0_f64.powf(sf)) * (4.0 / cr)) as u32
    }
}

/// Single hardware parameter write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RadioParam {
    Frequency(f32),
    Bandwidth(f32),
    SpreadingFactor(u8),
    CodingRate(u8),
    SyncWord(u8),
    OutputPower(i8),
    CurrentLimit(u8),
    PreambleLength(u16),
    Crc(bool),
    TcxoVoltage(f32),
}

impl fmt::Display for RadioParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frequency(v) => write!(f, "frequency {} MHz", v),
            Self::Bandwidth(v) => write!(f, "bandwidth {} kHz", v),
            Self::SpreadingFactor(v) => write!(f, "spreading factor {}", v),
            Self::CodingRate(v) => write!(f, "coding rate 4/{}", v),
            Self::SyncWord(v) => write!(f, "sync word 0x{:02X}", v),
            Self::OutputPower(v) => write!(f, "output power {} dBm", v),
            Self::CurrentLimit(v) => write!(f, "current limit {} mA", v),
            Self::PreambleLength(v) => write!(f, "preamble length {}", v),
            Self::Crc(v) => write!(f, "crc {}", if *v { "on" } else { "off" }),
            Self::TcxoVoltage(v) => write!(f, "TCXO voltage {} V", v),
        }
    }
}

/// Transport-level settings for the radio worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    pub radio: RadioConfig,
    /// Slack added to the airtime estimate before a transmission is abandoned
    pub tx_timeout_margin_ms: u64,
    /// Packets held for `try_receive` before the oldest is dropped
    pub rx_queue_capacity: usize,
}

impl Default for RadioTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            radio: RadioConfig::default(),
            tx_timeout_margin_ms: 1000,
            rx_queue_capacity: 16,
        }
    }
}

impl RadioTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_radio(mut self, radio: RadioConfig) -> Self {
        self.radio = radio;
        self
    }

    pub fn with_tx_timeout_margin(mut self, ms: u64) -> Self {
        self.tx_timeout_margin_ms = ms;
        self
    }

    pub fn with_rx_queue_capacity(mut self, capacity: usize) -> Self {
        self.rx_queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        self.base.validate()?;
        self.radio.validate()?;
        if self.rx_queue_capacity == 0 {
            return Err(TransportError::ConfigurationRejected(
                "rx_queue_capacity cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// HARDWARE BOUNDARY
// ============================================================================

/// Fault codes reported by the radio chip driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioFault {
    CrcMismatch,
    InvalidParameter,
    Busy,
    Timeout,
    Code(i16),
}

impl fmt::Display for RadioFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrcMismatch => f.write_str("crc mismatch"),
            Self::InvalidParameter => f.write_str("invalid parameter"),
            Self::Busy => f.write_str("chip busy"),
            Self::Timeout => f.write_str("operation timed out"),
            Self::Code(code) => write!(f, "driver error {}", code),
        }
    }
}

/// Frame read back from the radio after a receive interrupt
#[derive(Debug, Clone, PartialEq)]
pub struct RadioFrame {
    pub data: Vec<u8>,
    pub rssi: i16,
    pub snr: f32,
    pub frequency_error: f32,
}

/// Completion events raised from interrupt context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    TransmitDone,
    ReceiveDone,
}

/// Interrupt-safe handle that forwards completion events to the worker
#[derive(Debug, Clone)]
pub struct RadioIrq {
    tx: mpsc::Sender<RadioEvent>,
}

impl RadioIrq {
    /// Never blocks; returns false when the event queue is full
    pub fn notify(&self, event: RadioEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    pub fn transmit_done(&self) -> bool {
        self.notify(RadioEvent::TransmitDone)
    }

    pub fn receive_done(&self) -> bool {
        self.notify(RadioEvent::ReceiveDone)
    }
}

/// Register-level driver for the radio chip
pub trait RadioHardware: Send + 'static {
    /// Bring the chip up on the given frequency
    fn begin(&mut self, frequency_mhz: f32) -> Result<(), RadioFault>;

    fn apply(&mut self, param: RadioParam) -> Result<(), RadioFault>;

    /// Install the interrupt handle; the chip raises events through it
    fn attach_irq(&mut self, irq: RadioIrq);

    fn start_transmit(&mut self, data: &[u8]) -> Result<(), RadioFault>;

    /// Clear transmit state after a TransmitDone interrupt
    fn finish_transmit(&mut self) -> Result<(), RadioFault>;

    fn start_receive(&mut self) -> Result<(), RadioFault>;

    fn read_frame(&mut self) -> Result<RadioFrame, RadioFault>;

    fn standby(&mut self) -> Result<(), RadioFault>;

    fn sleep(&mut self) -> Result<(), RadioFault>;

    fn frequency_error(&self) -> f32;

    fn is_busy(&self) -> bool;
}

// ============================================================================
// RADIO STATISTICS
// ============================================================================

/// Detailed radio counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RadioStats {
    pub packets_transmitted: u64,
    pub packets_received: u64,
    pub transmission_errors: u64,
    pub reception_errors: u64,
    pub crc_errors: u64,
    pub dropped_packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_rssi: i16,
    pub last_snr: f32,
    pub uptime: Duration,
}

impl From<&RadioStats> for TransportStats {
    fn from(stats: &RadioStats) -> Self {
        TransportStats {
            messages_sent: stats.packets_transmitted,
            messages_received: stats.packets_received,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            errors: stats.transmission_errors + stats.reception_errors + stats.crc_errors,
            uptime: stats.uptime,
            ..TransportStats::default()
        }
    }
}

/// Outcome delivered to a transmit callback
pub type TransmitCallback = Box<dyn FnOnce(Result<(), RadioFault>) + Send>;

/// Invoked for every valid received packet
pub type ReceiveCallback = Arc<dyn Fn(&Packet) + Send + Sync>;

// ============================================================================
// RADIO TRANSPORT
// ============================================================================

struct PendingTransmit {
    bytes: usize,
    deadline: Instant,
    resume_receive: bool,
    callback: Option<TransmitCallback>,
}

struct RadioState {
    hardware: Box<dyn RadioHardware>,
    config: RadioConfig,
    mode: RadioMode,
    pending: Option<PendingTransmit>,
    rx_callback: Option<ReceiveCallback>,
    inbound: VecDeque<Packet>,
    stats: RadioStats,
    clock: UptimeClock,
}

struct RadioInner {
    state: Mutex<RadioState>,
    status_tx: watch::Sender<TransportStatus>,
    lock_timeout: Duration,
    tx_margin: Duration,
    rx_capacity: usize,
    /// Receive interrupts given up because the state lock stayed busy
    missed_receptions: AtomicU64,
}

/// Packet radio transport
pub struct RadioTransport {
    inner: Arc<RadioInner>,
    shutdown: Shutdown,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RadioTransport {
    /// Bring up the radio and spawn its worker; must run inside a Tokio runtime
    pub fn start<H: RadioHardware>(
        mut hardware: H,
        config: RadioTransportConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        hardware.begin(config.radio.frequency_mhz).map_err(|fault| {
            error!(%fault, "radio failed to start");
            TransportError::HardwareInitFailure(format!("radio begin failed: {}", fault))
        })?;
        apply_params(&mut hardware, &config.radio)?;

        let (tx, rx) = mpsc::channel(config.base.event_queue_depth);
        hardware.attach_irq(RadioIrq { tx });
        hardware.standby().map_err(|fault| {
            TransportError::HardwareInitFailure(format!("radio standby failed: {}", fault))
        })?;

        let (status_tx, _) = watch::channel(TransportStatus::Radio(RadioMode::Idle));
        let inner = Arc::new(RadioInner {
            state: Mutex::new(RadioState {
                hardware: Box::new(hardware),
                config: config.radio.clone(),
                mode: RadioMode::Idle,
                pending: None,
                rx_callback: None,
                inbound: VecDeque::with_capacity(config.rx_queue_capacity),
                stats: RadioStats::default(),
                clock: UptimeClock::start(),
            }),
            status_tx,
            lock_timeout: config.base.lock_timeout(),
            tx_margin: Duration::from_millis(config.tx_timeout_margin_ms),
            rx_capacity: config.rx_queue_capacity,
            missed_receptions: AtomicU64::new(0),
        });

        let shutdown = Shutdown::new();
        let worker = tokio::spawn(run_worker(
            inner.clone(),
            rx,
            shutdown.listener(),
            config.base.worker_tick(),
        ));

        info!(
            frequency_mhz = config.radio.frequency_mhz,
            sf = config.radio.spreading_factor,
            bandwidth_khz = config.radio.bandwidth_khz,
            "radio transport started"
        );

        Ok(Self {
            inner,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn mode(&self) -> RadioMode {
        match *self.inner.status_tx.borrow() {
            TransportStatus::Radio(mode) => mode,
            _ => RadioMode::Off,
        }
    }

    /// Start an asynchronous transmission; completion is reported to `callback`
    pub async fn transmit(
        &self,
        data: &[u8],
        callback: Option<TransmitCallback>,
    ) -> Result<(), TransportError> {
        check_payload(data)?;

        let mut state = self.inner.lock().await?;
        let resume_receive = match state.mode {
            RadioMode::Idle => false,
            RadioMode::Receive => true,
            RadioMode::Transmit => {
                return Err(TransportError::InvalidState(
                    "transmission already in progress".to_string(),
                ))
            }
            RadioMode::Sleep => {
                return Err(TransportError::InvalidState("radio is asleep".to_string()))
            }
            RadioMode::Off => {
                return Err(TransportError::InvalidState("radio is shut down".to_string()))
            }
        };

        let airtime = state.config.time_on_air(data.len());
        if let Err(fault) = state.hardware.start_transmit(data) {
            state.stats.transmission_errors += 1;
            warn!(%fault, len = data.len(), "radio refused transmission");
            return Err(TransportError::SendFailed(format!("radio refused transmission: {}", fault)));
        }

        state.pending = Some(PendingTransmit {
            bytes: data.len(),
            deadline: Instant::now() + airtime + self.inner.tx_margin,
            resume_receive,
            callback,
        });
        self.inner.set_mode(&mut state, RadioMode::Transmit);
        debug!(len = data.len(), airtime_ms = airtime.as_millis() as u64, "transmission started");
        Ok(())
    }

    /// Transmit and wait for the completion interrupt
    pub async fn transmit_and_wait(&self, data: &[u8]) -> Result<usize, TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        let callback: TransmitCallback = Box::new(move |outcome| {
            let _ = done_tx.send(outcome);
        });

        let wait = {
            let state = self.inner.lock().await?;
            state.config.time_on_air(data.len()) + self.inner.tx_margin * 2
        };
        self.transmit(data, Some(callback)).await?;

        match tokio::time::timeout(wait, done_rx).await {
            Ok(Ok(Ok(()))) => Ok(data.len()),
            Ok(Ok(Err(fault))) => Err(TransportError::SendFailed(fault.to_string())),
            Ok(Err(_)) => Err(TransportError::ChannelClosed),
            Err(_) => Err(TransportError::Timeout(format!(
                "no transmit completion within {} ms",
                wait.as_millis()
            ))),
        }
    }

    /// Enter continuous receive, delivering valid packets to `callback`
    pub async fn start_receive(&self, callback: Option<ReceiveCallback>) -> Result<(), TransportError> {
        let mut state = self.inner.lock().await?;
        match state.mode {
            RadioMode::Idle | RadioMode::Receive => {}
            RadioMode::Transmit => {
                return Err(TransportError::InvalidState(
                    "transmission in progress".to_string(),
                ))
            }
            RadioMode::Sleep => {
                return Err(TransportError::InvalidState("radio is asleep".to_string()))
            }
            RadioMode::Off => {
                return Err(TransportError::InvalidState("radio is shut down".to_string()))
            }
        }

        state
            .hardware
            .start_receive()
            .map_err(|fault| TransportError::HardwareFault(format!("start receive failed: {}", fault)))?;
        if callback.is_some() {
            state.rx_callback = callback;
        }
        self.inner.set_mode(&mut state, RadioMode::Receive);
        debug!("radio receiving");
        Ok(())
    }

    pub async fn stop_receive(&self) -> Result<(), TransportError> {
        let mut state = self.inner.lock().await?;
        if state.mode != RadioMode::Receive {
            return Ok(());
        }
        state
            .hardware
            .standby()
            .map_err(|fault| TransportError::HardwareFault(format!("standby failed: {}", fault)))?;
        state.rx_callback = None;
        self.inner.set_mode(&mut state, RadioMode::Idle);
        Ok(())
    }

    /// Replace the radio parameters, restoring the previous mode afterwards
    pub async fn update_config(&self, config: RadioConfig) -> Result<(), TransportError> {
        config.validate()?;

        let mut state = self.inner.lock().await?;
        let prior = state.mode;
        match prior {
            RadioMode::Off => {
                return Err(TransportError::InvalidState("radio is shut down".to_string()))
            }
            RadioMode::Transmit => {
                return Err(TransportError::InvalidState(
                    "transmission in progress".to_string(),
                ))
            }
            RadioMode::Receive | RadioMode::Sleep => {
                state
                    .hardware
                    .standby()
                    .map_err(|fault| TransportError::HardwareFault(format!("standby failed: {}", fault)))?;
                self.inner.set_mode(&mut state, RadioMode::Idle);
            }
            RadioMode::Idle => {}
        }

        let outcome = apply_params(state.hardware.as_mut(), &config);
        if outcome.is_ok() {
            info!(
                frequency_mhz = config.frequency_mhz,
                sf = config.spreading_factor,
                "radio configuration updated"
            );
            state.config = config;
        } else {
            let previous = state.config.clone();
            if let Err(e) = apply_params(state.hardware.as_mut(), &previous) {
                error!(error = %e, "failed to restore previous radio configuration");
            }
        }

        let restored = match prior {
            RadioMode::Receive => state.hardware.start_receive(),
            RadioMode::Sleep => state.hardware.sleep(),
            _ => Ok(()),
        };
        match restored {
            Ok(()) => self.inner.set_mode(&mut state, prior),
            Err(fault) => warn!(%fault, mode = ?prior, "could not restore radio mode"),
        }

        outcome
    }

    pub async fn sleep(&self) -> Result<(), TransportError> {
        let mut state = self.inner.lock().await?;
        match state.mode {
            RadioMode::Sleep => return Ok(()),
            RadioMode::Transmit => {
                return Err(TransportError::InvalidState(
                    "transmission in progress".to_string(),
                ))
            }
            RadioMode::Off => {
                return Err(TransportError::InvalidState("radio is shut down".to_string()))
            }
            RadioMode::Idle | RadioMode::Receive => {}
        }
        state
            .hardware
            .sleep()
            .map_err(|fault| TransportError::HardwareFault(format!("sleep failed: {}", fault)))?;
        self.inner.set_mode(&mut state, RadioMode::Sleep);
        debug!("radio asleep");
        Ok(())
    }

    pub async fn wakeup(&self) -> Result<(), TransportError> {
        let mut state = self.inner.lock().await?;
        if state.mode != RadioMode::Sleep {
            return Ok(());
        }
        state
            .hardware
            .standby()
            .map_err(|fault| TransportError::HardwareFault(format!("wakeup failed: {}", fault)))?;
        self.inner.set_mode(&mut state, RadioMode::Idle);
        debug!("radio awake");
        Ok(())
    }

    pub async fn config(&self) -> Result<RadioConfig, TransportError> {
        Ok(self.inner.lock().await?.config.clone())
    }

    pub async fn radio_stats(&self) -> Result<RadioStats, TransportError> {
        let mut state = self.inner.lock().await?;
        self.inner.absorb_missed(&mut state);
        let mut stats = state.stats.clone();
        stats.uptime = state.clock.elapsed();
        Ok(stats)
    }

    /// Get last RSSI reading
    pub async fn last_rssi(&self) -> Result<i16, TransportError> {
        Ok(self.inner.lock().await?.stats.last_rssi)
    }

    /// Get last SNR reading
    pub async fn last_snr(&self) -> Result<f32, TransportError> {
        Ok(self.inner.lock().await?.stats.last_snr)
    }

    pub async fn frequency_error(&self) -> Result<f32, TransportError> {
        Ok(self.inner.lock().await?.hardware.frequency_error())
    }

    pub async fn is_busy(&self) -> Result<bool, TransportError> {
        Ok(self.inner.lock().await?.hardware.is_busy())
    }

    pub async fn time_on_air(&self, payload_bytes: usize) -> Result<Duration, TransportError> {
        Ok(self.inner.lock().await?.config.time_on_air(payload_bytes))
    }

    pub async fn data_rate_bps(&self) -> Result<u32, TransportError> {
        Ok(self.inner.lock().await?.config.data_rate_bps())
    }

    /// Stop the worker and put the radio to sleep
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown.trigger();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "radio worker ended abnormally");
            }
        }

        let mut state = self.inner.lock().await?;
        if state.mode == RadioMode::Off {
            return Ok(());
        }
        if let Err(fault) = state.hardware.sleep() {
            warn!(%fault, "radio did not enter sleep during shutdown");
        }
        state.pending = None;
        state.rx_callback = None;
        self.inner.set_mode(&mut state, RadioMode::Off);
        info!("radio transport shut down");
        Ok(())
    }
}

fn check_payload(data: &[u8]) -> Result<(), TransportError> {
    if data.is_empty() {
        return Err(TransportError::InvalidArgument("payload is empty".to_string()));
    }
    if data.len() > MAX_RADIO_PAYLOAD {
        return Err(TransportError::InvalidArgument(format!(
            "payload of {} bytes exceeds {} byte limit",
            data.len(),
            MAX_RADIO_PAYLOAD
        )));
    }
    Ok(())
}

fn apply_params<H: RadioHardware + ?Sized>(
    hardware: &mut H,
    config: &RadioConfig,
) -> Result<(), TransportError> {
    for param in config.params() {
        hardware.apply(param).map_err(|fault| {
            warn!(%param, %fault, "radio rejected parameter");
            TransportError::ConfigurationRejected(format!("{} rejected: {}", param, fault))
        })?;
    }
    Ok(())
}

impl RadioInner {
    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, RadioState>, TransportError> {
        lock_with_timeout(&self.state, self.lock_timeout, "radio").await
    }

    /// Interrupt handlers get one retry before the event is abandoned
    async fn lock_for_event(&self, event: &str) -> Option<tokio::sync::MutexGuard<'_, RadioState>> {
        if let Ok(state) = self.lock().await {
            return Some(state);
        }
        match self.lock().await {
            Ok(state) => Some(state),
            Err(e) => {
                error!(event, error = %e, "radio interrupt abandoned");
                None
            }
        }
    }

    fn absorb_missed(&self, state: &mut RadioState) {
        let missed = self.missed_receptions.swap(0, Ordering::Relaxed);
        state.stats.reception_errors += missed;
    }

    fn set_mode(&self, state: &mut RadioState, mode: RadioMode) {
        state.mode = mode;
        self.status_tx.send_replace(TransportStatus::Radio(mode));
    }

    async fn handle_transmit_done(&self) {
        let (callback, outcome) = {
            // A lost completion is settled by the transmit deadline
            let Some(mut state) = self.lock_for_event("transmit done").await else {
                return;
            };
            let Some(pending) = state.pending.take() else {
                debug!("transmit interrupt with no pending transmission");
                return;
            };
            let outcome = state.hardware.finish_transmit();
            self.finalize_transmit(&mut state, pending.bytes, pending.resume_receive, &outcome);
            (pending.callback, outcome)
        };
        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    fn finalize_transmit(
        &self,
        state: &mut RadioState,
        bytes: usize,
        resume_receive: bool,
        outcome: &Result<(), RadioFault>,
    ) {
        match outcome {
            Ok(()) => {
                state.stats.packets_transmitted += 1;
                state.stats.bytes_sent += bytes as u64;
                debug!(len = bytes, "transmission complete");
            }
            Err(fault) => {
                state.stats.transmission_errors += 1;
                warn!(%fault, len = bytes, "transmission failed");
            }
        }

        let next = if resume_receive {
            match state.hardware.start_receive() {
                Ok(()) => RadioMode::Receive,
                Err(fault) => {
                    warn!(%fault, "could not resume receive after transmission");
                    state.stats.reception_errors += 1;
                    RadioMode::Idle
                }
            }
        } else {
            RadioMode::Idle
        };
        self.set_mode(state, next);
    }

    async fn handle_receive_done(&self) {
        let delivery = {
            let Some(mut state) = self.lock_for_event("receive done").await else {
                self.missed_receptions.fetch_add(1, Ordering::Relaxed);
                return;
            };
            self.absorb_missed(&mut state);
            if state.mode != RadioMode::Receive {
                debug!(mode = ?state.mode, "receive interrupt outside receive mode");
                return;
            }

            let delivery = match state.hardware.read_frame() {
                Ok(frame) => {
                    let packet = Packet::new(Interface::Radio, frame.data)
                        .with_rssi(frame.rssi)
                        .with_snr(frame.snr)
                        .with_frequency_error(frame.frequency_error);
                    state.stats.packets_received += 1;
                    state.stats.bytes_received += packet.len() as u64;
                    state.stats.last_rssi = frame.rssi;
                    state.stats.last_snr = frame.snr;
                    debug!(len = packet.len(), rssi = frame.rssi, snr = frame.snr, "packet received");

                    if state.inbound.len() >= self.rx_capacity {
                        state.inbound.pop_front();
                        state.stats.dropped_packets += 1;
                        warn!("inbound queue full, dropped oldest packet");
                    }
                    state.inbound.push_back(packet.clone());
                    state.rx_callback.clone().map(|callback| (callback, packet))
                }
                Err(RadioFault::CrcMismatch) => {
                    state.stats.crc_errors += 1;
                    warn!("dropped packet with CRC mismatch");
                    None
                }
                Err(fault) => {
                    state.stats.reception_errors += 1;
                    warn!(%fault, "failed to read received frame");
                    None
                }
            };

            if let Err(fault) = state.hardware.start_receive() {
                error!(%fault, "failed to re-arm receive");
                state.stats.reception_errors += 1;
                self.set_mode(&mut state, RadioMode::Idle);
            }
            delivery
        };

        if let Some((callback, packet)) = delivery {
            callback(&packet);
        }
    }

    /// Abandon a transmission whose completion interrupt never arrived
    async fn expire_transmit(&self) {
        let callback = {
            let Ok(mut state) = self.lock().await else {
                return;
            };
            let expired = state
                .pending
                .as_ref()
                .map(|pending| Instant::now() >= pending.deadline)
                .unwrap_or(false);
            if !expired {
                return;
            }
            let Some(pending) = state.pending.take() else {
                return;
            };
            if let Err(fault) = state.hardware.standby() {
                warn!(%fault, "standby after transmit timeout failed");
            }
            self.finalize_transmit(&mut state, pending.bytes, pending.resume_receive, &Err(RadioFault::Timeout));
            pending.callback
        };
        if let Some(callback) = callback {
            callback(Err(RadioFault::Timeout));
        }
    }
}

async fn run_worker(
    inner: Arc<RadioInner>,
    mut events: mpsc::Receiver<RadioEvent>,
    mut shutdown: ShutdownListener,
    tick: Duration,
) {
    debug!("radio worker running");
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            event = tokio::time::timeout(tick, events.recv()) => match event {
                Ok(Some(RadioEvent::TransmitDone)) => inner.handle_transmit_done().await,
                Ok(Some(RadioEvent::ReceiveDone)) => inner.handle_receive_done().await,
                Ok(None) => break,
                Err(_) => {}
            },
        }
        inner.expire_transmit().await;
    }
    debug!("radio worker stopped");
}

#[async_trait]
impl Transport for RadioTransport {
    fn interface(&self) -> Interface {
        Interface::Radio
    }

    fn status(&self) -> TransportStatus {
        *self.inner.status_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.inner.status_tx.subscribe()
    }

    fn max_payload(&self) -> usize {
        MAX_RADIO_PAYLOAD
    }

    async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.transmit_and_wait(data).await
    }

    async fn try_receive(&self) -> Option<Packet> {
        self.inner.lock().await.ok()?.inbound.pop_front()
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        Ok(TransportStats::from(&self.radio_stats().await?))
    }

    async fn reset_stats(&self) -> Result<(), TransportError> {
        let mut state = self.inner.lock().await?;
        self.inner.missed_receptions.store(0, Ordering::Relaxed);
        state.stats = RadioStats::default();
        state.clock.rebase();
        Ok(())
    }
}
