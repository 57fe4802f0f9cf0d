// WiFi Station Transport
// Station/access-point connectivity with event-driven reconnection and network scanning

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::guard::{lock_with_timeout, Shutdown, ShutdownListener, UptimeClock};
use crate::transport::{
    Interface, Packet, Transport, TransportConfig, TransportError, TransportStats, TransportStatus,
};

/// Largest datagram handed to the WiFi data path
pub const MAX_WIFI_PAYLOAD: usize = 1472;

// ============================================================================
// MODES AND STATUS
// ============================================================================

/// Radio role of the WiFi chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiMode {
    Off,
    Station,
    AccessPoint,
    StationAndAp,
}

impl WifiMode {
    pub fn has_station(&self) -> bool {
        matches!(self, Self::Station | Self::StationAndAp)
    }

    pub fn has_access_point(&self) -> bool {
        matches!(self, Self::AccessPoint | Self::StationAndAp)
    }
}

/// Station connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    LostConnection,
}

/// Security class reported by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiSecurity {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa2Enterprise,
    Wpa3Psk,
    Wpa2Wpa3Psk,
    WapiPsk,
    Unknown,
}

impl WifiSecurity {
    /// Map the driver's numeric auth mode
    pub fn from_auth_mode(mode: u8) -> Self {
        match mode {
            0 => Self::Open,
            1 => Self::Wep,
            2 => Self::WpaPsk,
            3 => Self::Wpa2Psk,
            4 => Self::WpaWpa2Psk,
            5 => Self::Wpa2Enterprise,
            6 => Self::Wpa3Psk,
            7 => Self::Wpa2Wpa3Psk,
            8 => Self::WapiPsk,
            _ => Self::Unknown,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// One entry of a network scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    pub rssi: i32,
    pub channel: u8,
    pub security: WifiSecurity,
    pub hidden: bool,
}

/// Raw scan record as reported by the driver
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub ssid: String,
    pub rssi: i32,
    pub channel: u8,
    pub auth_mode: u8,
}

impl From<ScanRecord> for WifiNetwork {
    fn from(record: ScanRecord) -> Self {
        Self {
            hidden: record.ssid.is_empty(),
            ssid: record.ssid,
            rssi: record.rssi,
            channel: record.channel,
            security: WifiSecurity::from_auth_mode(record.auth_mode),
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Addressing applied before association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpSettings {
    Dhcp,
    Static {
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        subnet: Ipv4Addr,
        dns1: Option<Ipv4Addr>,
        dns2: Option<Ipv4Addr>,
    },
}

impl Default for IpSettings {
    fn default() -> Self {
        Self::Dhcp
    }
}

fn check_ssid(ssid: &str) -> Result<(), TransportError> {
    if ssid.is_empty() || ssid.len() > 32 {
        return Err(TransportError::InvalidArgument(format!(
            "SSID must be 1-32 bytes, got {}",
            ssid.len()
        )));
    }
    if !ssid.bytes().all(|b| (0x20..0x7F).contains(&b)) {
        return Err(TransportError::InvalidArgument(
            "SSID must be printable ASCII".to_string(),
        ));
    }
    Ok(())
}

fn check_passphrase(password: &str) -> Result<(), TransportError> {
    if !password.is_empty() && !(8..=64).contains(&password.len()) {
        return Err(TransportError::InvalidArgument(format!(
            "password must be empty or 8-64 characters, got {}",
            password.len()
        )));
    }
    Ok(())
}

/// Station association settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub ssid: String,
    pub password: String,
    pub auto_reconnect: bool,
    pub connect_timeout_ms: u64,
    pub max_retries: u8,
    pub reconnect_cooldown_ms: u64,
    pub ip: IpSettings,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            auto_reconnect: true,
            connect_timeout_ms: 10_000,
            max_retries: 3,
            reconnect_cooldown_ms: 5_000,
            ip: IpSettings::Dhcp,
        }
    }
}

impl StationConfig {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            ..Self::default()
        }
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_reconnect_cooldown(mut self, ms: u64) -> Self {
        self.reconnect_cooldown_ms = ms;
        self
    }

    pub fn with_static_ip(mut self, ip: Ipv4Addr, gateway: Ipv4Addr, subnet: Ipv4Addr) -> Self {
        self.ip = IpSettings::Static {
            ip,
            gateway,
            subnet,
            dns1: None,
            dns2: None,
        };
        self
    }

    pub fn with_ip_settings(mut self, ip: IpSettings) -> Self {
        self.ip = ip;
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        check_ssid(&self.ssid)?;
        check_passphrase(&self.password)?;
        if self.connect_timeout_ms == 0 {
            return Err(TransportError::InvalidArgument(
                "connect timeout cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Soft access point settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub hidden: bool,
    pub max_clients: u8,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            channel: 1,
            hidden: false,
            max_clients: 4,
            ip: Ipv4Addr::new(192, 168, 4, 1),
            gateway: Ipv4Addr::new(192, 168, 4, 1),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
        }
    }
}

impl AccessPointConfig {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            ..Self::default()
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_max_clients(mut self, max: u8) -> Self {
        self.max_clients = max;
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        check_ssid(&self.ssid)?;
        check_passphrase(&self.password)?;
        if !(1..=13).contains(&self.channel) {
            return Err(TransportError::InvalidArgument(format!(
                "channel {} outside 1-13",
                self.channel
            )));
        }
        if !(1..=10).contains(&self.max_clients) {
            return Err(TransportError::InvalidArgument(format!(
                "max clients {} outside 1-10",
                self.max_clients
            )));
        }
        Ok(())
    }
}

/// Transport-level settings for the WiFi worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Upper bound on a blocking scan
    pub scan_timeout_ms: u64,
}

impl Default for StationTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default().with_event_queue_depth(20),
            scan_timeout_ms: 10_000,
        }
    }
}

impl StationTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_scan_timeout(mut self, ms: u64) -> Self {
        self.scan_timeout_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        self.base.validate()
    }
}

// ============================================================================
// DRIVER BOUNDARY
// ============================================================================

/// Disconnect reason the driver reports after a leave requested by this side
pub const REASON_ASSOC_LEAVE: u8 = 8;

/// Events raised by the WiFi driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    StationStarted,
    StationConnected,
    GotIp(Ipv4Addr),
    StationDisconnected { reason: u8 },
    ApStarted,
    ApStopped,
    ApClientConnected { mac: String },
    ApClientDisconnected { mac: String },
    ScanDone,
}

/// Driver-side handle feeding events to the worker
#[derive(Debug, Clone)]
pub struct WifiEventSender {
    tx: mpsc::Sender<WifiEvent>,
}

impl WifiEventSender {
    /// Never blocks; returns false when the event queue is full
    pub fn emit(&self, event: WifiEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// Current link parameters reported by the driver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkInfo {
    pub ssid: Option<String>,
    pub rssi: i32,
    pub channel: u8,
    pub ip: Option<Ipv4Addr>,
    pub mac: String,
    pub ap_clients: u8,
}

/// Failure reported by the WiFi driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverFault(pub String);

impl std::fmt::Display for DriverFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<DriverFault> for TransportError {
    fn from(fault: DriverFault) -> Self {
        TransportError::HardwareFault(fault.0)
    }
}

/// Platform WiFi stack
#[async_trait]
pub trait WifiDriver: Send + 'static {
    fn attach_events(&mut self, events: WifiEventSender);

    async fn set_mode(&mut self, mode: WifiMode) -> Result<(), DriverFault>;

    async fn configure_ip(&mut self, ip: &IpSettings) -> Result<(), DriverFault>;

    /// Begin association; the outcome arrives as an event
    async fn begin(&mut self, ssid: &str, password: &str) -> Result<(), DriverFault>;

    async fn reconnect(&mut self) -> Result<(), DriverFault>;

    async fn disconnect(&mut self) -> Result<(), DriverFault>;

    async fn start_ap(&mut self, config: &AccessPointConfig) -> Result<(), DriverFault>;

    async fn stop_ap(&mut self) -> Result<(), DriverFault>;

    /// Blocking scan
    async fn scan(&mut self) -> Result<Vec<ScanRecord>, DriverFault>;

    /// Start a scan whose completion is signalled by `WifiEvent::ScanDone`
    async fn start_scan(&mut self) -> Result<(), DriverFault>;

    fn scan_results(&mut self) -> Vec<ScanRecord>;

    async fn send(&mut self, data: &[u8]) -> Result<usize, DriverFault>;

    fn link_info(&self) -> LinkInfo;

    async fn set_power_save(&mut self, enabled: bool) -> Result<(), DriverFault>;

    async fn set_tx_power(&mut self, dbm: f32) -> Result<(), DriverFault>;
}

// ============================================================================
// STATION STATISTICS
// ============================================================================

/// Detailed WiFi counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationStats {
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub disconnections: u64,
    pub reconnections: u64,
    pub scans: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub last_rssi: i32,
    pub last_channel: u8,
    pub uptime: Duration,
}

impl From<&StationStats> for TransportStats {
    fn from(stats: &StationStats) -> Self {
        TransportStats {
            messages_sent: stats.messages_sent,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            connection_attempts: stats.connection_attempts + stats.reconnections,
            successful_connections: stats.successful_connections,
            disconnections: stats.disconnections,
            errors: stats.send_errors,
            uptime: stats.uptime,
            ..TransportStats::default()
        }
    }
}

/// Called on every station status change with a short description
pub type WifiEventCallback = Arc<dyn Fn(WifiStatus, &str) + Send + Sync>;

/// Receives the results of an asynchronous scan
pub type ScanCallback = Box<dyn FnOnce(Vec<WifiNetwork>) + Send>;

// ============================================================================
// STATION TRANSPORT
// ============================================================================

struct StationState {
    mode: WifiMode,
    status: WifiStatus,
    station: Option<StationConfig>,
    access_point: Option<AccessPointConfig>,
    ip: Option<Ipv4Addr>,
    event_callback: Option<WifiEventCallback>,
    scan_callback: Option<ScanCallback>,
    reconnecting: bool,
    retry_count: u8,
    next_retry_at: Option<Instant>,
    attempt_deadline: Option<Instant>,
    stats: StationStats,
    clock: UptimeClock,
}

type Notice = Option<(WifiEventCallback, WifiStatus, String)>;

enum WorkerAction {
    None,
    Notify(Vec<Notice>),
    Reconnect(Notice),
    DeliverScan(ScanCallback),
}

struct StationInner {
    state: Mutex<StationState>,
    driver: Mutex<Box<dyn WifiDriver>>,
    status_tx: watch::Sender<TransportStatus>,
    lock_timeout: Duration,
    scan_timeout: Duration,
}

/// WiFi station/AP transport
pub struct StationTransport {
    inner: Arc<StationInner>,
    shutdown: Shutdown,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StationTransport {
    /// Attach to the driver and spawn the event worker; must run inside a Tokio runtime
    pub fn start<D: WifiDriver>(
        mut driver: D,
        config: StationTransportConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.base.event_queue_depth);
        driver.attach_events(WifiEventSender { tx });

        let (status_tx, _) = watch::channel(TransportStatus::Wifi(WifiStatus::Disconnected));
        let inner = Arc::new(StationInner {
            state: Mutex::new(StationState {
                mode: WifiMode::Off,
                status: WifiStatus::Disconnected,
                station: None,
                access_point: None,
                ip: None,
                event_callback: None,
                scan_callback: None,
                reconnecting: false,
                retry_count: 0,
                next_retry_at: None,
                attempt_deadline: None,
                stats: StationStats::default(),
                clock: UptimeClock::start(),
            }),
            driver: Mutex::new(Box::new(driver)),
            status_tx,
            lock_timeout: config.base.lock_timeout(),
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
        });

        let shutdown = Shutdown::new();
        let worker = tokio::spawn(run_worker(
            inner.clone(),
            rx,
            shutdown.listener(),
            config.base.worker_tick(),
        ));
        info!("wifi transport started");

        Ok(Self {
            inner,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn wifi_status(&self) -> WifiStatus {
        match *self.inner.status_tx.borrow() {
            TransportStatus::Wifi(status) => status,
            _ => WifiStatus::Disconnected,
        }
    }

    pub async fn mode(&self) -> Result<WifiMode, TransportError> {
        Ok(self.inner.lock_state().await?.mode)
    }

    pub async fn set_mode(&self, mode: WifiMode) -> Result<(), TransportError> {
        self.inner.lock_driver().await?.set_mode(mode).await?;

        let notice = {
            let mut state = self.inner.lock_state().await?;
            state.mode = mode;
            if !mode.has_access_point() {
                state.access_point = None;
            }
            if !mode.has_station() && state.status != WifiStatus::Disconnected {
                if state.status == WifiStatus::Connected {
                    state.stats.disconnections += 1;
                }
                self.inner.clear_retry(&mut state);
                self.inner.set_status(&mut state, WifiStatus::Disconnected, "Station mode disabled")
            } else {
                None
            }
        };
        deliver(notice);
        debug!(?mode, "wifi mode set");
        Ok(())
    }

    /// Start associating with a network; progress is reported through `callback`
    pub async fn connect(
        &self,
        config: StationConfig,
        callback: Option<WifiEventCallback>,
    ) -> Result<(), TransportError> {
        config.validate()?;

        let leave = {
            let mut state = self.inner.lock_state().await?;
            if callback.is_some() {
                state.event_callback = callback;
            }
            if state.status == WifiStatus::Connected {
                state.stats.disconnections += 1;
                self.inner.clear_retry(&mut state);
                state.ip = None;
                Some(self.inner.set_status(&mut state, WifiStatus::Disconnected, "Disconnected"))
            } else {
                None
            }
        };
        if let Some(notice) = leave {
            deliver(notice);
            self.inner.lock_driver().await?.disconnect().await?;
            debug!("left current network before joining");
        }

        let (target_mode, notice) = {
            let mut state = self.inner.lock_state().await?;
            let target_mode = match state.mode {
                WifiMode::Station | WifiMode::StationAndAp => None,
                WifiMode::AccessPoint => Some(WifiMode::StationAndAp),
                WifiMode::Off => Some(WifiMode::Station),
            };
            if let Some(mode) = target_mode {
                state.mode = mode;
            }
            self.inner.clear_retry(&mut state);
            state.ip = None;
            state.stats.connection_attempts += 1;
            state.attempt_deadline =
                Some(Instant::now() + Duration::from_millis(config.connect_timeout_ms));
            state.station = Some(config.clone());
            let notice = self.inner.set_status(&mut state, WifiStatus::Connecting, "Connecting");
            (target_mode, notice)
        };
        deliver(notice);

        info!(ssid = %config.ssid, "connecting to wifi network");
        let outcome = async {
            let mut driver = self.inner.lock_driver().await?;
            if let Some(mode) = target_mode {
                driver.set_mode(mode).await?;
            }
            driver.configure_ip(&config.ip).await?;
            driver.begin(&config.ssid, &config.password).await?;
            Ok::<(), TransportError>(())
        }
        .await;

        if let Err(e) = outcome {
            error!(ssid = %config.ssid, error = %e, "wifi association could not start");
            let notice = {
                let mut state = self.inner.lock_state().await?;
                state.attempt_deadline = None;
                self.inner.set_status(&mut state, WifiStatus::Failed, "Connection failed")
            };
            deliver(notice);
            return Err(e);
        }
        Ok(())
    }

    /// Connect and wait until the station is `Connected` or `Failed`
    pub async fn connect_and_wait(
        &self,
        config: StationConfig,
        callback: Option<WifiEventCallback>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut rx = self.inner.status_tx.subscribe();
        self.connect(config, callback).await?;

        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    TransportStatus::Wifi(WifiStatus::Connected) => return Ok(()),
                    TransportStatus::Wifi(WifiStatus::Failed) => {
                        return Err(TransportError::ConnectionFailed(
                            "wifi association failed".to_string(),
                        ))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::ChannelClosed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::Timeout("wifi connection".to_string()))?
    }

    /// Leave the network; a no-op when already disconnected
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let notice = {
            let mut state = self.inner.lock_state().await?;
            if state.status == WifiStatus::Disconnected {
                return Ok(());
            }
            if state.status == WifiStatus::Connected {
                state.stats.disconnections += 1;
            }
            self.inner.clear_retry(&mut state);
            state.ip = None;
            self.inner.set_status(&mut state, WifiStatus::Disconnected, "Disconnected")
        };
        deliver(notice);

        self.inner.lock_driver().await?.disconnect().await?;
        info!("wifi disconnected");
        Ok(())
    }

    /// Blocking scan
    pub async fn scan_networks(&self) -> Result<Vec<WifiNetwork>, TransportError> {
        self.inner.lock_state().await?.stats.scans += 1;

        let mut driver = self.inner.lock_driver().await?;
        let records = tokio::time::timeout(self.inner.scan_timeout, driver.scan())
            .await
            .map_err(|_| TransportError::Timeout("wifi scan".to_string()))??;
        debug!(found = records.len(), "wifi scan complete");
        Ok(records.into_iter().map(WifiNetwork::from).collect())
    }

    /// Start a scan; `callback` receives the results when the driver reports completion
    pub async fn scan_networks_async(&self, callback: ScanCallback) -> Result<(), TransportError> {
        {
            let mut state = self.inner.lock_state().await?;
            if state.scan_callback.is_some() {
                return Err(TransportError::InvalidState("scan already in progress".to_string()));
            }
            state.scan_callback = Some(callback);
            state.stats.scans += 1;
        }

        let started = async { Ok::<(), TransportError>(self.inner.lock_driver().await?.start_scan().await?) }.await;
        if let Err(e) = started {
            self.inner.lock_state().await?.scan_callback = None;
            return Err(e);
        }
        Ok(())
    }

    pub async fn start_ap(&self, config: AccessPointConfig) -> Result<(), TransportError> {
        config.validate()?;

        let mode = {
            let state = self.inner.lock_state().await?;
            if state.mode.has_station() {
                WifiMode::StationAndAp
            } else {
                WifiMode::AccessPoint
            }
        };
        {
            let mut driver = self.inner.lock_driver().await?;
            driver.set_mode(mode).await?;
            driver.start_ap(&config).await?;
        }

        let mut state = self.inner.lock_state().await?;
        state.mode = mode;
        info!(ssid = %config.ssid, channel = config.channel, "access point started");
        state.access_point = Some(config);
        Ok(())
    }

    pub async fn stop_ap(&self) -> Result<(), TransportError> {
        let mode = {
            let state = self.inner.lock_state().await?;
            if state.access_point.is_none() {
                return Ok(());
            }
            if state.mode.has_station() {
                WifiMode::Station
            } else {
                WifiMode::Off
            }
        };
        {
            let mut driver = self.inner.lock_driver().await?;
            driver.stop_ap().await?;
            driver.set_mode(mode).await?;
        }

        let mut state = self.inner.lock_state().await?;
        state.mode = mode;
        state.access_point = None;
        info!("access point stopped");
        Ok(())
    }

    pub async fn station_stats(&self) -> Result<StationStats, TransportError> {
        let link = self.link_info().await.ok();
        let state = self.inner.lock_state().await?;
        let mut stats = state.stats.clone();
        if let (WifiStatus::Connected, Some(link)) = (state.status, link) {
            stats.last_rssi = link.rssi;
            stats.last_channel = link.channel;
        }
        stats.uptime = state.clock.elapsed();
        Ok(stats)
    }

    pub async fn link_info(&self) -> Result<LinkInfo, TransportError> {
        Ok(self.inner.lock_driver().await?.link_info())
    }

    pub async fn ip_address(&self) -> Result<Option<Ipv4Addr>, TransportError> {
        Ok(self.inner.lock_state().await?.ip)
    }

    pub async fn mac_address(&self) -> Result<String, TransportError> {
        Ok(self.link_info().await?.mac)
    }

    /// SSID of the joined network, only while connected
    pub async fn ssid(&self) -> Result<Option<String>, TransportError> {
        if self.wifi_status() != WifiStatus::Connected {
            return Ok(None);
        }
        Ok(self.link_info().await?.ssid)
    }

    pub async fn rssi(&self) -> Result<Option<i32>, TransportError> {
        if self.wifi_status() != WifiStatus::Connected {
            return Ok(None);
        }
        Ok(Some(self.link_info().await?.rssi))
    }

    pub async fn channel(&self) -> Result<Option<u8>, TransportError> {
        if self.wifi_status() != WifiStatus::Connected {
            return Ok(None);
        }
        Ok(Some(self.link_info().await?.channel))
    }

    pub async fn connected_clients(&self) -> Result<u8, TransportError> {
        Ok(self.link_info().await?.ap_clients)
    }

    pub async fn set_power_save(&self, enabled: bool) -> Result<(), TransportError> {
        Ok(self.inner.lock_driver().await?.set_power_save(enabled).await?)
    }

    pub async fn set_tx_power(&self, dbm: f32) -> Result<(), TransportError> {
        if !(-1.0..=20.5).contains(&dbm) {
            return Err(TransportError::InvalidArgument(format!(
                "tx power {} dBm outside -1..20.5 dBm",
                dbm
            )));
        }
        Ok(self.inner.lock_driver().await?.set_tx_power(dbm).await?)
    }

    /// Stop the event worker and drop the link
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown.trigger();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "wifi worker ended abnormally");
            }
        }
        self.disconnect().await?;
        info!("wifi transport shut down");
        Ok(())
    }
}

fn deliver(notice: Notice) {
    if let Some((callback, status, info)) = notice {
        callback(status, &info);
    }
}

impl StationInner {
    async fn lock_state(&self) -> Result<tokio::sync::MutexGuard<'_, StationState>, TransportError> {
        lock_with_timeout(&self.state, self.lock_timeout, "wifi state").await
    }

    async fn lock_driver(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Box<dyn WifiDriver>>, TransportError> {
        lock_with_timeout(&self.driver, self.lock_timeout, "wifi driver").await
    }

    /// Publish a status change and return the callback to run once the lock is released
    fn set_status(&self, state: &mut StationState, status: WifiStatus, info: &str) -> Notice {
        if state.status == status {
            return None;
        }
        debug!(from = ?state.status, to = ?status, "wifi status change");
        state.status = status;
        self.status_tx.send_replace(TransportStatus::Wifi(status));
        state
            .event_callback
            .clone()
            .map(|callback| (callback, status, info.to_string()))
    }

    fn clear_retry(&self, state: &mut StationState) {
        state.reconnecting = false;
        state.retry_count = 0;
        state.next_retry_at = None;
        state.attempt_deadline = None;
    }

    fn handle_event(&self, state: &mut StationState, event: WifiEvent) -> WorkerAction {
        match event {
            WifiEvent::StationStarted => {
                debug!("station interface started");
                WorkerAction::None
            }
            WifiEvent::StationConnected => {
                let reconnecting = match state.status {
                    WifiStatus::Connecting => None,
                    WifiStatus::LostConnection => {
                        // Driver re-associated on its own
                        self.set_status(state, WifiStatus::Connecting, "Reconnecting")
                    }
                    other => {
                        debug!(status = ?other, "ignoring association event");
                        return WorkerAction::None;
                    }
                };
                state.stats.successful_connections += 1;
                self.clear_retry(state);
                info!("wifi connected");
                let connected = self.set_status(state, WifiStatus::Connected, "Connected");
                WorkerAction::Notify(vec![reconnecting, connected])
            }
            WifiEvent::GotIp(ip) => {
                info!(%ip, "wifi got ip address");
                state.ip = Some(ip);
                WorkerAction::None
            }
            WifiEvent::StationDisconnected { reason } => match state.status {
                WifiStatus::Connected => {
                    warn!(reason, "wifi connection lost");
                    state.stats.disconnections += 1;
                    state.ip = None;
                    let auto_reconnect = state
                        .station
                        .as_ref()
                        .map(|config| config.auto_reconnect)
                        .unwrap_or(false);
                    if auto_reconnect {
                        state.next_retry_at = Some(Instant::now() + cooldown(state));
                    }
                    notice_action(self.set_status(state, WifiStatus::LostConnection, "Disconnected"))
                }
                WifiStatus::Connecting if reason == REASON_ASSOC_LEAVE => {
                    debug!("ignoring leave of the previous network");
                    WorkerAction::None
                }
                WifiStatus::Connecting => {
                    debug!(reason, "association attempt failed");
                    notice_action(self.attempt_failed(state))
                }
                _ => WorkerAction::None,
            },
            WifiEvent::ApStarted => {
                info!("access point up");
                WorkerAction::None
            }
            WifiEvent::ApStopped => {
                info!("access point down");
                WorkerAction::None
            }
            WifiEvent::ApClientConnected { mac } => {
                info!(%mac, "access point client joined");
                WorkerAction::None
            }
            WifiEvent::ApClientDisconnected { mac } => {
                info!(%mac, "access point client left");
                WorkerAction::None
            }
            WifiEvent::ScanDone => match state.scan_callback.take() {
                Some(callback) => WorkerAction::DeliverScan(callback),
                None => {
                    debug!("scan completed with no pending callback");
                    WorkerAction::None
                }
            },
        }
    }

    /// A connect or reconnect attempt did not succeed
    fn attempt_failed(&self, state: &mut StationState) -> Notice {
        state.attempt_deadline = None;
        let max_retries = state.station.as_ref().map(|c| c.max_retries).unwrap_or(0);
        if state.reconnecting && state.retry_count < max_retries {
            state.next_retry_at = Some(Instant::now() + cooldown(state));
            debug!(retry = state.retry_count, max_retries, "reconnect attempt failed, will retry");
            return None;
        }
        if state.reconnecting {
            warn!(max_retries, "wifi reconnection retries exhausted");
        } else {
            warn!("wifi connection failed");
        }
        state.reconnecting = false;
        state.next_retry_at = None;
        self.set_status(state, WifiStatus::Failed, "Connection failed")
    }

    /// Timer-driven part of the state machine
    fn check_connection(&self, state: &mut StationState) -> WorkerAction {
        let now = Instant::now();

        if state.status == WifiStatus::Connecting {
            if let Some(deadline) = state.attempt_deadline {
                if now >= deadline {
                    warn!("wifi connection attempt timed out");
                    return notice_action(self.attempt_failed(state));
                }
            }
        }

        let due = state.next_retry_at.map(|at| now >= at).unwrap_or(false);
        if !due {
            return WorkerAction::None;
        }
        let Some(config) = state.station.clone() else {
            state.next_retry_at = None;
            return WorkerAction::None;
        };

        match state.status {
            WifiStatus::LostConnection | WifiStatus::Connecting => {
                if state.retry_count >= config.max_retries {
                    state.reconnecting = false;
                    state.next_retry_at = None;
                    warn!("wifi reconnection retries exhausted");
                    return notice_action(self.set_status(state, WifiStatus::Failed, "Connection failed"));
                }
                state.retry_count += 1;
                state.reconnecting = true;
                state.next_retry_at = None;
                state.attempt_deadline = Some(now + Duration::from_millis(config.connect_timeout_ms));
                state.stats.reconnections += 1;
                info!(attempt = state.retry_count, max_retries = config.max_retries, "wifi reconnecting");
                WorkerAction::Reconnect(self.set_status(state, WifiStatus::Connecting, "Reconnecting"))
            }
            _ => {
                state.next_retry_at = None;
                WorkerAction::None
            }
        }
    }

    async fn perform(&self, action: WorkerAction) {
        match action {
            WorkerAction::None => {}
            WorkerAction::Notify(notices) => notices.into_iter().for_each(deliver),
            WorkerAction::Reconnect(notice) => {
                deliver(notice);
                let outcome = match self.lock_driver().await {
                    Ok(mut driver) => driver.reconnect().await.map_err(TransportError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    warn!(error = %e, "reconnect request failed");
                    let notice = match self.lock_state().await {
                        Ok(mut state) => self.attempt_failed(&mut state),
                        Err(_) => None,
                    };
                    deliver(notice);
                }
            }
            WorkerAction::DeliverScan(callback) => {
                let records = match self.lock_driver().await {
                    Ok(mut driver) => driver.scan_results(),
                    Err(_) => Vec::new(),
                };
                debug!(found = records.len(), "async wifi scan complete");
                callback(records.into_iter().map(WifiNetwork::from).collect());
            }
        }
    }
}

fn cooldown(state: &StationState) -> Duration {
    Duration::from_millis(
        state
            .station
            .as_ref()
            .map(|config| config.reconnect_cooldown_ms)
            .unwrap_or(5_000),
    )
}

fn notice_action(notice: Notice) -> WorkerAction {
    match notice {
        Some(_) => WorkerAction::Notify(vec![notice]),
        None => WorkerAction::None,
    }
}

async fn run_worker(
    inner: Arc<StationInner>,
    mut events: mpsc::Receiver<WifiEvent>,
    mut shutdown: ShutdownListener,
    tick: Duration,
) {
    debug!("wifi worker running");
    loop {
        let event = tokio::select! {
            _ = shutdown.triggered() => break,
            event = tokio::time::timeout(tick, events.recv()) => match event {
                Ok(Some(event)) => Some(event),
                Ok(None) => break,
                Err(_) => None,
            },
        };

        if let Some(event) = event {
            let action = match inner.lock_state().await {
                Ok(mut state) => inner.handle_event(&mut state, event),
                Err(_) => WorkerAction::None,
            };
            inner.perform(action).await;
        }

        let action = match inner.lock_state().await {
            Ok(mut state) => inner.check_connection(&mut state),
            Err(_) => WorkerAction::None,
        };
        inner.perform(action).await;
    }
    debug!("wifi worker stopped");
}

#[async_trait]
impl Transport for StationTransport {
    fn interface(&self) -> Interface {
        Interface::Wifi
    }

    fn status(&self) -> TransportStatus {
        *self.inner.status_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.inner.status_tx.subscribe()
    }

    fn max_payload(&self) -> usize {
        MAX_WIFI_PAYLOAD
    }

    async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if data.is_empty() {
            return Err(TransportError::InvalidArgument("payload is empty".to_string()));
        }
        if data.len() > MAX_WIFI_PAYLOAD {
            return Err(TransportError::InvalidArgument(format!(
                "payload of {} bytes exceeds {} byte limit",
                data.len(),
                MAX_WIFI_PAYLOAD
            )));
        }
        if self.wifi_status() != WifiStatus::Connected {
            return Err(TransportError::NotConnected);
        }

        let outcome = self.inner.lock_driver().await?.send(data).await;
        let mut state = self.inner.lock_state().await?;
        match outcome {
            Ok(sent) => {
                state.stats.messages_sent += 1;
                state.stats.bytes_sent += sent as u64;
                Ok(sent)
            }
            Err(fault) => {
                state.stats.send_errors += 1;
                warn!(%fault, "wifi send failed");
                Err(TransportError::SendFailed(fault.0))
            }
        }
    }

    async fn try_receive(&self) -> Option<Packet> {
        None
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        Ok(TransportStats::from(&self.station_stats().await?))
    }

    async fn reset_stats(&self) -> Result<(), TransportError> {
        let mut state = self.inner.lock_state().await?;
        state.stats = StationStats::default();
        state.clock.rebase();
        Ok(())
    }
}
