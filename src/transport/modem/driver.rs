// Modem Transport
// Power sequencing, registration, PDP data context, SMS and calls over the AT link

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::guard::{lock_with_timeout, Shutdown, ShutdownListener, UptimeClock};
use crate::transport::modem::at::{
    self, AccessTechnology, AtResponse, NetworkRegistration, SignalQuality, SimStatus, SmsMessage,
    Urc, CTRL_Z,
};
use crate::transport::modem::config::{CellularConfig, DataEndpoint, PowerTiming};
use crate::transport::modem::link::AtLink;
use crate::transport::{
    Interface, Packet, Transport, TransportError, TransportStats, TransportStatus,
};

/// Largest payload accepted by `AT+CIPSEND`
pub const MAX_CELLULAR_PAYLOAD: usize = 1500;

/// Longest text-mode SMS body
pub const MAX_SMS_LENGTH: usize = 160;

// ============================================================================
// STATUS AND REPORTS
// ============================================================================

/// Connection status of the modem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellularStatus {
    Off,
    Initializing,
    Searching,
    Registered,
    Connected,
    Disconnected,
    Error,
}

/// Which stored messages `read_sms` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsFilter {
    Unread,
    Read,
    All,
}

impl SmsFilter {
    fn storage_status(&self) -> &'static str {
        match self {
            Self::Unread => "REC UNREAD",
            Self::Read => "REC READ",
            Self::All => "ALL",
        }
    }
}

/// Snapshot of the serving network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellularNetworkInfo {
    pub operator: Option<String>,
    pub technology: AccessTechnology,
    pub registration: NetworkRegistration,
    pub rssi_dbm: Option<i16>,
    pub signal_quality: Option<u8>,
}

/// Incoming call notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    /// Caller number when caller-ID was presented
    pub number: Option<String>,
}

/// Detailed cellular counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModemStats {
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub disconnections: u64,
    pub messages_sent: u64,
    pub data_bytes_sent: u64,
    pub data_bytes_received: u64,
    pub sms_sent: u64,
    pub sms_received: u64,
    pub commands_sent: u64,
    pub command_timeouts: u64,
    pub command_errors: u64,
    pub last_rssi: i16,
    pub last_signal_quality: u8,
    pub uptime: Duration,
}

impl From<&ModemStats> for TransportStats {
    fn from(stats: &ModemStats) -> Self {
        TransportStats {
            messages_sent: stats.messages_sent + stats.sms_sent,
            messages_received: stats.sms_received,
            bytes_sent: stats.data_bytes_sent,
            bytes_received: stats.data_bytes_received,
            connection_attempts: stats.connection_attempts,
            successful_connections: stats.successful_connections,
            disconnections: stats.disconnections,
            errors: stats.command_timeouts + stats.command_errors,
            uptime: stats.uptime,
        }
    }
}

/// Called on every modem status change with a short description
pub type CellularEventCallback = Arc<dyn Fn(CellularStatus, &str) + Send + Sync>;

/// Receives messages announced by `+CMTI`
pub type SmsCallback = Arc<dyn Fn(&SmsMessage) + Send + Sync>;

/// Receives `RING` / `+CLIP` notifications
pub type CallCallback = Arc<dyn Fn(&IncomingCall) + Send + Sync>;

// ============================================================================
// HARDWARE BOUNDARY
// ============================================================================

/// Control lines of the modem
pub trait ModemControl: Send + 'static {
    fn set_power_supply(&mut self, enabled: bool);

    fn set_reset(&mut self, high: bool);

    fn set_power_key(&mut self, high: bool);
}

// ============================================================================
// MODEM TRANSPORT
// ============================================================================

struct ModemState {
    status: CellularStatus,
    powered: bool,
    config: CellularConfig,
    registration: NetworkRegistration,
    socket_open: bool,
    event_callback: Option<CellularEventCallback>,
    sms_callbacks: Vec<SmsCallback>,
    call_callbacks: Vec<CallCallback>,
    stats: ModemStats,
    clock: UptimeClock,
}

type Notice = Option<(CellularEventCallback, CellularStatus, String)>;

fn deliver(notice: Notice) {
    if let Some((callback, status, info)) = notice {
        callback(status, &info);
    }
}

struct ModemInner<S> {
    link: Mutex<AtLink<S>>,
    control: Mutex<Box<dyn ModemControl>>,
    state: Mutex<ModemState>,
    status_tx: watch::Sender<TransportStatus>,
    lock_timeout: Duration,
    link_timeout: Duration,
    idle_read: Duration,
}

/// Cellular transport over an AT command serial link
pub struct ModemTransport<S> {
    inner: Arc<ModemInner<S>>,
    shutdown: Shutdown,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S> ModemTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Take ownership of the serial link and spawn the worker; must run inside a Tokio runtime
    pub fn start<C: ModemControl>(
        serial: S,
        mut control: C,
        config: CellularConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        control.set_power_supply(true);

        let (status_tx, _) = watch::channel(TransportStatus::Cellular(CellularStatus::Off));
        let tick = config.base.worker_tick();
        let inner = Arc::new(ModemInner {
            link: Mutex::new(AtLink::new(serial)),
            control: Mutex::new(Box::new(control) as Box<dyn ModemControl>),
            lock_timeout: config.base.lock_timeout(),
            link_timeout: Duration::from_millis(config.link_lock_timeout_ms),
            idle_read: Duration::from_millis(config.idle_read_ms),
            state: Mutex::new(ModemState {
                status: CellularStatus::Off,
                powered: false,
                config,
                registration: NetworkRegistration::NotRegistered,
                socket_open: false,
                event_callback: None,
                sms_callbacks: Vec::new(),
                call_callbacks: Vec::new(),
                stats: ModemStats::default(),
                clock: UptimeClock::start(),
            }),
            status_tx,
        });

        let shutdown = Shutdown::new();
        let worker = tokio::spawn(run_worker(inner.clone(), shutdown.listener(), tick));
        info!("cellular transport started");

        Ok(Self {
            inner,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn cellular_status(&self) -> CellularStatus {
        match *self.inner.status_tx.borrow() {
            TransportStatus::Cellular(status) => status,
            _ => CellularStatus::Off,
        }
    }

    pub async fn is_powered(&self) -> Result<bool, TransportError> {
        Ok(self.inner.lock_state().await?.powered)
    }

    pub async fn config(&self) -> Result<CellularConfig, TransportError> {
        Ok(self.inner.lock_state().await?.config.clone())
    }

    pub async fn set_event_callback(&self, callback: CellularEventCallback) -> Result<(), TransportError> {
        self.inner.lock_state().await?.event_callback = Some(callback);
        Ok(())
    }

    pub async fn on_sms(&self, callback: SmsCallback) -> Result<(), TransportError> {
        self.inner.lock_state().await?.sms_callbacks.push(callback);
        Ok(())
    }

    pub async fn on_call(&self, callback: CallCallback) -> Result<(), TransportError> {
        self.inner.lock_state().await?.call_callbacks.push(callback);
        Ok(())
    }

    /// Raw command round trip; no retry on timeout
    pub async fn send_at_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<AtResponse, TransportError> {
        self.inner.command(command, timeout).await
    }

    // ------------------------------------------------------------------------
    // Power
    // ------------------------------------------------------------------------

    /// Pulse the control lines and wait for the modem to answer `AT`
    pub async fn power_on(&self) -> Result<(), TransportError> {
        let (config, notice) = {
            let mut state = self.inner.lock_state().await?;
            if state.powered {
                debug!("modem already powered on");
                return Ok(());
            }
            let notice = self.inner.set_status(&mut state, CellularStatus::Initializing, "Powering on");
            (state.config.clone(), notice)
        };
        deliver(notice);

        info!("powering on modem");
        self.pulse_power_on(&config.power).await?;

        let timeout = config.command_timeout();
        for attempt in 1..=config.power_on_attempts {
            match self.inner.command("AT", timeout).await {
                Ok(response) if response.is_ok() => {
                    info!(attempt, "modem responding");
                    self.inner.lock_state().await?.powered = true;
                    return self.finish_power_on(timeout).await;
                }
                Ok(response) => debug!(attempt, result = ?response.result, "modem not ready"),
                Err(e) => debug!(attempt, error = %e, "modem not responding"),
            }
            if attempt < config.power_on_attempts {
                tokio::time::sleep(Duration::from_millis(config.power_on_retry_ms)).await;
            }
        }

        error!(attempts = config.power_on_attempts, "modem failed to power on");
        self.inner.change_status(CellularStatus::Error, "No response from modem").await;
        Err(TransportError::HardwareInitFailure(format!(
            "modem did not answer after {} attempts",
            config.power_on_attempts
        )))
    }

    async fn finish_power_on(&self, timeout: Duration) -> Result<(), TransportError> {
        if let Err(e) = self.initialize_modem(timeout).await {
            error!(error = %e, "modem initialization failed");
            if let Err(off) = self.power_off().await {
                warn!(error = %off, "power off after failed initialization");
            }
            self.inner.change_status(CellularStatus::Error, "Initialization failed").await;
            return Err(TransportError::HardwareInitFailure(format!(
                "modem initialization failed: {}",
                e
            )));
        }
        self.inner.change_status(CellularStatus::Disconnected, "Powered on").await;
        info!("modem powered on");
        Ok(())
    }

    async fn initialize_modem(&self, timeout: Duration) -> Result<(), TransportError> {
        for command in ["ATE0", "AT+CMEE=2", "AT+CREG=2", "AT+CNMI=2,1,0,0,0"] {
            self.inner.expect_ok(command, timeout).await?;
        }
        debug!("modem initialized");
        Ok(())
    }

    async fn pulse_power_on(&self, timing: &PowerTiming) -> Result<(), TransportError> {
        let mut control = lock_with_timeout(&self.inner.control, self.inner.lock_timeout, "modem control").await?;
        control.set_reset(false);
        pause(timing.reset_pulse_ms).await;
        control.set_reset(true);
        pause(timing.reset_settle_ms).await;
        control.set_power_key(false);
        pause(timing.power_key_pulse_ms).await;
        control.set_power_key(true);
        pause(timing.boot_wait_ms).await;
        Ok(())
    }

    /// Ask the modem to shut down, then force it with the power key
    pub async fn power_off(&self) -> Result<(), TransportError> {
        let (config, connected) = {
            let state = self.inner.lock_state().await?;
            if !state.powered {
                return Ok(());
            }
            (state.config.clone(), state.status == CellularStatus::Connected)
        };

        info!("powering off modem");
        if connected {
            if let Err(e) = self.disconnect().await {
                warn!(error = %e, "disconnect before power off failed");
            }
        }
        let timeout = Duration::from_millis(config.power.power_off_command_ms);
        if let Err(e) = self.inner.command("AT+CPOF", timeout).await {
            debug!(error = %e, "AT+CPOF not acknowledged");
        }

        {
            let mut control =
                lock_with_timeout(&self.inner.control, self.inner.lock_timeout, "modem control").await?;
            control.set_power_key(false);
            pause(config.power.power_off_pulse_ms).await;
            control.set_power_key(true);
        }

        let notice = {
            let mut state = self.inner.lock_state().await?;
            state.powered = false;
            state.socket_open = false;
            state.registration = NetworkRegistration::NotRegistered;
            self.inner.set_status(&mut state, CellularStatus::Off, "Powered off")
        };
        deliver(notice);
        info!("modem powered off");
        Ok(())
    }

    pub async fn power_cycle(&self) -> Result<(), TransportError> {
        let pause_ms = self.inner.lock_state().await?.config.power.power_cycle_pause_ms;
        self.power_off().await?;
        pause(pause_ms).await;
        self.power_on().await
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Register on the network and activate the data context
    pub async fn connect(&self, callback: Option<CellularEventCallback>) -> Result<(), TransportError> {
        let (config, notice) = {
            let mut state = self.inner.lock_state().await?;
            if !state.powered {
                return Err(TransportError::InvalidState("modem is not powered on".to_string()));
            }
            if callback.is_some() {
                state.event_callback = callback;
            }
            if state.status == CellularStatus::Connected {
                return Ok(());
            }
            state.stats.connection_attempts += 1;
            let notice = self.inner.set_status(&mut state, CellularStatus::Searching, "Searching for network");
            (state.config.clone(), notice)
        };
        deliver(notice);

        info!(apn = %config.apn.apn, "connecting to cellular network");
        match self.establish(&config).await {
            Ok(()) => {
                let notice = {
                    let mut state = self.inner.lock_state().await?;
                    state.stats.successful_connections += 1;
                    self.inner.set_status(&mut state, CellularStatus::Connected, "Connected")
                };
                deliver(notice);
                info!("cellular connected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "cellular connection failed");
                self.inner.change_status(CellularStatus::Error, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, config: &CellularConfig) -> Result<(), TransportError> {
        let timeout = config.command_timeout();

        let mut sim = self.sim_status().await?;
        if sim == SimStatus::PinRequired {
            if let Some(pin) = &config.pin {
                self.inner.expect_ok(&format!("AT+CPIN=\"{}\"", pin), timeout).await?;
                sim = self.sim_status().await?;
            }
        }
        if sim != SimStatus::Ready {
            return Err(TransportError::SimNotReady(sim));
        }

        self.setup_pdp(config).await?;
        self.wait_for_registration(config).await?;
        self.inner.change_status(CellularStatus::Registered, "Registered").await;

        self.inner
            .expect_ok("AT+CGACT=1,1", Duration::from_millis(config.pdp_timeout_ms))
            .await?;
        if let Some(endpoint) = &config.data_endpoint {
            self.open_socket(endpoint, config).await?;
        }
        Ok(())
    }

    async fn setup_pdp(&self, config: &CellularConfig) -> Result<(), TransportError> {
        let timeout = config.command_timeout();
        let apn = &config.apn;
        self.inner
            .expect_ok(&format!("AT+CGDCONT=1,\"IP\",\"{}\"", apn.apn), timeout)
            .await?;
        if !apn.username.is_empty() {
            self.inner
                .expect_ok(
                    &format!(
                        "AT+CGAUTH=1,{},\"{}\",\"{}\"",
                        apn.auth.code(),
                        apn.username,
                        apn.password
                    ),
                    timeout,
                )
                .await?;
        }
        Ok(())
    }

    async fn wait_for_registration(&self, config: &CellularConfig) -> Result<(), TransportError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(config.registration_timeout_ms);
        let poll = Duration::from_millis(config.registration_poll_ms);

        loop {
            match self.registration().await {
                Ok(registration) if registration.is_registered() => {
                    info!(?registration, "registered on network");
                    return Ok(());
                }
                Ok(registration) => debug!(?registration, "waiting for registration"),
                Err(e) if e.is_timeout() => debug!(error = %e, "registration query timed out"),
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, "network registration timed out");
                return Err(TransportError::RegistrationTimeout { waited_ms });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn open_socket(&self, endpoint: &DataEndpoint, config: &CellularConfig) -> Result<(), TransportError> {
        let timeout = Duration::from_millis(config.pdp_timeout_ms);
        self.inner.expect_ok("AT+NETOPEN", timeout).await?;
        self.inner
            .expect_ok(
                &format!(
                    "AT+CIPOPEN=0,\"{}\",\"{}\",{}",
                    endpoint.protocol, endpoint.host, endpoint.port
                ),
                timeout,
            )
            .await?;
        self.inner.lock_state().await?.socket_open = true;
        info!(host = %endpoint.host, port = endpoint.port, "cellular socket open");
        Ok(())
    }

    /// Deactivate the data context; a no-op unless connected
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let (socket_open, config, notice) = {
            let mut state = self.inner.lock_state().await?;
            let status = state.status;
            match status {
                CellularStatus::Connected => {}
                CellularStatus::Searching | CellularStatus::Registered | CellularStatus::Error
                    if state.powered =>
                {
                    let notice = self.inner.set_status(&mut state, CellularStatus::Disconnected, "Disconnected");
                    drop(state);
                    deliver(notice);
                    return Ok(());
                }
                _ => return Ok(()),
            }
            state.stats.disconnections += 1;
            let socket_open = std::mem::replace(&mut state.socket_open, false);
            let notice = self.inner.set_status(&mut state, CellularStatus::Disconnected, "Disconnected");
            (socket_open, state.config.clone(), notice)
        };
        deliver(notice);

        let timeout = config.command_timeout();
        if socket_open {
            for command in ["AT+CIPCLOSE=0", "AT+NETCLOSE"] {
                if let Err(e) = self.inner.expect_ok(command, timeout).await {
                    debug!(command, error = %e, "socket teardown step failed");
                }
            }
        }
        if let Err(e) = self
            .inner
            .expect_ok("AT+CGACT=0,1", Duration::from_millis(config.pdp_timeout_ms))
            .await
        {
            warn!(error = %e, "PDP context deactivation failed");
        }
        info!("cellular disconnected");
        Ok(())
    }

    /// Disconnect, then replace the configuration
    pub async fn update_config(&self, config: CellularConfig) -> Result<(), TransportError> {
        config.validate()?;
        self.disconnect().await?;
        self.inner.lock_state().await?.config = config;
        info!("cellular configuration updated");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // SMS
    // ------------------------------------------------------------------------

    pub async fn send_sms(&self, number: &str, text: &str) -> Result<(), TransportError> {
        check_number(number)?;
        if text.chars().count() > MAX_SMS_LENGTH {
            return Err(TransportError::InvalidArgument(format!(
                "SMS text longer than {} characters",
                MAX_SMS_LENGTH
            )));
        }
        if text.bytes().any(|b| b == CTRL_Z || b == 0x1B) {
            return Err(TransportError::InvalidArgument(
                "SMS text contains control characters".to_string(),
            ));
        }

        let config = {
            let state = self.inner.lock_state().await?;
            if state.status != CellularStatus::Connected {
                return Err(TransportError::NotConnected);
            }
            state.config.clone()
        };

        self.inner.expect_ok("AT+CMGF=1", config.command_timeout()).await?;
        let command = format!("AT+CMGS=\"{}\"", number);
        let response = self
            .inner
            .payload_command(
                &command,
                text.as_bytes(),
                Some(CTRL_Z),
                Duration::from_millis(config.sms_timeout_ms),
            )
            .await?
            .into_ok()?;

        self.inner.lock_state().await?.stats.sms_sent += 1;
        info!(number, reference = ?response.field("+CMGS:"), "SMS sent");
        Ok(())
    }

    pub async fn read_sms(&self, filter: SmsFilter) -> Result<Vec<SmsMessage>, TransportError> {
        let config = self.inner.require_powered().await?;
        self.inner.expect_ok("AT+CMGF=1", config.command_timeout()).await?;
        let response = self
            .inner
            .expect_ok(
                &format!("AT+CMGL=\"{}\"", filter.storage_status()),
                Duration::from_millis(config.storage_timeout_ms),
            )
            .await?;
        let messages = at::parse_cmgl(&response);
        debug!(count = messages.len(), ?filter, "read stored SMS");
        Ok(messages)
    }

    pub async fn read_sms_at(&self, index: u16) -> Result<Option<SmsMessage>, TransportError> {
        self.inner.read_sms_at(index).await
    }

    pub async fn delete_sms(&self, index: u16) -> Result<(), TransportError> {
        let config = self.inner.require_powered().await?;
        self.inner
            .expect_ok(&format!("AT+CMGD={}", index), config.command_timeout())
            .await?;
        debug!(index, "deleted SMS");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Voice
    // ------------------------------------------------------------------------

    pub async fn make_call(&self, number: &str) -> Result<(), TransportError> {
        check_number(number)?;
        let config = {
            let state = self.inner.lock_state().await?;
            if !matches!(state.status, CellularStatus::Connected | CellularStatus::Registered) {
                return Err(TransportError::NotConnected);
            }
            state.config.clone()
        };
        self.inner
            .expect_ok(&format!("ATD{};", number), config.command_timeout() * 5)
            .await?;
        info!(number, "dialling");
        Ok(())
    }

    pub async fn answer_call(&self) -> Result<(), TransportError> {
        let config = self.inner.require_powered().await?;
        self.inner.expect_ok("ATA", config.command_timeout() * 5).await?;
        info!("call answered");
        Ok(())
    }

    pub async fn hangup_call(&self) -> Result<(), TransportError> {
        let config = self.inner.require_powered().await?;
        self.inner.expect_ok("ATH", config.command_timeout() * 5).await?;
        info!("call ended");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn sim_status(&self) -> Result<SimStatus, TransportError> {
        let config = self.inner.require_powered().await?;
        let response = self.inner.command("AT+CPIN?", config.command_timeout()).await?;
        Ok(at::parse_cpin(&response))
    }

    /// Current registration from `AT+CREG?`
    pub async fn registration(&self) -> Result<NetworkRegistration, TransportError> {
        let config = self.inner.require_powered().await?;
        let response = self.inner.expect_ok("AT+CREG?", config.command_timeout()).await?;
        let registration = at::parse_creg(&response).unwrap_or(NetworkRegistration::Unknown);
        self.inner.lock_state().await?.registration = registration;
        Ok(registration)
    }

    pub async fn signal_quality(&self) -> Result<SignalQuality, TransportError> {
        let config = self.inner.require_powered().await?;
        let response = self.inner.expect_ok("AT+CSQ", config.command_timeout()).await?;
        let quality = at::parse_csq(&response).ok_or_else(|| TransportError::CommandRejected {
            command: "AT+CSQ".to_string(),
            reason: "unparseable signal report".to_string(),
        })?;
        if let (Some(rssi), Some(q)) = (quality.rssi_dbm, quality.quality) {
            let mut state = self.inner.lock_state().await?;
            state.stats.last_rssi = rssi;
            state.stats.last_signal_quality = q;
        }
        Ok(quality)
    }

    pub async fn network_info(&self) -> Result<CellularNetworkInfo, TransportError> {
        let config = self.inner.require_powered().await?;
        let cops = self.inner.expect_ok("AT+COPS?", config.command_timeout()).await?;
        let operator = at::parse_cops(&cops);
        let registration = self.registration().await?;
        let quality = self.signal_quality().await?;
        Ok(CellularNetworkInfo {
            technology: operator
                .as_ref()
                .map(|op| op.technology)
                .unwrap_or(AccessTechnology::Unknown),
            operator: operator.map(|op| op.name),
            registration,
            rssi_dbm: quality.rssi_dbm,
            signal_quality: quality.quality,
        })
    }

    pub async fn imei(&self) -> Result<String, TransportError> {
        let config = self.inner.require_powered().await?;
        let response = self.inner.expect_ok("AT+CGSN", config.command_timeout()).await?;
        response
            .lines
            .iter()
            .map(|line| line.trim())
            .find(|line| !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()))
            .map(str::to_string)
            .ok_or_else(|| TransportError::CommandRejected {
                command: "AT+CGSN".to_string(),
                reason: "no IMEI in response".to_string(),
            })
    }

    pub async fn iccid(&self) -> Result<String, TransportError> {
        let config = self.inner.require_powered().await?;
        let response = self.inner.expect_ok("AT+CICCID", config.command_timeout()).await?;
        response
            .field("+ICCID:")
            .map(str::to_string)
            .ok_or_else(|| TransportError::CommandRejected {
                command: "AT+CICCID".to_string(),
                reason: "no ICCID in response".to_string(),
            })
    }

    /// Manufacturer, model and revision lines from `ATI`
    pub async fn modem_info(&self) -> Result<String, TransportError> {
        let config = self.inner.require_powered().await?;
        let response = self.inner.expect_ok("ATI", config.command_timeout()).await?;
        Ok(response.lines.join("\n"))
    }

    pub async fn modem_stats(&self) -> Result<ModemStats, TransportError> {
        let state = self.inner.lock_state().await?;
        let mut stats = state.stats.clone();
        stats.uptime = state.clock.elapsed();
        Ok(stats)
    }

    /// Stop the worker and power the modem down
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown.trigger();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "cellular worker ended abnormally");
            }
        }
        self.power_off().await?;
        info!("cellular transport shut down");
        Ok(())
    }
}

fn check_number(number: &str) -> Result<(), TransportError> {
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit() || b == b'*' || b == b'#') {
        return Err(TransportError::InvalidArgument(format!(
            "invalid phone number '{}'",
            number
        )));
    }
    Ok(())
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

impl<S> ModemInner<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn lock_state(&self) -> Result<tokio::sync::MutexGuard<'_, ModemState>, TransportError> {
        lock_with_timeout(&self.state, self.lock_timeout, "modem state").await
    }

    fn set_status(&self, state: &mut ModemState, status: CellularStatus, info: &str) -> Notice {
        if state.status == status {
            return None;
        }
        debug!(from = ?state.status, to = ?status, "cellular status change");
        state.status = status;
        self.status_tx.send_replace(TransportStatus::Cellular(status));
        state
            .event_callback
            .clone()
            .map(|callback| (callback, status, info.to_string()))
    }

    /// Status change followed by callback delivery outside the lock
    async fn change_status(&self, status: CellularStatus, info: &str) {
        let notice = match self.lock_state().await {
            Ok(mut state) => self.set_status(&mut state, status, info),
            Err(_) => None,
        };
        deliver(notice);
    }

    async fn require_powered(&self) -> Result<CellularConfig, TransportError> {
        let state = self.lock_state().await?;
        if !state.powered {
            return Err(TransportError::InvalidState("modem is not powered on".to_string()));
        }
        Ok(state.config.clone())
    }

    async fn command(&self, command: &str, timeout: Duration) -> Result<AtResponse, TransportError> {
        let outcome = {
            let mut link = lock_with_timeout(&self.link, self.link_timeout, "modem link").await?;
            link.command(command, timeout).await
        };
        self.record_command(&outcome).await;
        outcome
    }

    async fn payload_command(
        &self,
        command: &str,
        payload: &[u8],
        terminator: Option<u8>,
        timeout: Duration,
    ) -> Result<AtResponse, TransportError> {
        let outcome = {
            let mut link = lock_with_timeout(&self.link, self.link_timeout, "modem link").await?;
            link.command_with_payload(command, payload, terminator, timeout).await
        };
        self.record_command(&outcome).await;
        outcome
    }

    async fn expect_ok(&self, command: &str, timeout: Duration) -> Result<AtResponse, TransportError> {
        self.command(command, timeout).await?.into_ok()
    }

    async fn record_command(&self, outcome: &Result<AtResponse, TransportError>) {
        let Ok(mut state) = self.lock_state().await else {
            return;
        };
        state.stats.commands_sent += 1;
        match outcome {
            Err(TransportError::CommandTimeout { .. }) => state.stats.command_timeouts += 1,
            Ok(response) if !response.is_ok() => state.stats.command_errors += 1,
            _ => {}
        }
    }

    async fn read_sms_at(&self, index: u16) -> Result<Option<SmsMessage>, TransportError> {
        let config = self.require_powered().await?;
        self.expect_ok("AT+CMGF=1", config.command_timeout()).await?;
        let response = self
            .command(&format!("AT+CMGR={}", index), Duration::from_millis(config.storage_timeout_ms))
            .await?;
        if !response.is_ok() {
            debug!(index, result = ?response.result, "no message at index");
            return Ok(None);
        }
        Ok(at::parse_cmgr(&response, index))
    }

    /// Idle-time servicing: read stray traffic, dispatch notifications, keep the link alive
    async fn service(&self) {
        let polled = match tokio::time::timeout(Duration::from_millis(10), self.link.lock()).await {
            Ok(mut link) => {
                if let Err(e) = link.poll_unsolicited(self.idle_read).await {
                    debug!(error = %e, "idle serial read failed");
                }
                Some((link.take_unsolicited(), link.idle_for()))
            }
            // A command owns the link; its unsolicited lines are picked up next pass
            Err(_) => None,
        };
        let Some((urcs, idle)) = polled else {
            return;
        };

        for urc in urcs {
            self.dispatch(urc).await;
        }

        let keepalive = match self.lock_state().await {
            Ok(state) if state.status == CellularStatus::Connected => {
                let interval = Duration::from_millis(state.config.keepalive_ms);
                (idle >= interval).then(|| state.config.command_timeout())
            }
            _ => None,
        };
        if let Some(timeout) = keepalive {
            debug!("sending keep-alive");
            if let Err(e) = self.command("AT", timeout).await {
                warn!(error = %e, "keep-alive failed");
            }
        }
    }

    async fn dispatch(&self, urc: Urc) {
        match urc {
            Urc::NewMessage { storage, index } => {
                let callbacks = match self.lock_state().await {
                    Ok(mut state) => {
                        state.stats.sms_received += 1;
                        state.sms_callbacks.clone()
                    }
                    Err(_) => return,
                };
                info!(%storage, index, "new SMS stored");
                if callbacks.is_empty() {
                    return;
                }
                match self.read_sms_at(index).await {
                    Ok(Some(message)) => {
                        for callback in &callbacks {
                            callback(&message);
                        }
                    }
                    Ok(None) => warn!(index, "announced SMS could not be read"),
                    Err(e) => warn!(index, error = %e, "failed to fetch announced SMS"),
                }
            }
            Urc::Ring => self.notify_call(IncomingCall { number: None }).await,
            Urc::CallerId { number } => {
                self.notify_call(IncomingCall {
                    number: Some(number),
                })
                .await
            }
            Urc::Registration(registration) => {
                let notice = match self.lock_state().await {
                    Ok(mut state) => {
                        state.registration = registration;
                        if state.status == CellularStatus::Connected && !registration.is_registered() {
                            warn!(?registration, "network registration lost");
                            state.stats.disconnections += 1;
                            state.socket_open = false;
                            self.set_status(&mut state, CellularStatus::Disconnected, "Network registration lost")
                        } else {
                            debug!(?registration, "registration update");
                            None
                        }
                    }
                    Err(_) => None,
                };
                deliver(notice);
            }
            Urc::ModemReady => info!("modem reports ready"),
            Urc::Other(line) => debug!(line = %line, "unhandled unsolicited line"),
        }
    }

    async fn notify_call(&self, call: IncomingCall) {
        let callbacks = match self.lock_state().await {
            Ok(state) => state.call_callbacks.clone(),
            Err(_) => return,
        };
        info!(number = ?call.number, "incoming call");
        for callback in &callbacks {
            callback(&call);
        }
    }
}

async fn run_worker<S>(inner: Arc<ModemInner<S>>, mut shutdown: ShutdownListener, tick: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("cellular worker running");
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(tick) => {}
        }
        inner.service().await;
    }
    debug!("cellular worker stopped");
}

#[async_trait]
impl<S> Transport for ModemTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn interface(&self) -> Interface {
        Interface::Cellular
    }

    fn status(&self) -> TransportStatus {
        *self.inner.status_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.inner.status_tx.subscribe()
    }

    fn max_payload(&self) -> usize {
        MAX_CELLULAR_PAYLOAD
    }

    async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if data.is_empty() {
            return Err(TransportError::InvalidArgument("payload is empty".to_string()));
        }
        if data.len() > MAX_CELLULAR_PAYLOAD {
            return Err(TransportError::InvalidArgument(format!(
                "payload of {} bytes exceeds {} byte limit",
                data.len(),
                MAX_CELLULAR_PAYLOAD
            )));
        }

        let config = {
            let state = self.inner.lock_state().await?;
            if state.status != CellularStatus::Connected {
                return Err(TransportError::NotConnected);
            }
            if !state.socket_open {
                return Err(TransportError::InvalidState(
                    "no data endpoint configured".to_string(),
                ));
            }
            state.config.clone()
        };

        let command = format!("AT+CIPSEND=0,{}", data.len());
        let response = self
            .inner
            .payload_command(&command, data, None, Duration::from_millis(config.data_timeout_ms))
            .await?;
        if let Err(e) = response.into_ok() {
            warn!(error = %e, "cellular send rejected");
            return Err(TransportError::SendFailed(e.to_string()));
        }

        let mut state = self.inner.lock_state().await?;
        state.stats.messages_sent += 1;
        state.stats.data_bytes_sent += data.len() as u64;
        Ok(data.len())
    }

    async fn try_receive(&self) -> Option<Packet> {
        None
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        Ok(TransportStats::from(&self.modem_stats().await?))
    }

    async fn reset_stats(&self) -> Result<(), TransportError> {
        let mut state = self.inner.lock_state().await?;
        state.stats = ModemStats::default();
        state.clock.rebase();
        Ok(())
    }
}
