// Orchestrator module - THE SWITCHBOARD
// Active transport selection, send failover, receive polling and statistics aggregation

mod policy;
mod stats;

pub use policy::{FailoverPolicy, Route, FALLBACK_ORDER};
pub use stats::{AggregateStatistics, OrchestratorCounters};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::{
    lock_with_timeout, Interface, Packet, Shutdown, ShutdownListener, Transport, TransportError,
    TransportStatus, UptimeClock,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Orchestrator tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub preferred: Interface,
    pub auto_failover: bool,
    /// Period of the background re-selection
    pub reselect_interval_ms: u64,
    /// Bound on acquiring the orchestrator's own guard
    pub lock_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            preferred: Interface::Wifi,
            auto_failover: true,
            reselect_interval_ms: 5000,
            lock_timeout_ms: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferred(mut self, interface: Interface) -> Self {
        self.preferred = interface;
        self
    }

    pub fn with_auto_failover(mut self, enabled: bool) -> Self {
        self.auto_failover = enabled;
        self
    }

    pub fn with_reselect_interval(mut self, ms: u64) -> Self {
        self.reselect_interval_ms = ms;
        self
    }

    pub fn with_lock_timeout(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    pub fn policy(&self) -> FailoverPolicy {
        FailoverPolicy::new(self.preferred).with_auto_failover(self.auto_failover)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.reselect_interval_ms == 0 {
            return Err(TransportError::ConfigurationRejected(
                "reselect_interval_ms cannot be 0".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(TransportError::ConfigurationRejected(
                "lock_timeout_ms cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Called with the interface and its new status whenever a transport changes state
pub type ConnectivityCallback = Arc<dyn Fn(Interface, TransportStatus) + Send + Sync>;

/// Outcome of a successful `receive`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes copied into the caller's buffer
    pub len: usize,
    pub source: Interface,
    /// The message was longer than the buffer
    pub truncated: bool,
}

struct OrchestratorState {
    policy: FailoverPolicy,
    active: Option<Interface>,
    counters: OrchestratorCounters,
    clock: UptimeClock,
    callbacks: Vec<ConnectivityCallback>,
}

/// Builder for [`CommunicationOrchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    transports: Vec<Arc<dyn Transport>>,
    disabled: Vec<Interface>,
}

impl OrchestratorBuilder {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Register the transport switched off; it stays out of selection until enabled
    pub fn with_interface_enabled(mut self, interface: Interface, enabled: bool) -> Self {
        self.disabled.retain(|i| *i != interface);
        if !enabled {
            self.disabled.push(interface);
        }
        self
    }

    pub fn build(self) -> Result<CommunicationOrchestrator, TransportError> {
        self.config.validate()?;
        if self.transports.is_empty() {
            return Err(TransportError::ConfigurationRejected(
                "at least one transport is required".to_string(),
            ));
        }
        for (i, transport) in self.transports.iter().enumerate() {
            let interface = transport.interface();
            if self.transports[..i].iter().any(|t| t.interface() == interface) {
                return Err(TransportError::ConfigurationRejected(format!(
                    "{} transport registered twice",
                    interface
                )));
            }
        }

        info!(
            transports = self.transports.len(),
            preferred = %self.config.preferred,
            auto_failover = self.config.auto_failover,
            "communication orchestrator created"
        );
        let enabled = self
            .transports
            .iter()
            .map(|t| AtomicBool::new(!self.disabled.contains(&t.interface())))
            .collect();
        Ok(CommunicationOrchestrator {
            transports: self.transports,
            enabled,
            state: Mutex::new(OrchestratorState {
                policy: self.config.policy(),
                active: None,
                counters: OrchestratorCounters::default(),
                clock: UptimeClock::start(),
                callbacks: Vec::new(),
            }),
            lock_timeout: Duration::from_millis(self.config.lock_timeout_ms),
            reselect_interval: Duration::from_millis(self.config.reselect_interval_ms),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Single sending/receiving surface over every configured transport
pub struct CommunicationOrchestrator {
    transports: Vec<Arc<dyn Transport>>,
    /// Enable switch per entry of `transports`
    enabled: Vec<AtomicBool>,
    state: Mutex<OrchestratorState>,
    lock_timeout: Duration,
    reselect_interval: Duration,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommunicationOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    async fn lock(&self) -> Result<MutexGuard<'_, OrchestratorState>, TransportError> {
        lock_with_timeout(&self.state, self.lock_timeout, "orchestrator").await
    }

    pub fn transport(&self, interface: Interface) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.interface() == interface)
    }

    pub fn interfaces(&self) -> Vec<Interface> {
        self.transports.iter().map(|t| t.interface()).collect()
    }

    fn position(&self, interface: Interface) -> Option<usize> {
        self.transports.iter().position(|t| t.interface() == interface)
    }

    /// Non-blocking: enabled and the transport's published status is usable
    pub fn is_interface_available(&self, interface: Interface) -> bool {
        self.is_interface_enabled(interface)
            && self
                .transport(interface)
                .map(|t| t.is_available())
                .unwrap_or(false)
    }

    pub fn is_interface_enabled(&self, interface: Interface) -> bool {
        self.position(interface)
            .map(|i| self.enabled[i].load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn enabled_interfaces(&self) -> Vec<Interface> {
        self.interfaces()
            .into_iter()
            .filter(|i| self.is_interface_enabled(*i))
            .collect()
    }

    /// Switch an interface on or off. A disabled interface is never selected,
    /// failed over to or polled for inbound messages.
    pub async fn enable_interface(&self, interface: Interface, enabled: bool) -> Result<(), TransportError> {
        let Some(index) = self.position(interface) else {
            return Err(TransportError::InvalidArgument(format!(
                "{} transport is not configured",
                interface
            )));
        };
        if self.enabled[index].swap(enabled, Ordering::AcqRel) == enabled {
            return Ok(());
        }
        info!(%interface, enabled, "interface switched");
        self.select_best_interface().await?;
        Ok(())
    }

    pub fn interface_status(&self, interface: Interface) -> Option<TransportStatus> {
        self.transport(interface).map(|t| t.status())
    }

    pub async fn active_interface(&self) -> Result<Option<Interface>, TransportError> {
        Ok(self.lock().await?.active)
    }

    pub async fn policy(&self) -> Result<FailoverPolicy, TransportError> {
        Ok(self.lock().await?.policy)
    }

    pub async fn set_auto_failover(&self, enabled: bool) -> Result<(), TransportError> {
        self.lock().await?.policy.auto_failover = enabled;
        info!(enabled, "auto failover updated");
        Ok(())
    }

    /// Prefer `interface`, switching to it right away when it is usable
    pub async fn set_preferred_interface(&self, interface: Interface) -> Result<(), TransportError> {
        if self.transport(interface).is_none() {
            return Err(TransportError::InvalidArgument(format!(
                "{} transport is not configured",
                interface
            )));
        }
        let available = self.is_interface_available(interface);

        let mut state = self.lock().await?;
        state.policy.preferred = interface;
        if available {
            switch_active(&mut state, Some(interface));
        }
        info!(%interface, available, "preferred interface set");
        Ok(())
    }

    pub async fn on_connectivity_change(&self, callback: ConnectivityCallback) -> Result<(), TransportError> {
        self.lock().await?.callbacks.push(callback);
        Ok(())
    }

    /// Make the first usable interface in priority order the active one
    pub async fn select_best_interface(&self) -> Result<Option<Interface>, TransportError> {
        let policy = self.lock().await?.policy;
        let best = policy
            .priority()
            .into_iter()
            .find(|interface| self.is_interface_available(*interface));

        let mut state = self.lock().await?;
        switch_active(&mut state, best);
        Ok(best)
    }

    /// Send `data`, failing over across transports when the route and policy allow it
    pub async fn send(&self, data: &[u8], route: Route) -> Result<Interface, TransportError> {
        if data.is_empty() {
            return Err(TransportError::InvalidArgument("payload is empty".to_string()));
        }

        let (target, policy) = match route {
            Route::Only(interface) => (Some(interface), self.lock().await?.policy),
            Route::Auto => {
                let (active, policy) = {
                    let state = self.lock().await?;
                    (state.active, state.policy)
                };
                match active {
                    Some(active) if self.is_interface_enabled(active) => (Some(active), policy),
                    _ => (self.select_best_interface().await?, policy),
                }
            }
        };

        let Some(target) = target else {
            warn!(len = data.len(), "no usable transport for send");
            self.count_failure().await;
            return Err(TransportError::AllTransportsExhausted);
        };

        let Some(transport) = self.transport(target) else {
            return Err(TransportError::InvalidArgument(format!(
                "{} transport is not configured",
                target
            )));
        };
        if !self.is_interface_enabled(target) {
            return Err(TransportError::InvalidState(format!("{} interface is disabled", target)));
        }

        let first = match transport.send(data).await {
            Ok(sent) => {
                debug!(interface = %target, len = sent, "message sent");
                self.count_send().await;
                return Ok(target);
            }
            Err(e) => e,
        };
        warn!(interface = %target, error = %first, "send failed");

        if route != Route::Auto || !policy.auto_failover {
            self.count_failure().await;
            return Err(first);
        }
        self.failover(data, target).await
    }

    /// Retry `data` on every other usable transport in fallback order
    async fn failover(&self, data: &[u8], failed: Interface) -> Result<Interface, TransportError> {
        let policy = self.lock().await?.policy;

        for candidate in policy.failover_candidates(failed) {
            let Some(transport) = self.transport(candidate) else {
                continue;
            };
            if !self.is_interface_available(candidate) {
                debug!(interface = %candidate, "skipping unavailable transport");
                continue;
            }
            match transport.send(data).await {
                Ok(_) => {
                    info!(from = %failed, to = %candidate, "failed over");
                    let mut state = self.lock().await?;
                    state.counters.sends += 1;
                    state.counters.failovers += 1;
                    switch_active(&mut state, Some(candidate));
                    return Ok(candidate);
                }
                Err(e) => warn!(interface = %candidate, error = %e, "failover attempt failed"),
            }
        }

        error!(len = data.len(), "all transports exhausted");
        self.count_failure().await;
        if let Err(e) = self.select_best_interface().await {
            warn!(error = %e, "reselection after exhaustion failed");
        }
        Err(TransportError::AllTransportsExhausted)
    }

    async fn count_send(&self) {
        if let Ok(mut state) = self.lock().await {
            state.counters.sends += 1;
        }
    }

    async fn count_failure(&self) {
        if let Ok(mut state) = self.lock().await {
            state.counters.send_failures += 1;
        }
    }

    /// First waiting packet in priority order; never waits for data
    pub async fn receive_packet(&self) -> Option<Packet> {
        let policy = match self.lock().await {
            Ok(state) => state.policy,
            Err(_) => return None,
        };
        for interface in policy.priority() {
            let Some(transport) = self.transport(interface) else {
                continue;
            };
            if !self.is_interface_enabled(interface) {
                continue;
            }
            if let Some(packet) = transport.try_receive().await {
                if let Ok(mut state) = self.lock().await {
                    state.counters.receives += 1;
                }
                return Some(packet);
            }
        }
        None
    }

    /// Copy the first waiting message into `buffer`
    pub async fn receive(&self, buffer: &mut [u8]) -> Option<Received> {
        let packet = self.receive_packet().await?;
        let len = packet.data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&packet.data[..len]);
        let truncated = len < packet.data.len();
        if truncated {
            warn!(
                source = %packet.source,
                len = packet.data.len(),
                capacity = buffer.len(),
                "received message truncated"
            );
        }
        Some(Received {
            len,
            source: packet.source,
            truncated,
        })
    }

    /// Per-transport snapshots, their sum and the orchestrator counters
    pub async fn statistics(&self) -> Result<AggregateStatistics, TransportError> {
        let mut aggregate = AggregateStatistics::default();
        for transport in &self.transports {
            match transport.stats().await {
                Ok(stats) => aggregate.record(transport.interface(), stats),
                Err(e) => warn!(interface = %transport.interface(), error = %e, "statistics unavailable"),
            }
        }

        let state = self.lock().await?;
        aggregate.counters = state.counters.clone();
        aggregate.active = state.active;
        aggregate.uptime = state.clock.elapsed();
        Ok(aggregate)
    }

    /// Reset every transport and the orchestrator counters
    pub async fn reset_statistics(&self) -> Result<(), TransportError> {
        let mut first_error = None;
        for transport in &self.transports {
            if let Err(e) = transport.reset_stats().await {
                warn!(interface = %transport.interface(), error = %e, "statistics reset failed");
                first_error.get_or_insert(e);
            }
        }

        {
            let mut state = self.lock().await?;
            state.counters = OrchestratorCounters::default();
            state.clock.rebase();
        }
        info!("statistics reset");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Spawn the periodic re-selection and the per-transport status watchers
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        self.select_best_interface().await?;

        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        tasks.push(tokio::spawn(run_maintenance(
            Arc::downgrade(self),
            self.shutdown.listener(),
            self.reselect_interval,
        )));
        for transport in &self.transports {
            tasks.push(tokio::spawn(watch_transport(
                Arc::downgrade(self),
                transport.interface(),
                transport.subscribe(),
                self.shutdown.listener(),
            )));
        }
        info!(tasks = tasks.len(), "orchestrator started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "orchestrator task ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }

    async fn status_changed(&self, interface: Interface, status: TransportStatus) {
        let (callbacks, active) = match self.lock().await {
            Ok(state) => (state.callbacks.clone(), state.active),
            Err(_) => return,
        };
        info!(%interface, %status, "connectivity changed");
        for callback in &callbacks {
            callback(interface, status);
        }

        let reselect = match active {
            Some(current) => current == interface && !status.is_usable(),
            None => status.is_usable(),
        };
        if reselect {
            if let Err(e) = self.select_best_interface().await {
                warn!(error = %e, "reselection after status change failed");
            }
        }
    }
}

fn switch_active(state: &mut OrchestratorState, next: Option<Interface>) {
    if state.active == next {
        return;
    }
    info!(from = ?state.active, to = ?next, "active interface changed");
    state.active = next;
    state.counters.interface_switches += 1;
}

async fn run_maintenance(
    orchestrator: Weak<CommunicationOrchestrator>,
    mut shutdown: ShutdownListener,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        if let Err(e) = orchestrator.select_best_interface().await {
            warn!(error = %e, "periodic reselection failed");
        }
    }
    debug!("orchestrator maintenance stopped");
}

async fn watch_transport(
    orchestrator: Weak<CommunicationOrchestrator>,
    interface: Interface,
    mut status: watch::Receiver<TransportStatus>,
    mut shutdown: ShutdownListener,
) {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let current = *status.borrow_and_update();
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.status_changed(interface, current).await;
    }
    debug!(%interface, "status watcher stopped");
}
