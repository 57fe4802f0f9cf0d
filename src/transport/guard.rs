// Concurrency Helpers
// Bounded mutex acquisition, worker shutdown signalling and uptime tracking

use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::warn;

use crate::transport::TransportError;

/// Acquire `mutex` or give up after `timeout` with `MutexTimeout`
pub async fn lock_with_timeout<'a, T>(
    mutex: &'a Mutex<T>,
    timeout: Duration,
    resource: &'static str,
) -> Result<MutexGuard<'a, T>, TransportError> {
    match tokio::time::timeout(timeout, mutex.lock()).await {
        Ok(guard) => Ok(guard),
        Err(_) => {
            warn!(resource, timeout_ms = timeout.as_millis() as u64, "lock acquisition timed out");
            Err(TransportError::MutexTimeout(resource))
        }
    }
}

// ============================================================================
// SHUTDOWN SIGNAL
// ============================================================================

/// Owner side of a worker stop signal
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker side of a stop signal
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been requested or the owner is gone
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// UPTIME
// ============================================================================

/// Monotonic uptime counter that can be rebased on statistics reset
#[derive(Debug, Clone, Copy)]
pub struct UptimeClock {
    since: Instant,
}

impl UptimeClock {
    pub fn start() -> Self {
        Self {
            since: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.since.elapsed()
    }

    pub fn rebase(&mut self) {
        self.since = Instant::now();
    }
}
