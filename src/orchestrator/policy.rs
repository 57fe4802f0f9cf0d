// Failover Policy - Interface priority and routing rules
//
// The fixed fallback order is WiFi, then cellular, then the packet radio.
// A preferred interface, when set, is always tried first.

use serde::{Deserialize, Serialize};

use crate::transport::Interface;

/// Order tried after the preferred interface
pub const FALLBACK_ORDER: [Interface; 3] = [Interface::Wifi, Interface::Cellular, Interface::Radio];

/// Where a send should go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// The active interface, failing over when allowed
    Auto,
    /// Exactly this interface, never failing over
    Only(Interface),
}

impl Default for Route {
    fn default() -> Self {
        Self::Auto
    }
}

/// Priority ordering plus the failover switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub preferred: Interface,
    pub auto_failover: bool,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            preferred: Interface::Wifi,
            auto_failover: true,
        }
    }
}

impl FailoverPolicy {
    pub fn new(preferred: Interface) -> Self {
        Self {
            preferred,
            ..Self::default()
        }
    }

    pub fn with_auto_failover(mut self, enabled: bool) -> Self {
        self.auto_failover = enabled;
        self
    }

    /// Preferred interface first, then the fallback order without duplicates
    pub fn priority(&self) -> Vec<Interface> {
        let mut order = Vec::with_capacity(FALLBACK_ORDER.len());
        order.push(self.preferred);
        order.extend(FALLBACK_ORDER.iter().copied().filter(|i| *i != self.preferred));
        order
    }

    /// Candidates to retry after `failed`, in fallback order
    pub fn failover_candidates(&self, failed: Interface) -> Vec<Interface> {
        FALLBACK_ORDER
            .iter()
            .copied()
            .filter(|i| *i != failed)
            .collect()
    }
}
