// Aggregate Statistics
//
// Per-interface snapshots, their sum and the orchestrator's own counters.
// Snapshots serialize with postcard for the display pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::transport::{Interface, TransportError, TransportStats};

/// Counters kept by the orchestrator itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorCounters {
    pub sends: u64,
    pub send_failures: u64,
    pub failovers: u64,
    pub interface_switches: u64,
    pub receives: u64,
}

/// Point-in-time view of every transport's statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStatistics {
    pub per_interface: BTreeMap<String, TransportStats>,
    pub total: TransportStats,
    pub counters: OrchestratorCounters,
    pub active: Option<Interface>,
    pub uptime: Duration,
}

impl AggregateStatistics {
    /// Add one transport's snapshot to the breakdown and the total
    pub fn record(&mut self, interface: Interface, stats: TransportStats) {
        self.total.accumulate(&stats);
        self.per_interface.insert(interface.name().to_string(), stats);
    }

    pub fn interface(&self, interface: Interface) -> Option<&TransportStats> {
        self.per_interface.get(interface.name())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
