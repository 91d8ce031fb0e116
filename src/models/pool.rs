//! Pool statistics and connection snapshots.

use serde::Serialize;

/// Snapshot of the pool's monotonically increasing counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub opened: u64,
    pub returned: u64,
    pub expired_lifetime: u64,
    pub expired_idle: u64,
    pub expired_loan: u64,
    /// Connections dropped after a failed liveness probe
    pub invalid: u64,
    /// Acquire calls that had to wait for capacity
    pub exhausted_blocking: u64,
    /// Acquire calls rejected because the pool could not grow
    pub exhausted_rejecting: u64,
    /// Top-ups stopped by the max pool size
    pub top_up_capped: u64,
    pub sweep_runs: u64,
    pub last_sweep_duration_ms: u64,
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Available,
    Loaned,
    /// Returned by its caller, waiting for the next sweep.
    Closing,
}

/// Diagnostic view of one pooled connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub state: ConnectionState,
    pub age_ms: u64,
    /// Time since the current loan started, for loaned connections.
    pub loaned_for_ms: Option<u64>,
    /// Source location that acquired the connection.
    pub caller: Option<String>,
}
