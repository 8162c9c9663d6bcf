//! Service lifecycle
//!
//! [`ServiceRunner`] is the cadence driver. It walks through
//! `STOPPED → STARTING → RUNNING → STOPPING → STOPPED`:
//!
//! - **Starting**: load the recovery log, rebuild open buckets from persisted
//!   capture rows, and re-submit pending batches.
//! - **Running**: capture on a fixed tick, hand flushed batches to the analysis
//!   pool, persist and aggregate completions, finalize and prune on a
//!   maintenance tick.
//! - **Stopping**: flush the partial batch into the recovery log, cancel queued
//!   analysis, give in-flight batches a grace period, then persist open buckets.

mod runner;

pub use runner::{RunSummary, ServiceRunner};

/// Lifecycle state reported by [`ServiceRunner::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
