//! Sync engine types.
//!
//! Settings, per-run reports and the status snapshot published to
//! subscribers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::classify::RetryPolicy;

/// Tunables for a [`super::SyncEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Operations dispatched per [`attempt_flush`](super::SyncEngine::attempt_flush) call.
    pub max_per_run: usize,
    /// Retry limit and backoff.
    pub retry: RetryPolicy,
    /// Period of the scheduler's flush timer.
    pub flush_interval: Duration,
    /// Queue depth at which enqueue is rejected.
    pub max_queue_depth: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_per_run: 6,
            retry: RetryPolicy::default(),
            flush_interval: Duration::from_secs(7),
            max_queue_depth: 1000,
        }
    }
}

/// Outcome of one [`attempt_flush`](super::SyncEngine::attempt_flush) call.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Operations sent to the remote API.
    pub dispatched: usize,
    pub succeeded: usize,
    /// Recoverable failures left at the head for a later run.
    pub retried: usize,
    pub dead_lettered: usize,
    /// Queue depth after the run.
    pub remaining: usize,
    /// True when another flush was already running and this call did nothing.
    pub skipped: bool,
    /// True when the run stopped because the engine was cancelled.
    #[serde(default)]
    pub cancelled: bool,
}

impl FlushReport {
    pub(crate) fn skipped(remaining: usize) -> Self {
        Self {
            remaining,
            skipped: true,
            ..Self::default()
        }
    }

    /// Returns true if nothing was dispatched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatched == 0 && self.dead_lettered == 0
    }
}

/// Coarse engine state for UIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Nothing has run yet.
    #[default]
    Idle,
    /// A flush is in progress.
    Syncing,
    /// The last flush drained the queue.
    Synced,
    /// Work is still queued (offline, backing off, or blocked).
    Pending,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Synced => write!(f, "synced"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// Snapshot published on the engine's watch channel.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Queued operations.
    pub pending: usize,
    /// Dead-lettered operations.
    pub dead_lettered: usize,
    /// End of the last completed flush (Unix milliseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report: Option<FlushReport>,
}
