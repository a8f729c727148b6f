//! Observable sync status.
//!
//! The engine is the only writer. Every mutation is delivered to every
//! subscriber, in order, without coalescing.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Coarse health of the local data, derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataIntegrity {
    /// Score at least 90 and no pending conflicts.
    #[default]
    Healthy,
    /// Score at least 60, or conflicts awaiting a decision.
    Warning,
    /// Anything worse.
    Error,
}

impl DataIntegrity {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataIntegrity::Healthy => "healthy",
            DataIntegrity::Warning => "warning",
            DataIntegrity::Error => "error",
        }
    }
}

/// Snapshot of the engine's sync state as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether the host reports network connectivity.
    pub is_online: bool,
    /// Whether any cycle is running.
    pub sync_in_progress: bool,
    /// Completion time of the last successful cycle (ms since epoch).
    pub last_sync_time: Option<u64>,
    /// Locally changed records not yet acknowledged by the remote.
    pub pending_changes: usize,
    /// Conflicts awaiting a decision.
    pub conflicts_detected: usize,
    /// Derived data health.
    pub data_integrity: DataIntegrity,
    /// Errors from the most recent cycles.
    pub sync_errors: Vec<String>,
}

/// Holds the current [`SyncStatus`] and fans out every change.
#[derive(Debug, Default)]
pub struct StatusHub {
    state: Mutex<SyncStatus>,
    subscribers: Mutex<Vec<UnboundedSender<SyncStatus>>>,
}

impl StatusHub {
    /// Creates a hub with the given initial status.
    pub fn new(initial: SyncStatus) -> Self {
        Self {
            state: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current status.
    pub fn snapshot(&self) -> SyncStatus {
        self.state.lock().clone()
    }

    /// Subscribes to status changes.
    ///
    /// The receiver sees every later mutation. Dropped receivers are pruned
    /// on the next publish.
    pub fn subscribe(&self) -> UnboundedReceiver<SyncStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Mutates the status and publishes the result.
    ///
    /// Nothing is published if the mutation leaves the status unchanged.
    pub fn update<F>(&self, mutate: F) -> SyncStatus
    where
        F: FnOnce(&mut SyncStatus),
    {
        let mut state = self.state.lock();
        let before = state.clone();
        mutate(&mut state);
        if *state != before {
            // published under the state lock so subscribers see mutation order
            self.subscribers
                .lock()
                .retain(|tx| tx.send(state.clone()).is_ok());
        }
        state.clone()
    }
}
