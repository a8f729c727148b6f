//! Registry of conflicts awaiting a decision.

use drawsync_protocol::{Conflict, ConflictId, Record, RecordId, Scope};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Maximum number of resolved conflicts kept for lookups.
const RESOLVED_HISTORY: usize = 256;

#[derive(Debug, Default)]
struct Registry {
    pending: BTreeMap<(Scope, RecordId), Conflict>,
    resolved: HashMap<ConflictId, Conflict>,
    resolved_order: Vec<ConflictId>,
}

/// Tracks pending conflicts, at most one per record.
#[derive(Debug, Default)]
pub struct ConflictRegistry {
    inner: Mutex<Registry>,
}

impl ConflictRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pending conflict.
    ///
    /// Returns false, keeping the existing entry, if the record already has
    /// a pending conflict.
    pub fn insert_pending(&self, conflict: Conflict) -> bool {
        let key = (conflict.scope.clone(), conflict.record_id.clone());
        let mut inner = self.inner.lock();
        if inner.pending.contains_key(&key) {
            return false;
        }
        inner.pending.insert(key, conflict);
        true
    }

    /// Returns true if the record has a pending conflict.
    pub fn is_pending(&self, scope: &Scope, record_id: &RecordId) -> bool {
        self.inner
            .lock()
            .pending
            .contains_key(&(scope.clone(), record_id.clone()))
    }

    /// Replaces the remote snapshot of a pending conflict.
    pub fn refresh_remote(&self, scope: &Scope, remote: Record) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending.get_mut(&(scope.clone(), remote.id.clone())) {
            Some(conflict) => {
                conflict.remote = remote;
                true
            }
            None => false,
        }
    }

    /// Replaces the local snapshot of a pending conflict.
    pub fn refresh_local(&self, scope: &Scope, local: Record) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending.get_mut(&(scope.clone(), local.id.clone())) {
            Some(conflict) => {
                conflict.local = local;
                true
            }
            None => false,
        }
    }

    /// Returns all pending conflicts, ordered by scope and record.
    pub fn pending(&self) -> Vec<Conflict> {
        self.inner.lock().pending.values().cloned().collect()
    }

    /// Number of pending conflicts.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Looks up a conflict, pending or recently resolved.
    pub fn get(&self, id: ConflictId) -> Option<Conflict> {
        let inner = self.inner.lock();
        inner
            .pending
            .values()
            .find(|c| c.id == id)
            .or_else(|| inner.resolved.get(&id))
            .cloned()
    }

    /// Returns the pending conflict for a record.
    pub fn pending_for(&self, scope: &Scope, record_id: &RecordId) -> Option<Conflict> {
        self.inner
            .lock()
            .pending
            .get(&(scope.clone(), record_id.clone()))
            .cloned()
    }

    /// Runs `decide` on a pending conflict; if it settles the conflict, the
    /// conflict moves to the resolved history.
    ///
    /// Returns `None` if no pending conflict has this ID.
    pub fn settle_with<F, T>(&self, id: ConflictId, decide: F) -> Option<T>
    where
        F: FnOnce(&mut Conflict) -> T,
    {
        let mut inner = self.inner.lock();
        let key = inner
            .pending
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(key, _)| key.clone())?;

        let conflict = inner.pending.get_mut(&key)?;
        let outcome = decide(conflict);
        if conflict.is_resolved() {
            if let Some(done) = inner.pending.remove(&key) {
                Self::remember(&mut inner, done);
            }
        }
        Some(outcome)
    }

    /// Records a conflict resolved without ever being pending.
    pub fn record_resolved(&self, conflict: Conflict) {
        let mut inner = self.inner.lock();
        Self::remember(&mut inner, conflict);
    }

    /// Returns pending conflicts in `scope` detected at least `after` ago.
    pub fn stale(&self, scope: &Scope, now_ms: u64, after: Duration) -> Vec<Conflict> {
        let threshold = after.as_millis() as u64;
        self.inner
            .lock()
            .pending
            .values()
            .filter(|c| &c.scope == scope && now_ms.saturating_sub(c.detected_at) >= threshold)
            .cloned()
            .collect()
    }

    fn remember(inner: &mut Registry, conflict: Conflict) {
        inner.resolved_order.push(conflict.id);
        inner.resolved.insert(conflict.id, conflict);
        if inner.resolved_order.len() > RESOLVED_HISTORY {
            let oldest = inner.resolved_order.remove(0);
            inner.resolved.remove(&oldest);
        }
    }
}
