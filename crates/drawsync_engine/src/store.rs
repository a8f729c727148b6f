//! Local record store used by the engine.

use crate::error::{SyncError, SyncResult};
use drawsync_protocol::{Cursor, Origin, Record, RecordId, Scope, TrackedRecord};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A local write staged by a cycle, applied at commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    /// The record and base version to store.
    pub tracked: TrackedRecord,
    /// Local version the cycle saw when it staged this write. The write is
    /// dropped if the local copy moved on since (`None` = absent locally).
    pub expected_version: Option<u64>,
}

/// Everything a cycle writes locally, committed in one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    /// Records to store, in order.
    pub writes: Vec<StagedWrite>,
    /// Records the remote acknowledged, with the acknowledged version.
    pub acked: Vec<(RecordId, u64)>,
    /// New cursor, if it advances.
    pub cursor: Option<Cursor>,
}

impl CommitBatch {
    /// Returns true if committing would change nothing.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.acked.is_empty() && self.cursor.is_none()
    }
}

/// Device-local record storage with per-scope cursors.
///
/// Implementations must apply a [`CommitBatch`] atomically with respect
/// to readers.
pub trait LocalStore: Send + Sync {
    /// Returns the scope's cursor.
    fn cursor(&self, scope: &Scope) -> SyncResult<Cursor>;

    /// Returns one record.
    fn get(&self, scope: &Scope, id: &RecordId) -> SyncResult<Option<TrackedRecord>>;

    /// Returns every record changed locally since its last sync.
    fn changed_records(&self, scope: &Scope) -> SyncResult<Vec<TrackedRecord>>;

    /// Records a local edit. `None` deletes the record.
    ///
    /// The version is bumped past the current local copy; the base version
    /// is preserved.
    fn write_local(
        &self,
        scope: &Scope,
        id: &RecordId,
        payload: Option<Value>,
        modified_at: u64,
    ) -> SyncResult<Record>;

    /// Applies a cycle's staged writes, acknowledgements and cursor.
    fn commit(&self, scope: &Scope, batch: CommitBatch) -> SyncResult<()>;

    /// Number of locally changed records.
    fn pending_count(&self, scope: &Scope) -> SyncResult<usize> {
        Ok(self.changed_records(scope)?.len())
    }
}

impl<T: LocalStore + ?Sized> LocalStore for std::sync::Arc<T> {
    fn cursor(&self, scope: &Scope) -> SyncResult<Cursor> {
        (**self).cursor(scope)
    }

    fn get(&self, scope: &Scope, id: &RecordId) -> SyncResult<Option<TrackedRecord>> {
        (**self).get(scope, id)
    }

    fn changed_records(&self, scope: &Scope) -> SyncResult<Vec<TrackedRecord>> {
        (**self).changed_records(scope)
    }

    fn write_local(
        &self,
        scope: &Scope,
        id: &RecordId,
        payload: Option<Value>,
        modified_at: u64,
    ) -> SyncResult<Record> {
        (**self).write_local(scope, id, payload, modified_at)
    }

    fn commit(&self, scope: &Scope, batch: CommitBatch) -> SyncResult<()> {
        (**self).commit(scope, batch)
    }

    fn pending_count(&self, scope: &Scope) -> SyncResult<usize> {
        (**self).pending_count(scope)
    }
}

#[derive(Debug, Default)]
struct ScopeData {
    records: BTreeMap<RecordId, TrackedRecord>,
    cursor: Cursor,
}

/// An in-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    scopes: RwLock<HashMap<Scope, ScopeData>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record directly, bypassing version bookkeeping.
    pub fn insert(&self, scope: &Scope, tracked: TrackedRecord) {
        self.scopes
            .write()
            .entry(scope.clone())
            .or_default()
            .records
            .insert(tracked.record.id.clone(), tracked);
    }

    /// Returns all records of a scope.
    pub fn records(&self, scope: &Scope) -> Vec<TrackedRecord> {
        self.scopes
            .read()
            .get(scope)
            .map(|data| data.records.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn cursor(&self, scope: &Scope) -> SyncResult<Cursor> {
        Ok(self
            .scopes
            .read()
            .get(scope)
            .map(|data| data.cursor)
            .unwrap_or_default())
    }

    fn get(&self, scope: &Scope, id: &RecordId) -> SyncResult<Option<TrackedRecord>> {
        Ok(self
            .scopes
            .read()
            .get(scope)
            .and_then(|data| data.records.get(id).cloned()))
    }

    fn changed_records(&self, scope: &Scope) -> SyncResult<Vec<TrackedRecord>> {
        Ok(self
            .scopes
            .read()
            .get(scope)
            .map(|data| {
                data.records
                    .values()
                    .filter(|t| t.is_locally_changed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn write_local(
        &self,
        scope: &Scope,
        id: &RecordId,
        payload: Option<Value>,
        modified_at: u64,
    ) -> SyncResult<Record> {
        let mut scopes = self.scopes.write();
        let data = scopes.entry(scope.clone()).or_default();

        let (version, base_version) = match data.records.get(id) {
            Some(existing) => (existing.record.version + 1, existing.base_version),
            None if payload.is_none() => {
                return Err(SyncError::Store(format!(
                    "cannot delete unknown record {id} in {scope}"
                )))
            }
            None => (1, None),
        };

        let record = Record {
            id: id.clone(),
            deleted: payload.is_none(),
            payload: payload.unwrap_or(Value::Null),
            version,
            modified_at,
            origin: Origin::Local,
        };
        data.records.insert(
            id.clone(),
            TrackedRecord {
                record: record.clone(),
                base_version,
            },
        );
        Ok(record)
    }

    fn commit(&self, scope: &Scope, batch: CommitBatch) -> SyncResult<()> {
        let mut scopes = self.scopes.write();
        let data = scopes.entry(scope.clone()).or_default();

        for write in batch.writes {
            let current = data
                .records
                .get(&write.tracked.record.id)
                .map(|t| t.record.version);
            if current != write.expected_version {
                // edited locally mid-cycle; the next cycle picks it up
                continue;
            }
            data.records
                .insert(write.tracked.record.id.clone(), write.tracked);
        }

        for (id, version) in batch.acked {
            if let Some(tracked) = data.records.get_mut(&id) {
                let base = tracked.base_version.unwrap_or(0);
                // an ack past the local version means the acked copy never landed here
                if version >= base && version <= tracked.record.version {
                    tracked.base_version = Some(version);
                }
            }
        }

        if let Some(cursor) = batch.cursor {
            data.cursor = data.cursor.max(cursor);
        }
        Ok(())
    }
}
