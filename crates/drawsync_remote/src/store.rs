//! Request handling for the reference remote.

use crate::config::RemoteConfig;
use crate::error::{RemoteError, RemoteResult};
use crate::oplog::ScopeLog;
use drawsync_protocol::{
    Cursor, Origin, PullResponse, PushResponse, Record, RecordId, Rejection, Scope,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// In-memory authoritative store.
///
/// Serves pulls from a per-scope change log and accepts a pushed record
/// only if it is new or carries a higher version than the stored copy.
/// Anything else is rejected as a version conflict carrying the current
/// copy.
#[derive(Debug)]
pub struct RemoteStore {
    config: RemoteConfig,
    scopes: RwLock<HashMap<Scope, ScopeLog>>,
    available: AtomicBool,
}

impl RemoteStore {
    /// Creates an empty store with default limits.
    pub fn new() -> Self {
        Self::with_config(RemoteConfig::default())
    }

    /// Creates an empty store with the given limits.
    pub fn with_config(config: RemoteConfig) -> Self {
        Self {
            config,
            scopes: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Returns the store's limits.
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Makes every pull and push fail with [`RemoteError::Unavailable`]
    /// while `available` is false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns true if the store is serving requests.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Returns changes in `scope` after `cursor`.
    pub fn pull(&self, scope: &Scope, cursor: Cursor) -> RemoteResult<PullResponse> {
        self.ensure_available()?;
        let response = match self.scopes.read().get(scope) {
            Some(log) => log.changes_since(cursor, self.config.max_pull_batch),
            None => PullResponse::empty(cursor),
        };
        debug!(
            scope = %scope,
            cursor = %cursor,
            changes = response.changes.len(),
            new_cursor = %response.new_cursor,
            "served pull"
        );
        Ok(response)
    }

    /// Stores pushed records.
    ///
    /// Records are handled one by one: a record is acknowledged if it is
    /// valid and its version is above the stored copy, otherwise it is
    /// rejected. A rejection never affects the other records.
    pub fn push(&self, scope: &Scope, records: Vec<Record>) -> RemoteResult<PushResponse> {
        self.ensure_available()?;
        if records.len() > self.config.max_push_batch {
            return Err(RemoteError::BatchTooLarge {
                count: records.len(),
                max: self.config.max_push_batch,
            });
        }

        let mut response = PushResponse::default();
        let mut scopes = self.scopes.write();
        let log = scopes.entry(scope.clone()).or_default();

        for record in records {
            if let Err(e) = record.validate() {
                response
                    .rejected
                    .push(Rejection::invalid(record.id.clone(), e.to_string()));
                continue;
            }

            if let Some(current) = log.get(&record.id) {
                if record.version <= current.version {
                    info!(
                        scope = %scope,
                        record = %record.id,
                        pushed = record.version,
                        current = current.version,
                        "rejected stale push"
                    );
                    response
                        .rejected
                        .push(Rejection::version_conflict(current.clone()));
                    continue;
                }
            }

            let id = record.id.clone();
            log.append(Record {
                origin: Origin::Remote,
                ..record
            });
            response.acked.push(id);
        }

        debug!(
            scope = %scope,
            acked = response.acked.len(),
            rejected = response.rejected.len(),
            "handled push"
        );
        Ok(response)
    }

    /// Writes a record on the remote side, as another device would.
    ///
    /// The version is one above the stored copy.
    pub fn put(
        &self,
        scope: &Scope,
        id: impl Into<RecordId>,
        payload: Value,
        modified_at: u64,
    ) -> RemoteResult<Record> {
        let id = id.into();
        if !payload.is_object() {
            return Err(RemoteError::InvalidRequest(format!(
                "payload of {id} must be a JSON object"
            )));
        }

        let mut scopes = self.scopes.write();
        let log = scopes.entry(scope.clone()).or_default();
        let version = log.get(&id).map_or(1, |current| current.version + 1);
        let record = Record::remote(id, payload, version, modified_at);
        log.append(record.clone());
        Ok(record)
    }

    /// Deletes a record on the remote side, leaving a tombstone.
    pub fn delete(
        &self,
        scope: &Scope,
        id: impl Into<RecordId>,
        modified_at: u64,
    ) -> RemoteResult<Record> {
        let id = id.into();
        let mut scopes = self.scopes.write();
        let log = scopes.entry(scope.clone()).or_default();
        let tombstone = match log.get(&id) {
            Some(current) if !current.deleted => {
                current.tombstone(current.version + 1, modified_at)
            }
            _ => {
                return Err(RemoteError::UnknownRecord {
                    scope: scope.to_string(),
                    record_id: id.to_string(),
                })
            }
        };
        log.append(tombstone.clone());
        Ok(tombstone)
    }

    /// Current copy of a record, tombstones included.
    pub fn get(&self, scope: &Scope, id: &RecordId) -> Option<Record> {
        self.scopes.read().get(scope)?.get(id).cloned()
    }

    /// Sequence of the latest change in `scope`.
    pub fn head(&self, scope: &Scope) -> Cursor {
        self.scopes
            .read()
            .get(scope)
            .map(ScopeLog::head)
            .unwrap_or_default()
    }

    /// Number of changes accepted in `scope`.
    pub fn change_count(&self, scope: &Scope) -> usize {
        self.scopes.read().get(scope).map_or(0, ScopeLog::len)
    }

    fn ensure_available(&self) -> RemoteResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("store offline".into()))
        }
    }
}

impl Default for RemoteStore {
    fn default() -> Self {
        Self::new()
    }
}
