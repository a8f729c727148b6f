//! Per-resource merge functions.
//!
//! Merging is never generic: each scope registers the function that knows
//! which of its fields may be combined. A draw's winning numbers, for
//! example, must come from one side as a whole or the result is a set of
//! numbers nobody ever drew.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{Record, Scope};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Combines the payloads of two conflicting live records.
pub trait RecordMerger: Send + Sync {
    /// Returns the merged payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payloads cannot be combined.
    fn merge(&self, local: &Record, remote: &Record) -> ProtocolResult<Value>;
}

/// Field-level merge for JSON object payloads.
///
/// - A field present on one side only is kept.
/// - A field present on both sides with equal values is kept.
/// - A field with differing values is taken from the side with the later
///   `modified_at`; a tie goes to the remote.
/// - Fields in the same atomic group are always taken together from one
///   side, chosen by the same timestamp rule, if any of them differ.
///
/// Non-object payloads are treated as a single field.
#[derive(Debug, Clone, Default)]
pub struct FieldMerger {
    atomic_groups: Vec<BTreeSet<String>>,
}

impl FieldMerger {
    /// Creates a merger with no atomic groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group of fields that must never be mixed across sides.
    pub fn with_atomic_group<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.atomic_groups
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    fn group_of(&self, field: &str) -> Option<&BTreeSet<String>> {
        self.atomic_groups.iter().find(|g| g.contains(field))
    }
}

impl RecordMerger for FieldMerger {
    fn merge(&self, local: &Record, remote: &Record) -> ProtocolResult<Value> {
        let remote_wins = remote.modified_at >= local.modified_at;

        let (Some(local_fields), Some(remote_fields)) =
            (local.payload.as_object(), remote.payload.as_object())
        else {
            let winner = if remote_wins { remote } else { local };
            return Ok(winner.payload.clone());
        };

        let mut merged = Map::new();
        let keys: BTreeSet<&String> = local_fields.keys().chain(remote_fields.keys()).collect();

        for key in keys {
            let source = match self.group_of(key) {
                Some(group) => {
                    let group_differs = group
                        .iter()
                        .any(|f| local_fields.get(f) != remote_fields.get(f));
                    if group_differs {
                        Some(if remote_wins { remote_fields } else { local_fields })
                    } else {
                        None
                    }
                }
                None => match (local_fields.get(key), remote_fields.get(key)) {
                    (Some(l), Some(r)) if l != r => {
                        Some(if remote_wins { remote_fields } else { local_fields })
                    }
                    _ => None,
                },
            };

            let value = match source {
                // the winning side may lack a grouped field; then it stays absent
                Some(side) => side.get(key).cloned(),
                None => local_fields
                    .get(key)
                    .or_else(|| remote_fields.get(key))
                    .cloned(),
            };
            if let Some(value) = value {
                merged.insert(key.clone(), value);
            }
        }

        if merged.is_empty() && !(local_fields.is_empty() && remote_fields.is_empty()) {
            return Err(ProtocolError::Merge {
                id: local.id.to_string(),
                reason: "merge produced an empty payload".into(),
            });
        }
        Ok(Value::Object(merged))
    }
}

/// Merge functions keyed by scope.
#[derive(Clone, Default)]
pub struct MergeRegistry {
    mergers: HashMap<Scope, Arc<dyn RecordMerger>>,
}

impl MergeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the merge function for a scope, replacing any previous one.
    pub fn register(&mut self, scope: Scope, merger: Arc<dyn RecordMerger>) {
        self.mergers.insert(scope, merger);
    }

    /// Builder form of [`MergeRegistry::register`].
    pub fn with(mut self, scope: Scope, merger: Arc<dyn RecordMerger>) -> Self {
        self.register(scope, merger);
        self
    }

    /// Returns the merge function for a scope.
    pub fn get(&self, scope: &Scope) -> Option<&dyn RecordMerger> {
        self.mergers.get(scope).map(|m| m.as_ref())
    }
}

impl std::fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeRegistry")
            .field("scopes", &self.mergers.keys().collect::<Vec<_>>())
            .finish()
    }
}
