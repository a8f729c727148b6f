//! Per-scope change log.

use drawsync_protocol::{Cursor, PullResponse, Record, RecordId, RemoteChange};
use std::collections::BTreeMap;

/// Change log of one scope.
///
/// The log keeps:
/// - Every accepted change in sequence order
/// - The current copy of each record and the sequence that produced it
/// - The next sequence to assign
#[derive(Debug)]
pub struct ScopeLog {
    changes: Vec<RemoteChange>,
    current: BTreeMap<RecordId, (u64, Record)>,
    next_sequence: u64,
}

impl ScopeLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
            current: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    /// Sequence of the latest change, or the start cursor if there is none.
    pub fn head(&self) -> Cursor {
        Cursor(self.next_sequence - 1)
    }

    /// Current copy of a record, tombstones included.
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.current.get(id).map(|(_, record)| record)
    }

    /// Appends a change and returns its sequence.
    pub fn append(&mut self, record: Record) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.current
            .insert(record.id.clone(), (sequence, record.clone()));
        self.changes.push(RemoteChange { sequence, record });
        sequence
    }

    /// Returns up to `limit` changes after `cursor`.
    ///
    /// Superseded changes are left out: each record appears at most once,
    /// at its latest sequence. The returned cursor is the log head when
    /// everything was served, otherwise the last served sequence.
    pub fn changes_since(&self, cursor: Cursor, limit: usize) -> PullResponse {
        let start = self.changes.partition_point(|c| c.sequence <= cursor.value());
        let mut served: Vec<RemoteChange> = self.changes[start..]
            .iter()
            .filter(|c| {
                self.current
                    .get(&c.record.id)
                    .is_some_and(|(latest, _)| *latest == c.sequence)
            })
            .take(limit + 1)
            .cloned()
            .collect();

        let new_cursor = if served.len() > limit {
            served.truncate(limit);
            served.last().map(|c| Cursor(c.sequence)).unwrap_or(cursor)
        } else {
            cursor.max(self.head())
        };
        PullResponse::new(served, new_cursor)
    }

    /// Number of changes in the log.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if no change was ever accepted.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl Default for ScopeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, version: u64) -> Record {
        Record::remote(id, json!({ "v": version }), version, 0)
    }

    #[test]
    fn empty_log() {
        let log = ScopeLog::new();
        assert_eq!(log.head(), Cursor(0));
        assert!(log.is_empty());
        assert!(log.changes_since(Cursor(0), 10).changes.is_empty());
    }

    #[test]
    fn append_assigns_increasing_sequences() {
        let mut log = ScopeLog::new();
        assert_eq!(log.append(record("1", 1)), 1);
        assert_eq!(log.append(record("2", 1)), 2);
        assert_eq!(log.head(), Cursor(2));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn superseded_changes_are_not_served() {
        let mut log = ScopeLog::new();
        log.append(record("1", 1));
        log.append(record("2", 1));
        log.append(record("1", 2));

        let pulled = log.changes_since(Cursor(0), 10);
        let served: Vec<(u64, u64)> = pulled
            .changes
            .iter()
            .map(|c| (c.sequence, c.record.version))
            .collect();
        assert_eq!(served, vec![(2, 1), (3, 2)]);
        assert_eq!(pulled.new_cursor, Cursor(3));
    }

    #[test]
    fn changes_after_cursor() {
        let mut log = ScopeLog::new();
        for id in ["1", "2", "3"] {
            log.append(record(id, 1));
        }

        let pulled = log.changes_since(Cursor(2), 10);
        assert_eq!(pulled.changes.len(), 1);
        assert_eq!(pulled.changes[0].record.id, RecordId::from("3"));
    }

    #[test]
    fn limited_pull_resumes_after_last_served() {
        let mut log = ScopeLog::new();
        for id in ["1", "2", "3"] {
            log.append(record(id, 1));
        }

        let first = log.changes_since(Cursor(0), 2);
        assert_eq!(first.changes.len(), 2);
        assert_eq!(first.new_cursor, Cursor(2));

        let rest = log.changes_since(first.new_cursor, 2);
        assert_eq!(rest.changes.len(), 1);
        assert_eq!(rest.new_cursor, Cursor(3));
    }
}
