//! Replicated records.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A unit of independent synchronization, typically one resource table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    /// Creates a scope from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the scope name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Opaque record key, unique within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Creates a record ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Which side produced a record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Produced on this device.
    Local,
    /// Produced by the remote authoritative store.
    Remote,
}

/// A replicated domain entity.
///
/// `version` is monotonic per record: once the engine has observed a
/// version it never accepts a lower one for the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record key.
    pub id: RecordId,
    /// Domain payload. A JSON object for live records.
    pub payload: Value,
    /// Monotonic version counter.
    pub version: u64,
    /// Last modification time (ms since epoch).
    pub modified_at: u64,
    /// Tombstone flag.
    #[serde(default)]
    pub deleted: bool,
    /// Side that produced this version.
    pub origin: Origin,
}

impl Record {
    /// Creates a live local record.
    pub fn local(id: impl Into<RecordId>, payload: Value, version: u64, modified_at: u64) -> Self {
        Self {
            id: id.into(),
            payload,
            version,
            modified_at,
            deleted: false,
            origin: Origin::Local,
        }
    }

    /// Creates a live remote record.
    pub fn remote(id: impl Into<RecordId>, payload: Value, version: u64, modified_at: u64) -> Self {
        Self {
            origin: Origin::Remote,
            ..Self::local(id, payload, version, modified_at)
        }
    }

    /// Returns a tombstone for this record at the given version.
    pub fn tombstone(&self, version: u64, modified_at: u64) -> Self {
        Self {
            id: self.id.clone(),
            payload: Value::Null,
            version,
            modified_at,
            deleted: true,
            origin: self.origin,
        }
    }

    /// Returns true if both records carry the same observable content.
    pub fn same_content(&self, other: &Record) -> bool {
        self.deleted == other.deleted && (self.deleted || self.payload == other.payload)
    }

    /// Checks the record's shape.
    ///
    /// A record needs a non-empty ID, and a live record needs an object
    /// payload.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.id.as_str().is_empty() {
            return Err(ProtocolError::validation("", "empty record id"));
        }
        if !self.deleted && !self.payload.is_object() {
            return Err(ProtocolError::validation(
                self.id.as_str(),
                "payload must be a JSON object",
            ));
        }
        Ok(())
    }
}

/// A locally held record together with its last synced version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRecord {
    /// Current local copy.
    pub record: Record,
    /// Version agreed with the remote at the last successful sync.
    /// `None` if the record has never been synced.
    pub base_version: Option<u64>,
}

impl TrackedRecord {
    /// Wraps a record that has never been synced.
    pub fn unsynced(record: Record) -> Self {
        Self {
            record,
            base_version: None,
        }
    }

    /// Wraps a record that is in sync with the remote.
    pub fn synced(record: Record) -> Self {
        let base_version = Some(record.version);
        Self {
            record,
            base_version,
        }
    }

    /// Returns true if the local copy changed since the last sync.
    pub fn is_locally_changed(&self) -> bool {
        match self.base_version {
            None => true,
            Some(base) => self.record.version > base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tracked_change_detection() {
        let record = Record::local("1", json!({"x": 5}), 3, 0);

        assert!(TrackedRecord::unsynced(record.clone()).is_locally_changed());
        assert!(!TrackedRecord::synced(record.clone()).is_locally_changed());

        let edited = TrackedRecord {
            record: Record {
                version: 4,
                ..record
            },
            base_version: Some(3),
        };
        assert!(edited.is_locally_changed());
    }

    #[test]
    fn tombstones_compare_equal_regardless_of_payload() {
        let a = Record::local("1", json!({"x": 1}), 1, 0).tombstone(2, 10);
        let b = Record::remote("1", json!({"x": 2}), 1, 0).tombstone(2, 20);
        assert!(a.same_content(&b));
        assert!(a.payload.is_null());
    }

    #[test]
    fn validation_rules() {
        assert!(Record::local("1", json!({"x": 1}), 1, 0).validate().is_ok());
        assert!(Record::local("", json!({}), 1, 0).validate().is_err());
        assert!(Record::local("1", json!([1, 2]), 1, 0).validate().is_err());
        assert!(Record::local("1", json!({}), 1, 0)
            .tombstone(2, 0)
            .validate()
            .is_ok());
    }

    #[test]
    fn record_json_shape() {
        let record = Record::remote(7u64, json!({"numbers": [1, 2, 3]}), 2, 99);
        let text = serde_json::to_string(&record).unwrap();
        assert!(text.contains("\"id\":\"7\""));
        assert!(text.contains("\"origin\":\"remote\""));

        let back: Record = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }
}
