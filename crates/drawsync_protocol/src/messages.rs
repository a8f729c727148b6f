//! Messages exchanged with a remote gateway.

use crate::record::{Record, RecordId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in a scope's remote change sequence.
///
/// The remote assigns increasing sequence numbers to the changes it
/// serves; a pull asks for everything after the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    /// The cursor before any change.
    pub const START: Cursor = Cursor(0);

    /// Returns the raw sequence value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A record change served by the remote, tagged with its sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Sequence of the change within the scope.
    pub sequence: u64,
    /// Record state after the change.
    pub record: Record,
}

/// Response to a pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changes after the requested cursor, in sequence order.
    pub changes: Vec<RemoteChange>,
    /// Cursor to request next time.
    pub new_cursor: Cursor,
}

impl PullResponse {
    /// Creates a pull response.
    pub fn new(changes: Vec<RemoteChange>, new_cursor: Cursor) -> Self {
        Self {
            changes,
            new_cursor,
        }
    }

    /// An empty response that keeps the cursor where it is.
    pub fn empty(cursor: Cursor) -> Self {
        Self::new(Vec::new(), cursor)
    }
}

/// Why the remote refused a pushed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The remote holds a newer version than the push was based on.
    VersionConflict,
    /// The remote refused the record for another reason.
    Invalid(String),
}

impl RejectReason {
    /// Returns the reason's wire name.
    pub fn as_str(&self) -> &str {
        match self {
            RejectReason::VersionConflict => "version_conflict",
            RejectReason::Invalid(reason) => reason,
        }
    }
}

/// A pushed record the remote did not accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Rejected record.
    pub id: RecordId,
    /// Why it was rejected.
    pub reason: RejectReason,
    /// The remote's current copy, when the remote reports it.
    #[serde(default)]
    pub current: Option<Record>,
}

impl Rejection {
    /// A version conflict carrying the remote's current copy.
    pub fn version_conflict(current: Record) -> Self {
        Self {
            id: current.id.clone(),
            reason: RejectReason::VersionConflict,
            current: Some(current),
        }
    }

    /// A rejection for any other reason.
    pub fn invalid(id: RecordId, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: RejectReason::Invalid(reason.into()),
            current: None,
        }
    }

    /// Returns true if the remote reported a version conflict.
    pub fn is_version_conflict(&self) -> bool {
        self.reason == RejectReason::VersionConflict
    }
}

/// Response to a push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Records the remote stored.
    pub acked: Vec<RecordId>,
    /// Records the remote refused.
    pub rejected: Vec<Rejection>,
}

impl PushResponse {
    /// A response acknowledging every given record.
    pub fn acked(ids: Vec<RecordId>) -> Self {
        Self {
            acked: ids,
            rejected: Vec::new(),
        }
    }
}
