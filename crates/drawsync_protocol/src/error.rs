//! Error types for protocol-level checks.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating, classifying or merging records.
///
/// These are always scoped to a single record; callers isolate them and
/// carry on with the rest of the batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A record failed shape checks.
    #[error("invalid record {id}: {reason}")]
    Validation {
        /// Record ID.
        id: String,
        /// What was wrong.
        reason: String,
    },

    /// A remote record arrived with a version below the last synced one.
    #[error("version regression on record {id}: synced {base}, received {found}")]
    VersionRegression {
        /// Record ID.
        id: String,
        /// Last synced version.
        base: u64,
        /// Version received.
        found: u64,
    },

    /// A merge function could not combine two payloads.
    #[error("merge failed for record {id}: {reason}")]
    Merge {
        /// Record ID.
        id: String,
        /// Why the merge failed.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates a validation error.
    pub fn validation(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
