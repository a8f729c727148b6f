//! Error types for the reference remote.

use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors returned by [`RemoteStore`](crate::RemoteStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A push carried more records than the store accepts at once.
    #[error("too many records: {count} > {max}")]
    BatchTooLarge {
        /// Records in the push.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The record to edit does not exist.
    #[error("unknown record {record_id} in {scope}")]
    UnknownRecord {
        /// Scope name.
        scope: String,
        /// Record ID.
        record_id: String,
    },

    /// The store is refusing requests.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Returns true if the caller sent something the store will never accept.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RemoteError::InvalidRequest(_)
                | RemoteError::BatchTooLarge { .. }
                | RemoteError::UnknownRecord { .. }
        )
    }
}
