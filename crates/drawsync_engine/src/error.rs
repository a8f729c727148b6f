//! Error types for the sync engine.

use drawsync_cache::CacheError;
use drawsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// These never reach observers directly; the engine translates them into
/// [`SyncStatus::sync_errors`](crate::SyncStatus::sync_errors) entries.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote refused our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A gateway call exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// A record failed shape or version checks.
    #[error("validation error: {0}")]
    Validation(#[from] ProtocolError),

    /// A conflict stayed unresolved past the staleness threshold.
    #[error("conflict on record {record_id} in {scope} unresolved for {age_secs}s")]
    StaleConflict {
        /// Scope of the record.
        scope: String,
        /// Record ID.
        record_id: String,
        /// Age of the conflict in seconds.
        age_secs: u64,
    },

    /// A manual decision targeted a record edited after its conflict was
    /// detected.
    #[error("record {record_id} in {scope} changed locally since its conflict was detected")]
    OutdatedDecision {
        /// Scope of the record.
        scope: String,
        /// Record ID.
        record_id: String,
    },

    /// A cache write failed (quota or encoding).
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// The local store failed.
    #[error("local store error: {0}")]
    Store(String),

    /// Settings failed validation.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// The cycle was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The in-flight cycle this caller attached to ended without a result.
    #[error("in-flight sync cycle for {0} was abandoned")]
    InFlightAbandoned(String),

    /// The engine is offline.
    #[error("not connected")]
    Offline,
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}
