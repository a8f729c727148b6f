//! Error types for cache operations.

use std::io;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing a snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The value does not fit in the cache even after eviction.
    #[error("cache quota exceeded: entry needs {needed} bytes, capacity is {capacity} bytes")]
    QuotaExceeded {
        /// Size of the rejected entry in bytes.
        needed: usize,
        /// Configured capacity in bytes.
        capacity: usize,
    },

    /// A snapshot file was written by an unsupported format version.
    #[error("unsupported snapshot version: found {found}, expected {expected}")]
    SnapshotVersion {
        /// Version found in the file.
        found: u16,
        /// Version this build understands.
        expected: u16,
    },
}

impl CacheError {
    /// Creates a serialization error from any displayable cause.
    pub fn serialization(cause: impl std::fmt::Display) -> Self {
        Self::Serialization(cause.to_string())
    }
}
