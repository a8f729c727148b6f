//! Cache entry representation.

use serde::{Deserialize, Serialize};

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Written by the local application.
    Local,
    /// Applied from the remote authoritative store.
    Remote,
}

/// A single cached value with its expiry metadata.
///
/// The value is kept in its encoded (CBOR) form; decoding happens on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,
    /// Encoded value bytes.
    pub value: Vec<u8>,
    /// Insertion time (ms since epoch).
    pub inserted_at: u64,
    /// Expiry time (ms since epoch). The entry is dead once `now >= expires_at`.
    pub expires_at: u64,
    /// Origin of the value.
    pub source: EntrySource,
}

impl CacheEntry {
    /// Returns true if the entry is expired at `now_ms`.
    ///
    /// This is the single expiry check shared by lazy reads and cleanup.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Approximate footprint of the entry in bytes (key plus value).
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.len()
    }
}
