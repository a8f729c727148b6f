//! The TTL cache store.

use crate::clock::{Clock, SystemClock};
use crate::entry::{CacheEntry, EntrySource};
use crate::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for a [`CacheStore`].
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Maximum total size of all entries in bytes. `None` means unbounded.
    pub max_bytes: Option<usize>,
}

impl CacheConfig {
    /// Creates an unbounded cache configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the byte capacity.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of stored entries, including expired ones not yet reaped.
    pub total_entries: usize,
    /// Number of reads that returned a value.
    pub hit_count: u64,
    /// Number of reads that returned nothing.
    pub miss_count: u64,
    /// Sum of key and value sizes of all stored entries.
    pub total_size_bytes: usize,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    total_bytes: usize,
}

impl Entries {
    fn insert(&mut self, entry: CacheEntry) {
        self.total_bytes += entry.size_bytes();
        if let Some(old) = self.map.insert(entry.key.clone(), entry) {
            self.total_bytes -= old.size_bytes();
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.map.remove(key);
        if let Some(entry) = &removed {
            self.total_bytes -= entry.size_bytes();
        }
        removed
    }

    /// Key of the entry that expires first.
    fn earliest_expiring(&self) -> Option<String> {
        self.map
            .values()
            .min_by_key(|e| (e.expires_at, e.inserted_at))
            .map(|e| e.key.clone())
    }
}

/// A thread-safe key/value cache with TTL expiry.
///
/// All operations take a single store-wide lock, so `get`, `set` and
/// `cleanup` never observe each other half-done.
///
/// # Quota
///
/// With [`CacheConfig::max_bytes`] set, a write that would overflow the
/// capacity evicts the entries closest to expiry first. A value larger than
/// the whole capacity is rejected with [`CacheError::QuotaExceeded`] and
/// nothing is evicted.
#[derive(Debug)]
pub struct CacheStore {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<Entries>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Creates a cache driven by the system clock.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a cache driven by the given clock.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(Entries::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the clock used for expiry.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Reads and decodes a value.
    ///
    /// Returns `None` (a miss) if the key is absent, expired, or its bytes
    /// cannot be decoded. Expired and undecodable entries are dropped.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();

        let read = entries.map.get(key).map(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(ciborium::from_reader::<T, _>(entry.value.as_slice()))
            }
        });

        let decoded = match read {
            None => None,
            Some(None) => {
                entries.remove(key);
                None
            }
            Some(Some(Ok(value))) => Some(value),
            Some(Some(Err(e))) => {
                warn!(key, error = %e, "dropping unreadable cache entry");
                entries.remove(key);
                None
            }
        };

        if decoded.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        decoded
    }

    /// Returns a copy of the live entry for `key` without touching counters.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .map
            .get(key)
            .filter(|e| !e.is_expired(now))
            .cloned()
    }

    /// Returns true if a live entry exists for `key`. Counters are not touched.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    /// Encodes and stores a locally produced value.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.set_with_source(key, value, ttl, EntrySource::Local)
    }

    /// Encodes and stores a value, tagging its origin.
    pub fn set_with_source<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        source: EntrySource,
    ) -> CacheResult<()> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes).map_err(CacheError::serialization)?;
        self.set_raw(key, bytes, ttl, source)
    }

    /// Stores already-encoded bytes.
    pub fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        source: EntrySource,
    ) -> CacheResult<()> {
        let now = self.clock.now_ms();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            inserted_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
            source,
        };
        self.insert_entry(entry)
    }

    /// Inserts a fully formed entry, evicting as needed.
    pub(crate) fn insert_entry(&self, entry: CacheEntry) -> CacheResult<()> {
        let needed = entry.size_bytes();
        let mut entries = self.entries.lock();

        if let Some(capacity) = self.config.max_bytes {
            if needed > capacity {
                return Err(CacheError::QuotaExceeded { needed, capacity });
            }
            entries.remove(&entry.key);
            let mut evicted = 0usize;
            while entries.total_bytes + needed > capacity {
                match entries.earliest_expiring() {
                    Some(victim) => {
                        entries.remove(&victim);
                        evicted += 1;
                    }
                    None => break,
                }
            }
            if evicted > 0 {
                debug!(evicted, key = %entry.key, "evicted cache entries to make room");
            }
        }

        entries.insert(entry);
        Ok(())
    }

    /// Removes an entry. Returns true if one was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Deletes every expired entry and returns how many were deleted.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();

        let expired: Vec<String> = entries
            .map
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
        }

        if !expired.is_empty() {
            debug!(deleted = expired.len(), "cache cleanup");
        }
        expired.len()
    }

    /// Drops all entries and resets the hit/miss counters.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.map.clear();
        entries.total_bytes = 0;
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Returns current statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            total_entries: entries.map.len(),
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            total_size_bytes: entries.total_bytes,
        }
    }

    /// Returns copies of all live entries.
    pub(crate) fn live_entries(&self) -> Vec<CacheEntry> {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .map
            .values()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect()
    }
}
