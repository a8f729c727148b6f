//! CBOR snapshot persistence for the cache.
//!
//! A snapshot holds every live entry with its original expiry, so a cache
//! restored after a restart keeps honoring the TTLs it was written with.

use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::store::CacheStore;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Current snapshot format version.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    format_version: u16,
    entries: Vec<CacheEntry>,
}

impl CacheStore {
    /// Writes all live entries to `path`.
    ///
    /// The file is written next to the target and renamed into place, so a
    /// crash mid-write leaves the previous snapshot intact. Returns the
    /// number of entries written.
    pub fn save_snapshot(&self, path: &Path) -> CacheResult<usize> {
        let snapshot = Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            entries: self.live_entries(),
        };

        let tmp_path = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            ciborium::into_writer(&snapshot, &mut writer).map_err(CacheError::serialization)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        debug!(entries = snapshot.entries.len(), path = %path.display(), "cache snapshot saved");
        Ok(snapshot.entries.len())
    }

    /// Loads entries from a snapshot written by [`CacheStore::save_snapshot`].
    ///
    /// Entries that expired while on disk are skipped. Entries that no longer
    /// fit the configured quota are skipped and logged. Returns the number of
    /// entries restored.
    pub fn load_snapshot(&self, path: &Path) -> CacheResult<usize> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: Snapshot = ciborium::from_reader(reader).map_err(CacheError::serialization)?;

        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(CacheError::SnapshotVersion {
                found: snapshot.format_version,
                expected: SNAPSHOT_FORMAT_VERSION,
            });
        }

        let now = self.clock().now_ms();
        let mut restored = 0;
        for entry in snapshot.entries {
            if entry.is_expired(now) {
                continue;
            }
            let key = entry.key.clone();
            match self.insert_entry(entry) {
                Ok(()) => restored += 1,
                Err(e) => warn!(key = %key, error = %e, "skipping snapshot entry"),
            }
        }
        Ok(restored)
    }
}
