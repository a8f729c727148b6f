//! # DrawSync Cache
//!
//! Device-local key/value cache with TTL expiry for DrawSync.
//!
//! The cache is the read path the UI consults while offline. It stores
//! serde values as CBOR bytes and tracks hit/miss counters.
//!
//! ## Expiry
//!
//! An entry is expired once `now >= expires_at`. The lazy drop performed by
//! [`CacheStore::get`] and the sweep performed by [`CacheStore::cleanup`]
//! use the same check, so an expired entry is never returned as a hit.
//!
//! ## Example
//!
//! ```rust
//! use drawsync_cache::{CacheConfig, CacheStore};
//! use std::time::Duration;
//!
//! let cache = CacheStore::new(CacheConfig::default());
//! cache.set("draws/latest", &vec![4u8, 8, 15, 16, 23, 42], Duration::from_secs(60)).unwrap();
//!
//! let numbers: Option<Vec<u8>> = cache.get("draws/latest");
//! assert_eq!(numbers, Some(vec![4, 8, 15, 16, 23, 42]));
//! assert_eq!(cache.stats().hit_count, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod entry;
mod error;
mod snapshot;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, EntrySource};
pub use error::{CacheError, CacheResult};
pub use snapshot::SNAPSHOT_FORMAT_VERSION;
pub use store::{CacheConfig, CacheStats, CacheStore};
