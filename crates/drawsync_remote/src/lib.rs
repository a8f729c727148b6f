//! # DrawSync Remote
//!
//! Reference in-memory authoritative store for DrawSync.
//!
//! This crate provides:
//! - A per-scope change log with increasing sequences
//! - Pull of the latest change per record after a cursor
//! - Push with version checks, rejecting stale writes with the current copy
//! - Remote-side edits for tests and simulations
//!
//! It implements the server side of the gateway contract without any
//! transport. Clients adapt it to their gateway trait:
//!
//! ```rust,ignore
//! let remote = RemoteStore::new();
//! remote.put(&Scope::new("draws"), "1", json!({"numbers": [4, 8, 15]}), now)?;
//! let pulled = remote.pull(&Scope::new("draws"), Cursor::START)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod oplog;
mod store;

pub use config::RemoteConfig;
pub use error::{RemoteError, RemoteResult};
pub use oplog::ScopeLog;
pub use store::RemoteStore;
