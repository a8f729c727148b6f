//! # DrawSync Engine
//!
//! Offline-first sync engine for DrawSync.
//!
//! This crate provides:
//! - Sync cycle state machine (idle → pulling → diffing → resolving → pushing)
//! - Single-flight cycles per scope, bounded across scopes
//! - Retry with exponential backoff and per-call timeouts
//! - Conflict detection, policy resolution and manual decisions
//! - Observable status, cumulative metrics and a health score
//! - A scheduler driven by timers, connectivity and explicit requests
//!
//! ## Architecture
//!
//! Each cycle pulls remote changes after the scope's cursor, diffs them
//! against locally changed records, resolves conflicts under the current
//! policy and pushes local winners. Every local write is staged and
//! committed in one step at the end, so a cycle that aborts or is
//! cancelled leaves the local store untouched.
//!
//! ## Key Invariants
//!
//! - The remote is authoritative
//! - Pull always happens before push
//! - A record's version never decreases once observed
//! - The cursor only advances past fully resolved changes
//! - A record has at most one pending conflict
//! - Observers see every status change, in order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflicts;
mod error;
mod gateway;
mod metrics;
mod scheduler;
mod state;
mod status;
mod store;

pub use config::{EngineConfig, RetryConfig, SettingsPatch, SyncSettings};
pub use conflicts::ConflictRegistry;
pub use error::{SyncError, SyncResult};
pub use gateway::{MockGateway, MockReply, RemoteGateway};
pub use metrics::{
    data_integrity, health_score, MetricsSnapshot, SyncMetrics, CONFLICT_PENALTY, ERROR_PENALTY,
};
pub use scheduler::{evaluate, Connectivity, Scheduler, SkipReason, Trigger};
pub use state::{CyclePhase, SyncCycleResult, SyncEngine};
pub use status::{DataIntegrity, StatusHub, SyncStatus};
pub use store::{CommitBatch, LocalStore, MemoryLocalStore, StagedWrite};
