//! # DrawSync Protocol
//!
//! Data types shared by the sync engine and remote stores:
//!
//! - [`Record`] and [`TrackedRecord`] for replicated domain entities
//! - [`Conflict`] detection ([`classify`]) and resolution ([`resolve`])
//! - Per-resource merge functions ([`RecordMerger`], [`FieldMerger`])
//! - Gateway messages ([`PullResponse`], [`PushResponse`])
//!
//! This is a pure data crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod merge;
mod messages;
mod record;

pub use conflict::{
    classify, resolve, resolve_with_choice, Conflict, ConflictChoice, ConflictId, ConflictPolicy,
    ConflictType, Resolution, ResolutionState,
};
pub use error::{ProtocolError, ProtocolResult};
pub use merge::{FieldMerger, MergeRegistry, RecordMerger};
pub use messages::{Cursor, PullResponse, PushResponse, RejectReason, Rejection, RemoteChange};
pub use record::{Origin, Record, RecordId, Scope, TrackedRecord};
