//! Conflict detection and resolution.

use crate::error::{ProtocolError, ProtocolResult};
use crate::merge::RecordMerger;
use crate::record::{Origin, Record, RecordId, Scope, TrackedRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

/// Kind of divergence between a local and a remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides modified the record since the last sync.
    UpdateUpdate,
    /// One side deleted the record while the other modified it.
    UpdateDelete,
    /// Both sides created a record under the same key independently.
    InsertInsert,
}

/// Whether a conflict still awaits a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    /// Awaiting a decision.
    Pending,
    /// Decided; the winning record is in [`Conflict::resolution`].
    Resolved,
}

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave conflicts pending until the user decides.
    Ask,
    /// Local copy always wins.
    LocalPriority,
    /// Remote copy always wins.
    RemotePriority,
    /// Later `modified_at` wins; ties go to the remote.
    #[default]
    TimestampPriority,
    /// Per-resource field merge.
    Merge,
}

impl ConflictPolicy {
    /// Returns true if this policy resolves conflicts without user input.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Ask)
    }

    /// Returns the policy's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Ask => "ask",
            ConflictPolicy::LocalPriority => "local_priority",
            ConflictPolicy::RemotePriority => "remote_priority",
            ConflictPolicy::TimestampPriority => "timestamp_priority",
            ConflictPolicy::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(ConflictPolicy::Ask),
            "local_priority" => Ok(ConflictPolicy::LocalPriority),
            "remote_priority" => Ok(ConflictPolicy::RemotePriority),
            "timestamp_priority" => Ok(ConflictPolicy::TimestampPriority),
            "merge" => Ok(ConflictPolicy::Merge),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// A user's explicit decision for a pending conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Keep the local copy.
    Local,
    /// Take the remote copy.
    Remote,
    /// Merge both copies.
    Merge,
}

impl FromStr for ConflictChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ConflictChoice::Local),
            "remote" => Ok(ConflictChoice::Remote),
            "merge" => Ok(ConflictChoice::Merge),
            other => Err(format!("unknown conflict choice: {other}")),
        }
    }
}

/// The outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "winner", content = "record", rename_all = "snake_case")]
pub enum Resolution {
    /// Local copy won and must be pushed.
    Local(Record),
    /// Remote copy won and must be applied locally.
    Remote(Record),
    /// A merged copy was produced and must be pushed.
    Merged(Record),
}

impl Resolution {
    /// The winning record.
    pub fn record(&self) -> &Record {
        match self {
            Resolution::Local(r) | Resolution::Remote(r) | Resolution::Merged(r) => r,
        }
    }

    /// Consumes the resolution, returning the winning record.
    pub fn into_record(self) -> Record {
        match self {
            Resolution::Local(r) | Resolution::Remote(r) | Resolution::Merged(r) => r,
        }
    }

    /// Returns true if the winning record must be sent to the remote.
    pub fn needs_push(&self) -> bool {
        !matches!(self, Resolution::Remote(_))
    }
}

/// Unique conflict identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Generates a fresh random ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A divergence between the local and remote copies of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict ID.
    pub id: ConflictId,
    /// Resource table the record belongs to.
    pub scope: Scope,
    /// Conflicting record.
    pub record_id: RecordId,
    /// Kind of divergence.
    pub conflict_type: ConflictType,
    /// Local copy at detection time.
    pub local: Record,
    /// Remote copy, refreshed if the remote moves on while pending.
    pub remote: Record,
    /// Detection time (ms since epoch).
    pub detected_at: u64,
    /// Pending or resolved.
    pub state: ResolutionState,
    /// Decision, once resolved.
    pub resolution: Option<Resolution>,
}

impl Conflict {
    /// Creates a pending conflict.
    pub fn new(
        scope: Scope,
        conflict_type: ConflictType,
        local: Record,
        remote: Record,
        detected_at: u64,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            scope,
            record_id: local.id.clone(),
            conflict_type,
            local,
            remote,
            detected_at,
            state: ResolutionState::Pending,
            resolution: None,
        }
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.state == ResolutionState::Resolved
    }

    fn settle(&mut self, resolution: Resolution) -> Resolution {
        self.state = ResolutionState::Resolved;
        self.resolution = Some(resolution.clone());
        resolution
    }
}

/// Classifies the divergence between a local record and its remote copy.
///
/// Returns `Ok(None)` when there is nothing to reconcile: identical
/// contents, or only one side changed since the last sync (a
/// fast-forward). The caller tells the two fast-forward directions apart
/// with [`TrackedRecord::is_locally_changed`].
///
/// # Errors
///
/// Returns an error if the IDs differ or if the remote version is below the
/// last synced version.
pub fn classify(local: &TrackedRecord, remote: &Record) -> ProtocolResult<Option<ConflictType>> {
    if local.record.id != remote.id {
        return Err(ProtocolError::validation(
            remote.id.as_str(),
            format!("compared against local record {}", local.record.id),
        ));
    }

    if let Some(base) = local.base_version {
        if remote.version < base {
            return Err(ProtocolError::VersionRegression {
                id: remote.id.to_string(),
                base,
                found: remote.version,
            });
        }
    }

    if local.record.same_content(remote) {
        return Ok(None);
    }

    let Some(base) = local.base_version else {
        return Ok(Some(ConflictType::InsertInsert));
    };

    let local_changed = local.record.version > base;
    let remote_changed = remote.version > base;
    if !(local_changed && remote_changed) {
        return Ok(None);
    }

    if local.record.deleted != remote.deleted {
        Ok(Some(ConflictType::UpdateDelete))
    } else {
        Ok(Some(ConflictType::UpdateUpdate))
    }
}

/// Resolves a conflict under `policy`.
///
/// Returns `Ok(None)` and leaves the conflict pending under
/// [`ConflictPolicy::Ask`]. Resolving an already resolved conflict is a
/// no-op that returns the earlier resolution.
pub fn resolve(
    conflict: &mut Conflict,
    policy: ConflictPolicy,
    merger: Option<&dyn RecordMerger>,
) -> ProtocolResult<Option<Resolution>> {
    if conflict.is_resolved() {
        return Ok(conflict.resolution.clone());
    }

    let resolution = match policy {
        ConflictPolicy::Ask => return Ok(None),
        ConflictPolicy::LocalPriority => keep_local(conflict),
        ConflictPolicy::RemotePriority => take_remote(conflict),
        ConflictPolicy::TimestampPriority => by_timestamp(conflict),
        ConflictPolicy::Merge => merge(conflict, merger)?,
    };

    debug!(
        scope = %conflict.scope,
        record = %conflict.record_id,
        policy = %policy,
        "conflict resolved"
    );
    Ok(Some(conflict.settle(resolution)))
}

/// Resolves a conflict with an explicit user choice.
///
/// Like [`resolve`], an already resolved conflict keeps its first
/// resolution.
pub fn resolve_with_choice(
    conflict: &mut Conflict,
    choice: ConflictChoice,
    merger: Option<&dyn RecordMerger>,
) -> ProtocolResult<Resolution> {
    if let Some(previous) = conflict.resolution.clone().filter(|_| conflict.is_resolved()) {
        return Ok(previous);
    }

    let resolution = match choice {
        ConflictChoice::Local => keep_local(conflict),
        ConflictChoice::Remote => take_remote(conflict),
        ConflictChoice::Merge => merge(conflict, merger)?,
    };
    Ok(conflict.settle(resolution))
}

fn next_version(conflict: &Conflict) -> u64 {
    conflict.local.version.max(conflict.remote.version) + 1
}

fn keep_local(conflict: &Conflict) -> Resolution {
    let record = Record {
        version: next_version(conflict),
        origin: Origin::Local,
        ..conflict.local.clone()
    };
    Resolution::Local(record)
}

fn take_remote(conflict: &Conflict) -> Resolution {
    Resolution::Remote(Record {
        origin: Origin::Remote,
        ..conflict.remote.clone()
    })
}

fn by_timestamp(conflict: &Conflict) -> Resolution {
    if conflict.local.modified_at > conflict.remote.modified_at {
        keep_local(conflict)
    } else {
        take_remote(conflict)
    }
}

fn merge(conflict: &Conflict, merger: Option<&dyn RecordMerger>) -> ProtocolResult<Resolution> {
    // deletes never merge field by field
    let merger = match merger {
        Some(m) if !conflict.local.deleted && !conflict.remote.deleted => m,
        _ => return Ok(by_timestamp(conflict)),
    };

    let payload = merger.merge(&conflict.local, &conflict.remote)?;
    Ok(Resolution::Merged(Record {
        id: conflict.record_id.clone(),
        payload,
        version: next_version(conflict),
        modified_at: conflict.local.modified_at.max(conflict.remote.modified_at),
        deleted: false,
        origin: Origin::Local,
    }))
}
