//! Sync engine state machine.

use crate::config::{EngineConfig, SettingsPatch, SyncSettings};
use crate::conflicts::ConflictRegistry;
use crate::error::{SyncError, SyncResult};
use crate::gateway::RemoteGateway;
use crate::metrics::{data_integrity, health_score, MetricsSnapshot, SyncMetrics};
use crate::status::{StatusHub, SyncStatus};
use crate::store::{CommitBatch, LocalStore, StagedWrite};
use drawsync_cache::{CacheStore, EntrySource};
use drawsync_protocol::{
    classify, resolve, resolve_with_choice, Conflict, ConflictChoice, ConflictId,
    ConflictPolicy, ConflictType, Cursor, MergeRegistry, Origin, PullResponse, Record, RecordId,
    RecordMerger, RejectReason, Rejection, Resolution, Scope, TrackedRecord,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Where a scope's cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    /// No cycle running.
    #[default]
    Idle,
    /// Fetching remote changes.
    Pulling,
    /// Classifying local and remote changes.
    Diffing,
    /// Applying the conflict policy.
    Resolving,
    /// Sending local changes.
    Pushing,
    /// The last cycle aborted.
    Failed,
}

impl CyclePhase {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, CyclePhase::Idle | CyclePhase::Failed)
    }
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Whether the cycle finished without errors.
    pub success: bool,
    /// Records applied locally plus records pushed.
    pub records_synced: usize,
    /// Conflicts detected during the cycle, resolved or pending.
    pub conflicts: Vec<Conflict>,
    /// Wall time of the cycle.
    pub duration: Duration,
    /// Per-record and gateway errors.
    pub errors: Vec<String>,
    /// Remote records applied locally.
    pub applied: Vec<RecordId>,
    /// Local records the remote acknowledged.
    pub pushed: Vec<RecordId>,
    /// Whether the cycle was cancelled before committing.
    pub cancelled: bool,
}

impl SyncCycleResult {
    fn aborted(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            ..Self::default()
        }
    }

    fn absorb(&mut self, other: SyncCycleResult) {
        self.success &= other.success;
        self.records_synced += other.records_synced;
        self.conflicts.extend(other.conflicts);
        self.duration = self.duration.max(other.duration);
        self.errors.extend(other.errors);
        self.applied.extend(other.applied);
        self.pushed.extend(other.pushed);
        self.cancelled |= other.cancelled;
    }
}

/// Why a cycle stopped early.
enum CycleAbort {
    Cancelled,
    Failed(Vec<String>),
}

impl From<SyncError> for CycleAbort {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Cancelled => CycleAbort::Cancelled,
            other => CycleAbort::Failed(vec![other.to_string()]),
        }
    }
}

/// A record queued for push.
#[derive(Debug, Clone)]
struct PushItem {
    record: Record,
    base_version: Option<u64>,
    expected_version: Option<u64>,
}

/// Everything a cycle decided, committed in the finalize step.
#[derive(Debug)]
struct CyclePlan {
    writes: BTreeMap<RecordId, StagedWrite>,
    push: BTreeMap<RecordId, PushItem>,
    acked: Vec<(RecordId, u64)>,
    conflicts: Vec<(u64, Conflict)>,
    skipped: BTreeSet<RecordId>,
    applied: Vec<RecordId>,
    cache_writes: Vec<Record>,
    awaiting: Vec<Conflict>,
    settled: Vec<Conflict>,
    refreshed: Vec<Record>,
    pulled_cursor: Cursor,
    held_from: Option<u64>,
}

impl CyclePlan {
    fn new(pulled_cursor: Cursor) -> Self {
        Self {
            writes: BTreeMap::new(),
            push: BTreeMap::new(),
            acked: Vec::new(),
            conflicts: Vec::new(),
            skipped: BTreeSet::new(),
            applied: Vec::new(),
            cache_writes: Vec::new(),
            awaiting: Vec::new(),
            settled: Vec::new(),
            refreshed: Vec::new(),
            pulled_cursor,
            held_from: None,
        }
    }

    /// Stages a local write. A later write to the same record replaces the
    /// earlier one but keeps its precondition.
    fn stage(&mut self, tracked: TrackedRecord, expected_version: Option<u64>) {
        match self.writes.entry(tracked.record.id.clone()) {
            Entry::Occupied(mut staged) => staged.get_mut().tracked = tracked,
            Entry::Vacant(slot) => {
                slot.insert(StagedWrite {
                    tracked,
                    expected_version,
                });
            }
        }
    }

    fn apply_remote(&mut self, record: Record, expected_version: Option<u64>) {
        let record = Record {
            origin: Origin::Remote,
            ..record
        };
        self.applied.push(record.id.clone());
        self.cache_writes.push(record.clone());
        self.stage(TrackedRecord::synced(record), expected_version);
    }

    fn queue_push(&mut self, item: PushItem) {
        self.push.insert(item.record.id.clone(), item);
    }

    /// Keeps the cursor below `sequence` so the change is served again.
    fn hold(&mut self, sequence: u64) {
        self.held_from = Some(self.held_from.map_or(sequence, |held| held.min(sequence)));
    }

    fn is_claimed(&self, id: &RecordId) -> bool {
        self.writes.contains_key(id)
            || self.push.contains_key(id)
            || self.skipped.contains(id)
            || self.conflicts.iter().any(|(_, c)| &c.record_id == id)
    }

    fn next_cursor(&self, start: Cursor) -> Cursor {
        match self.held_from {
            Some(sequence) => Cursor(sequence.saturating_sub(1)).max(start),
            None => self.pulled_cursor.max(start),
        }
    }
}

struct InFlight {
    result: watch::Receiver<Option<SyncCycleResult>>,
    cancel: Arc<AtomicBool>,
}

struct Inner<G, S> {
    config: EngineConfig,
    gateway: G,
    store: S,
    cache: Arc<CacheStore>,
    settings: RwLock<SyncSettings>,
    mergers: RwLock<MergeRegistry>,
    scopes: RwLock<Vec<Scope>>,
    conflicts: ConflictRegistry,
    status: StatusHub,
    metrics: SyncMetrics,
    phases: Mutex<HashMap<Scope, CyclePhase>>,
    in_flight: Mutex<HashMap<Scope, InFlight>>,
    permits: Arc<Semaphore>,
    running: AtomicUsize,
}

/// The sync engine reconciles a local store with a remote authoritative
/// store, one scope at a time.
///
/// Cycles run as tokio tasks. At most one cycle per scope is in flight;
/// concurrent callers for the same scope share its result.
pub struct SyncEngine<G, S> {
    inner: Arc<Inner<G, S>>,
}

impl<G, S> Clone for SyncEngine<G, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G, S> SyncEngine<G, S>
where
    G: RemoteGateway + 'static,
    S: LocalStore + 'static,
{
    /// Creates a new sync engine.
    ///
    /// # Errors
    ///
    /// Returns an error if `settings` fail validation.
    pub fn new(
        config: EngineConfig,
        gateway: G,
        store: S,
        cache: Arc<CacheStore>,
        settings: SyncSettings,
    ) -> SyncResult<Self> {
        settings.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent_cycles.max(1)));
        let status = StatusHub::new(SyncStatus {
            is_online: true,
            data_integrity: data_integrity(health_score(0, 0, 0, 0), 0),
            ..SyncStatus::default()
        });

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                store,
                cache,
                settings: RwLock::new(settings),
                mergers: RwLock::new(MergeRegistry::new()),
                scopes: RwLock::new(Vec::new()),
                conflicts: ConflictRegistry::new(),
                status,
                metrics: SyncMetrics::new(),
                phases: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                permits,
                running: AtomicUsize::new(0),
            }),
        })
    }

    /// Restores cumulative metrics, e.g. from a persisted snapshot.
    pub fn with_metrics(self, snapshot: &MetricsSnapshot) -> Self {
        let metrics = SyncMetrics::from_snapshot(snapshot);
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.metrics = metrics;
                let engine = Self {
                    inner: Arc::new(inner),
                };
                engine
                    .inner
                    .status
                    .update(|s| engine.inner.refresh_health(s));
                engine
            }
            Err(shared) => {
                warn!("engine already shared, metrics snapshot ignored");
                Self { inner: shared }
            }
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The remote gateway.
    pub fn gateway(&self) -> &G {
        &self.inner.gateway
    }

    /// The local store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The cache store.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    /// Adds a scope to the set synced by [`SyncEngine::force_sync`].
    pub fn register_scope(&self, scope: Scope) {
        self.inner.register_scope(scope);
    }

    /// Registered scopes, in registration order.
    pub fn scopes(&self) -> Vec<Scope> {
        self.inner.scopes.read().clone()
    }

    /// Registers the merge function used for `scope` under the merge policy.
    pub fn register_merger(&self, scope: Scope, merger: Arc<dyn RecordMerger>) {
        self.inner.mergers.write().register(scope, merger);
    }

    /// Current settings.
    pub fn settings(&self) -> SyncSettings {
        self.inner.settings.read().clone()
    }

    /// Applies a partial settings update.
    ///
    /// Running cycles keep the settings they started with.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving settings unchanged, if the result is invalid.
    pub fn update_settings(&self, patch: &SettingsPatch) -> SyncResult<SyncSettings> {
        let mut settings = self.inner.settings.write();
        settings.apply(patch)?;
        info!(
            auto_sync = settings.auto_sync,
            interval = settings.sync_interval_minutes,
            policy = %settings.conflict_resolution_policy,
            "sync settings updated"
        );
        Ok(settings.clone())
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.inner.status.snapshot()
    }

    /// Subscribes to every status mutation.
    pub fn subscribe(&self) -> UnboundedReceiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        let status = self.inner.status.snapshot();
        self.inner
            .metrics
            .snapshot(status.conflicts_detected, status.sync_errors.len())
    }

    /// Zeroes cumulative metrics.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
        self.inner.status.update(|s| self.inner.refresh_health(s));
    }

    /// Records the host's connectivity.
    pub fn set_online(&self, online: bool) {
        self.inner.status.update(|s| s.is_online = online);
    }

    /// Probes the remote and records the outcome as connectivity.
    pub async fn test_connection(&self) -> bool {
        let reachable = tokio::time::timeout(
            self.inner.config.request_timeout,
            self.inner.gateway.test_connection(),
        )
        .await
        .unwrap_or(false);
        self.set_online(reachable);
        reachable
    }

    /// Current phase of a scope.
    pub fn phase(&self, scope: &Scope) -> CyclePhase {
        self.inner
            .phases
            .lock()
            .get(scope)
            .copied()
            .unwrap_or_default()
    }

    /// Conflicts awaiting a decision.
    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        self.inner.conflicts.pending()
    }

    /// Records a local edit; `None` deletes the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object or the store
    /// fails.
    pub fn record_local_change(
        &self,
        scope: &Scope,
        id: &RecordId,
        payload: Option<Value>,
    ) -> SyncResult<Record> {
        let now = self.inner.now_ms();
        if let Some(payload) = &payload {
            Record::local(id.clone(), payload.clone(), 0, now).validate()?;
        }
        self.inner.register_scope(scope.clone());
        let record = self.inner.store.write_local(scope, id, payload, now)?;
        debug!(scope = %scope, record = %id, version = record.version, "local change recorded");

        let pending = self.inner.pending_total();
        self.inner.status.update(|s| s.pending_changes = pending);
        Ok(record)
    }

    /// Runs a cycle for `scope`, or waits for the one already in flight.
    pub async fn run_cycle(&self, scope: &Scope) -> SyncCycleResult {
        let rx = self.start_or_attach(scope);
        await_result(scope, rx).await
    }

    /// Runs a cycle for every registered scope and aggregates the results.
    ///
    /// Scopes run concurrently, each obeying single-flight.
    pub async fn force_sync(&self) -> SyncCycleResult {
        let scopes = self.scopes();
        let receivers: Vec<_> = scopes
            .iter()
            .map(|scope| (scope, self.start_or_attach(scope)))
            .collect();

        let mut total = SyncCycleResult {
            success: true,
            ..SyncCycleResult::default()
        };
        for (scope, rx) in receivers {
            total.absorb(await_result(scope, rx).await);
        }
        total
    }

    /// Requests cancellation of the scope's in-flight cycle.
    ///
    /// The cycle stops at its next step boundary and commits nothing.
    /// Returns false if no cycle is in flight.
    pub fn cancel(&self, scope: &Scope) -> bool {
        match self.inner.in_flight.lock().get(scope) {
            Some(flight) => {
                flight.cancel.store(true, Ordering::SeqCst);
                info!(scope = %scope, "sync cycle cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Resolves a pending conflict with an explicit choice.
    ///
    /// Local and merged winners are pushed by the next cycle. Returns true
    /// if the conflict is resolved, including when it already was.
    pub fn resolve_conflict(&self, id: ConflictId, choice: ConflictChoice) -> bool {
        self.inner.resolve_conflict(id, choice)
    }

    /// Resolves the pending conflict of a record. See
    /// [`SyncEngine::resolve_conflict`].
    pub fn resolve_record_conflict(
        &self,
        scope: &Scope,
        record_id: &RecordId,
        choice: ConflictChoice,
    ) -> bool {
        match self.inner.conflicts.pending_for(scope, record_id) {
            Some(conflict) => self.inner.resolve_conflict(conflict.id, choice),
            None => false,
        }
    }

    fn start_or_attach(&self, scope: &Scope) -> watch::Receiver<Option<SyncCycleResult>> {
        self.inner.register_scope(scope.clone());

        let mut in_flight = self.inner.in_flight.lock();
        if let Some(flight) = in_flight.get(scope) {
            debug!(scope = %scope, "attaching to in-flight sync cycle");
            return flight.result.clone();
        }

        let (tx, rx) = watch::channel(None);
        let cancel = Arc::new(AtomicBool::new(false));
        in_flight.insert(
            scope.clone(),
            InFlight {
                result: rx.clone(),
                cancel: Arc::clone(&cancel),
            },
        );
        drop(in_flight);

        let inner = Arc::clone(&self.inner);
        let scope = scope.clone();
        tokio::spawn(async move {
            let result = match Arc::clone(&inner.permits).acquire_owned().await {
                Ok(_permit) => inner.execute(&scope, &cancel).await,
                Err(_) => SyncCycleResult::aborted(vec!["sync engine shut down".into()]),
            };
            inner.in_flight.lock().remove(&scope);
            let _ = tx.send(Some(result));
        });
        rx
    }
}

async fn await_result(
    scope: &Scope,
    mut rx: watch::Receiver<Option<SyncCycleResult>>,
) -> SyncCycleResult {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or_else(|| {
                SyncCycleResult::aborted(vec![SyncError::InFlightAbandoned(scope.to_string())
                    .to_string()])
            });
        }
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<(), CycleAbort> {
    if cancel.load(Ordering::SeqCst) {
        Err(CycleAbort::Cancelled)
    } else {
        Ok(())
    }
}

fn cache_key(scope: &Scope, id: &RecordId) -> String {
    format!("{scope}/{id}")
}

impl<G, S> Inner<G, S>
where
    G: RemoteGateway + 'static,
    S: LocalStore + 'static,
{
    fn now_ms(&self) -> u64 {
        self.cache.clock().now_ms()
    }

    fn register_scope(&self, scope: Scope) {
        let added = {
            let mut scopes = self.scopes.write();
            if scopes.contains(&scope) {
                false
            } else {
                scopes.push(scope);
                true
            }
        };
        if added {
            let pending = self.pending_total();
            self.status.update(|s| s.pending_changes = pending);
        }
    }

    fn pending_total(&self) -> usize {
        let scopes = self.scopes.read().clone();
        scopes
            .iter()
            .map(|scope| match self.store.pending_count(scope) {
                Ok(count) => count,
                Err(e) => {
                    warn!(scope = %scope, error = %e, "failed to count pending changes");
                    0
                }
            })
            .sum()
    }

    fn refresh_health(&self, status: &mut SyncStatus) {
        status.conflicts_detected = self.conflicts.pending_count();
        let score = self
            .metrics
            .snapshot(status.conflicts_detected, status.sync_errors.len())
            .health_score;
        status.data_integrity = data_integrity(score, status.conflicts_detected);
    }

    fn set_phase(&self, scope: &Scope, phase: CyclePhase) {
        debug!(scope = %scope, ?phase, "sync phase");
        self.phases.lock().insert(scope.clone(), phase);
    }

    async fn execute(&self, scope: &Scope, cancel: &AtomicBool) -> SyncCycleResult {
        if !self.status.snapshot().is_online {
            debug!(scope = %scope, "offline, sync cycle skipped");
            return SyncCycleResult::aborted(vec![SyncError::Offline.to_string()]);
        }

        let started = Instant::now();
        let settings = self.settings.read().clone();
        self.running.fetch_add(1, Ordering::SeqCst);
        self.status.update(|s| s.sync_in_progress = true);
        info!(
            scope = %scope,
            policy = %settings.conflict_resolution_policy,
            "sync cycle started"
        );

        let (mut result, aborted) = match self.cycle(scope, &settings, cancel).await {
            Ok(result) => (result, false),
            Err(CycleAbort::Cancelled) => {
                info!(scope = %scope, "sync cycle cancelled");
                (
                    SyncCycleResult {
                        cancelled: true,
                        ..SyncCycleResult::default()
                    },
                    false,
                )
            }
            Err(CycleAbort::Failed(errors)) => {
                warn!(scope = %scope, errors = errors.len(), "sync cycle aborted");
                (SyncCycleResult::aborted(errors), true)
            }
        };

        result.duration = started.elapsed();
        result.records_synced = result.applied.len() + result.pushed.len();
        result.success = !result.cancelled && result.errors.is_empty();
        self.finish(scope, &result, aborted);

        info!(
            scope = %scope,
            success = result.success,
            applied = result.applied.len(),
            pushed = result.pushed.len(),
            conflicts = result.conflicts.len(),
            duration_ms = result.duration.as_millis() as u64,
            "sync cycle finished"
        );
        result
    }

    fn finish(&self, scope: &Scope, result: &SyncCycleResult, aborted: bool) {
        if aborted {
            self.set_phase(scope, CyclePhase::Failed);
        }
        if !result.cancelled {
            self.metrics.record_cycle(result.success, result.duration);
        }

        let running = self
            .running
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        // an aborted cycle leaves the pending count as it was
        let pending = (!aborted && !result.cancelled).then(|| self.pending_total());
        let now = self.now_ms();

        self.status.update(|s| {
            s.sync_in_progress = running > 0;
            s.sync_errors.extend(result.errors.iter().cloned());
            if let Some(pending) = pending {
                s.pending_changes = pending;
            }
            if result.success {
                s.last_sync_time = Some(now);
            }
            self.refresh_health(s);
        });
        self.set_phase(scope, CyclePhase::Idle);
    }

    async fn cycle(
        &self,
        scope: &Scope,
        settings: &SyncSettings,
        cancel: &AtomicBool,
    ) -> Result<SyncCycleResult, CycleAbort> {
        let mut result = SyncCycleResult::default();
        let policy = settings.conflict_resolution_policy;

        self.set_phase(scope, CyclePhase::Pulling);
        let start = self.store.cursor(scope)?;
        let gateway = &self.gateway;
        let pulled = self
            .with_retry(scope, "pull", move || gateway.pull(scope, start))
            .await
            .map_err(CycleAbort::Failed)?;
        check_cancelled(cancel)?;
        debug!(
            scope = %scope,
            changes = pulled.changes.len(),
            cursor = %pulled.new_cursor,
            "pulled"
        );

        self.set_phase(scope, CyclePhase::Diffing);
        let mut plan = self.diff(scope, pulled, start, &mut result)?;
        check_cancelled(cancel)?;

        self.set_phase(scope, CyclePhase::Resolving);
        for (sequence, conflict) in std::mem::take(&mut plan.conflicts) {
            self.settle(scope, conflict, Some(sequence), policy, &mut plan, &mut result);
        }
        check_cancelled(cancel)?;

        self.set_phase(scope, CyclePhase::Pushing);
        self.push_queued(scope, policy, &mut plan, &mut result, cancel)
            .await?;
        check_cancelled(cancel)?;

        self.finalize(scope, plan, start, &mut result)?;
        Ok(result)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        scope: &Scope,
        op: &'static str,
        mut call: F,
    ) -> Result<T, Vec<String>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let retry = &self.config.retry;
        let mut errors = Vec::new();

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                let delay = retry.delay_for_attempt(attempt);
                debug!(
                    scope = %scope,
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = tokio::time::timeout(self.config.request_timeout, call())
                .await
                .unwrap_or(Err(SyncError::Timeout));

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        scope = %scope,
                        op,
                        attempt = attempt + 1,
                        error = %e,
                        "gateway call failed"
                    );
                    let retryable = e.is_retryable();
                    errors.push(format!("{op}: {e}"));
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(errors)
    }

    fn diff(
        &self,
        scope: &Scope,
        pulled: PullResponse,
        start: Cursor,
        result: &mut SyncCycleResult,
    ) -> SyncResult<CyclePlan> {
        let now = self.now_ms();
        let mut plan = CyclePlan::new(pulled.new_cursor);

        // latest change per record, with the first sequence it appeared at
        let mut latest: BTreeMap<RecordId, (u64, u64, Record)> = BTreeMap::new();
        for change in pulled.changes {
            if change.sequence <= start.value() {
                continue;
            }
            match latest.entry(change.record.id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert((change.sequence, change.sequence, change.record));
                }
                Entry::Occupied(mut slot) => {
                    let (first, last, record) = slot.get_mut();
                    *first = (*first).min(change.sequence);
                    if change.sequence > *last {
                        *last = change.sequence;
                        *record = change.record;
                    }
                }
            }
        }

        for (id, (first_seq, _, remote)) in latest {
            let remote = Record {
                origin: Origin::Remote,
                ..remote
            };
            if let Err(e) = remote.validate() {
                warn!(scope = %scope, record = %id, error = %e, "skipping invalid remote record");
                result.errors.push(format!("{scope}/{id}: {e}"));
                plan.skipped.insert(id);
                continue;
            }

            if self.conflicts.is_pending(scope, &id) {
                plan.refreshed.push(remote);
                plan.hold(first_seq);
                plan.skipped.insert(id);
                continue;
            }

            let Some(local) = self.store.get(scope, &id)? else {
                plan.apply_remote(remote, None);
                continue;
            };

            match classify(&local, &remote) {
                Err(e) => {
                    warn!(scope = %scope, record = %id, error = %e, "rejecting remote record");
                    result.errors.push(format!("{scope}/{id}: {e}"));
                    plan.skipped.insert(id);
                }
                Ok(Some(conflict_type)) => {
                    debug!(scope = %scope, record = %id, ?conflict_type, "conflict detected");
                    let conflict =
                        Conflict::new(scope.clone(), conflict_type, local.record, remote, now);
                    plan.conflicts.push((first_seq, conflict));
                }
                Ok(None) if local.record.same_content(&remote) => {
                    // both sides agree; adopt the remote version unless ours is ahead
                    if remote.version >= local.record.version
                        && local.base_version != Some(remote.version)
                    {
                        plan.apply_remote(remote, Some(local.record.version));
                    }
                }
                Ok(None) if local.is_locally_changed() => {
                    // only the local copy moved; queued below
                }
                Ok(None) => plan.apply_remote(remote, Some(local.record.version)),
            }
        }

        for tracked in self.store.changed_records(scope)? {
            let id = tracked.record.id.clone();
            if plan.is_claimed(&id) || self.conflicts.is_pending(scope, &id) {
                continue;
            }
            if let Err(e) = tracked.record.validate() {
                result.errors.push(format!("{scope}/{id}: {e}"));
                continue;
            }
            plan.queue_push(PushItem {
                expected_version: Some(tracked.record.version),
                base_version: tracked.base_version,
                record: tracked.record,
            });
        }

        Ok(plan)
    }

    fn settle(
        &self,
        scope: &Scope,
        mut conflict: Conflict,
        sequence: Option<u64>,
        policy: ConflictPolicy,
        plan: &mut CyclePlan,
        result: &mut SyncCycleResult,
    ) {
        let outcome = {
            let mergers = self.mergers.read();
            resolve(&mut conflict, policy, mergers.get(scope))
        };

        match outcome {
            Ok(None) => {
                if let Some(sequence) = sequence {
                    plan.hold(sequence);
                }
                plan.awaiting.push(conflict.clone());
                plan.skipped.insert(conflict.record_id.clone());
                result.conflicts.push(conflict);
            }
            Ok(Some(resolution)) => {
                let expected = Some(conflict.local.version);
                let remote_version = conflict.remote.version;
                match resolution {
                    Resolution::Remote(record) => plan.apply_remote(record, expected),
                    Resolution::Local(record) | Resolution::Merged(record) => {
                        let base_version = Some(remote_version);
                        plan.stage(
                            TrackedRecord {
                                record: record.clone(),
                                base_version,
                            },
                            expected,
                        );
                        plan.queue_push(PushItem {
                            record,
                            base_version,
                            expected_version: expected,
                        });
                    }
                }
                plan.settled.push(conflict.clone());
                result.conflicts.push(conflict);
            }
            Err(e) => {
                warn!(
                    scope = %scope,
                    record = %conflict.record_id,
                    error = %e,
                    "conflict resolution failed"
                );
                result.errors.push(format!("{scope}/{}: {e}", conflict.record_id));
                plan.skipped.insert(conflict.record_id.clone());
                result.conflicts.push(conflict);
            }
        }
    }

    async fn push_queued(
        &self,
        scope: &Scope,
        policy: ConflictPolicy,
        plan: &mut CyclePlan,
        result: &mut SyncCycleResult,
        cancel: &AtomicBool,
    ) -> Result<(), CycleAbort> {
        // the second pass only carries records re-resolved after a version conflict
        for pass in 0..2 {
            if plan.push.is_empty() {
                break;
            }
            let mut queue: HashMap<RecordId, PushItem> = std::mem::take(&mut plan.push)
                .into_iter()
                .collect();
            let mut records: Vec<Record> = queue.values().map(|item| item.record.clone()).collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));

            let gateway = &self.gateway;
            let response = match self
                .with_retry(scope, "push", move || gateway.push(scope, records.clone()))
                .await
            {
                Ok(response) => response,
                Err(errors) => {
                    // winners stay staged locally and are pushed next cycle
                    result.errors.extend(errors);
                    return Ok(());
                }
            };
            check_cancelled(cancel)?;

            for id in response.acked {
                if let Some(item) = queue.remove(&id) {
                    plan.acked.push((id.clone(), item.record.version));
                    result.pushed.push(id);
                }
            }

            for Rejection {
                id,
                reason,
                current,
            } in response.rejected
            {
                let Some(item) = queue.remove(&id) else {
                    continue;
                };
                match current {
                    Some(current) if pass == 0 && reason == RejectReason::VersionConflict => {
                        self.reconcile_rejection(scope, policy, item, current, plan, result);
                    }
                    _ => {
                        warn!(
                            scope = %scope,
                            record = %id,
                            reason = reason.as_str(),
                            "push rejected"
                        );
                        result
                            .errors
                            .push(format!("{scope}/{id}: push rejected: {}", reason.as_str()));
                    }
                }
            }

            for id in queue.keys() {
                result
                    .errors
                    .push(format!("{scope}/{id}: push not acknowledged"));
            }
        }
        Ok(())
    }

    fn reconcile_rejection(
        &self,
        scope: &Scope,
        policy: ConflictPolicy,
        item: PushItem,
        current: Record,
        plan: &mut CyclePlan,
        result: &mut SyncCycleResult,
    ) {
        let current = Record {
            origin: Origin::Remote,
            ..current
        };
        let local = TrackedRecord {
            record: item.record,
            base_version: item.base_version,
        };

        let conflict_type = match classify(&local, &current) {
            Ok(Some(conflict_type)) => conflict_type,
            Ok(None) if local.record.same_content(&current) => {
                plan.apply_remote(current, item.expected_version);
                return;
            }
            Ok(None) => ConflictType::UpdateUpdate,
            Err(e) => {
                result.errors.push(format!("{scope}/{}: {e}", local.record.id));
                return;
            }
        };

        debug!(
            scope = %scope,
            record = %local.record.id,
            ?conflict_type,
            "push rejected with version conflict"
        );
        let conflict = Conflict::new(
            scope.clone(),
            conflict_type,
            local.record,
            current,
            self.now_ms(),
        );
        self.settle(scope, conflict, None, policy, plan, result);
    }

    fn finalize(
        &self,
        scope: &Scope,
        plan: CyclePlan,
        start: Cursor,
        result: &mut SyncCycleResult,
    ) -> Result<(), CycleAbort> {
        let cursor = plan.next_cursor(start);
        let batch = CommitBatch {
            writes: plan.writes.into_values().collect(),
            acked: plan.acked,
            cursor: Some(cursor),
        };
        self.store.commit(scope, batch)?;
        debug!(scope = %scope, cursor = %cursor, "cycle committed");
        result.applied = plan.applied;
        self.status.update(|s| s.sync_errors.clear());

        for remote in plan.refreshed {
            self.conflicts.refresh_remote(scope, remote);
        }
        for conflict in plan.settled {
            self.conflicts.record_resolved(conflict);
        }
        for conflict in plan.awaiting {
            let (record, id) = (conflict.record_id.clone(), conflict.id);
            if self.conflicts.insert_pending(conflict) {
                info!(
                    scope = %scope,
                    record = %record,
                    conflict = %id,
                    "conflict awaiting decision"
                );
            }
        }

        let ttl = self.config.cache_ttl;
        for record in plan.cache_writes {
            let key = cache_key(scope, &record.id);
            if record.deleted {
                self.cache.remove(&key);
                continue;
            }
            if let Err(e) = self
                .cache
                .set_with_source(&key, &record, ttl, EntrySource::Remote)
            {
                warn!(key = %key, error = %e, "failed to cache record");
                result.errors.push(format!("{key}: {}", SyncError::from(e)));
            }
        }

        let now = self.now_ms();
        for conflict in self
            .conflicts
            .stale(scope, now, self.config.stale_conflict_after)
        {
            let error = SyncError::StaleConflict {
                scope: scope.to_string(),
                record_id: conflict.record_id.to_string(),
                age_secs: now.saturating_sub(conflict.detected_at) / 1000,
            };
            warn!(error = %error, "stale conflict");
            result.errors.push(error.to_string());
        }
        Ok(())
    }

    fn resolve_conflict(&self, id: ConflictId, choice: ConflictChoice) -> bool {
        let pending = match self.conflicts.get(id) {
            None => return false,
            Some(conflict) if conflict.is_resolved() => return true,
            Some(conflict) => conflict,
        };

        // the decision applies to the local copy the conflict was detected against
        let current = match self.store.get(&pending.scope, &pending.record_id) {
            Ok(current) => current,
            Err(e) => {
                warn!(conflict = %id, error = %e, "failed to read conflicting record");
                self.status.update(|s| s.sync_errors.push(e.to_string()));
                return false;
            }
        };
        if let Some(current) = current {
            if current.record.version != pending.local.version {
                let error = SyncError::OutdatedDecision {
                    scope: pending.scope.to_string(),
                    record_id: pending.record_id.to_string(),
                };
                warn!(conflict = %id, error = %error, "manual decision refused");
                self.conflicts.refresh_local(&pending.scope, current.record);
                self.status.update(|s| {
                    s.sync_errors.push(error.to_string());
                    self.refresh_health(s);
                });
                return false;
            }
        }

        let outcome = {
            let mergers = self.mergers.read();
            self.conflicts.settle_with(id, |conflict| {
                let merger = mergers.get(&conflict.scope);
                resolve_with_choice(conflict, choice, merger)
                    .map(|resolution| (conflict.clone(), resolution))
            })
        };

        let (conflict, resolution) = match outcome {
            None => return false,
            Some(Ok(decided)) => decided,
            Some(Err(e)) => {
                warn!(conflict = %id, error = %e, "manual conflict resolution failed");
                self.status.update(|s| s.sync_errors.push(e.to_string()));
                return false;
            }
        };

        let scope = conflict.scope.clone();
        let tracked = match &resolution {
            Resolution::Remote(record) => TrackedRecord::synced(record.clone()),
            Resolution::Local(record) | Resolution::Merged(record) => TrackedRecord {
                record: record.clone(),
                base_version: Some(conflict.remote.version),
            },
        };
        let batch = CommitBatch {
            writes: vec![StagedWrite {
                tracked,
                expected_version: Some(conflict.local.version),
            }],
            ..CommitBatch::default()
        };
        if let Err(e) = self.store.commit(&scope, batch) {
            warn!(conflict = %id, error = %e, "failed to store conflict resolution");
            self.status.update(|s| s.sync_errors.push(e.to_string()));
        }

        if let Resolution::Remote(record) = &resolution {
            let key = cache_key(&scope, &record.id);
            if record.deleted {
                self.cache.remove(&key);
            } else if let Err(e) = self.cache.set_with_source(
                &key,
                record,
                self.config.cache_ttl,
                EntrySource::Remote,
            ) {
                warn!(error = %e, "failed to cache resolved record");
            }
        }

        info!(scope = %scope, record = %conflict.record_id, ?choice, "conflict resolved manually");
        let pending = self.pending_total();
        self.status.update(|s| {
            s.pending_changes = pending;
            self.refresh_health(s);
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::gateway::{MockGateway, MockReply};
    use crate::status::DataIntegrity;
    use crate::store::MemoryLocalStore;
    use drawsync_cache::{CacheConfig, ManualClock};
    use drawsync_protocol::{PushResponse, RemoteChange};
    use serde_json::json;

    type TestEngine = SyncEngine<Arc<MockGateway>, Arc<MemoryLocalStore>>;

    fn scope() -> Scope {
        Scope::new("draws")
    }

    fn engine_with(
        settings: SyncSettings,
    ) -> (TestEngine, Arc<MockGateway>, Arc<MemoryLocalStore>) {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryLocalStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = Arc::new(CacheStore::with_clock(CacheConfig::new(), clock));
        let config = EngineConfig::new()
            .with_request_timeout(Duration::from_millis(200))
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_jitter(false),
            );
        let engine = SyncEngine::new(
            config,
            Arc::clone(&gateway),
            Arc::clone(&store),
            cache,
            settings,
        )
        .unwrap();
        engine.register_scope(scope());
        (engine, gateway, store)
    }

    fn engine() -> (TestEngine, Arc<MockGateway>, Arc<MemoryLocalStore>) {
        engine_with(SyncSettings::default())
    }

    fn pull_of(changes: Vec<(u64, Record)>) -> MockReply<PullResponse> {
        let cursor = changes.iter().map(|(seq, _)| *seq).max().unwrap_or(0);
        MockReply::Respond(PullResponse::new(
            changes
                .into_iter()
                .map(|(sequence, record)| RemoteChange { sequence, record })
                .collect(),
            Cursor(cursor),
        ))
    }

    #[tokio::test]
    async fn remote_only_change_is_applied_and_cached() {
        let (engine, gateway, store) = engine();
        gateway.push_pull_reply(pull_of(vec![(
            1,
            Record::remote("1", json!({"x": 1}), 1, 10),
        )]));

        let result = engine.run_cycle(&scope()).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.applied, vec![RecordId::from("1")]);
        assert!(result.pushed.is_empty());
        assert_eq!(store.cursor(&scope()).unwrap(), Cursor(1));

        let cached: Option<Record> = engine.cache().get("draws/1");
        assert_eq!(cached.unwrap().payload, json!({"x": 1}));
        assert_eq!(engine.phase(&scope()), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn local_change_is_pushed_and_acked() {
        let (engine, gateway, store) = engine();
        engine
            .record_local_change(&scope(), &RecordId::from("2"), Some(json!({"x": 5})))
            .unwrap();
        assert_eq!(engine.status().pending_changes, 1);

        let result = engine.run_cycle(&scope()).await;
        assert!(result.success);
        assert_eq!(result.pushed, vec![RecordId::from("2")]);
        assert_eq!(gateway.push_calls(), 1);
        assert!(store.changed_records(&scope()).unwrap().is_empty());
        assert_eq!(engine.status().pending_changes, 0);
        assert!(engine.status().last_sync_time.is_some());
    }

    #[tokio::test]
    async fn non_object_payload_is_refused() {
        let (engine, _, _) = engine();
        let err = engine
            .record_local_change(&scope(), &RecordId::from("2"), Some(json!([1, 2])))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn auth_error_aborts_without_retry() {
        let (engine, gateway, _) = engine();
        gateway.push_pull_reply(MockReply::AuthError("token expired".into()));

        let result = engine.run_cycle(&scope()).await;
        assert!(!result.success);
        assert_eq!(gateway.pull_calls(), 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(engine.status().sync_errors.len(), 1);
        assert_eq!(engine.phase(&scope()), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn transient_pull_failure_is_retried() {
        let (engine, gateway, _) = engine();
        gateway.push_pull_reply(MockReply::NetworkError("reset".into()));

        let result = engine.run_cycle(&scope()).await;
        assert!(result.success);
        assert_eq!(gateway.pull_calls(), 2);
        // cleared once the pull succeeded
        assert!(engine.status().sync_errors.is_empty());
    }

    #[tokio::test]
    async fn push_version_conflict_is_resolved_in_the_same_cycle() {
        let (engine, gateway, store) = engine_with(SyncSettings {
            conflict_resolution_policy: ConflictPolicy::LocalPriority,
            ..SyncSettings::default()
        });
        store.insert(
            &scope(),
            TrackedRecord {
                record: Record::local("5", json!({"x": 2}), 2, 100),
                base_version: Some(1),
            },
        );
        let current = Record::remote("5", json!({"x": 9}), 3, 200);
        gateway.push_push_reply(MockReply::Respond(PushResponse {
            acked: Vec::new(),
            rejected: vec![Rejection::version_conflict(current)],
        }));

        let result = engine.run_cycle(&scope()).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(gateway.push_calls(), 2);
        assert_eq!(result.conflicts.len(), 1);

        let batches = gateway.pushed_batches();
        assert_eq!(batches[1][0].version, 4);
        assert_eq!(batches[1][0].payload, json!({"x": 2}));

        let stored = store.get(&scope(), &RecordId::from("5")).unwrap().unwrap();
        assert_eq!(stored.record.version, 4);
        assert!(!stored.is_locally_changed());
    }

    #[tokio::test]
    async fn offline_engine_skips_cycles() {
        let (engine, gateway, _) = engine();
        engine.set_online(false);

        let result = engine.run_cycle(&scope()).await;
        assert!(!result.success);
        assert_eq!(gateway.pull_calls(), 0);
        assert_eq!(engine.metrics().total_syncs, 0);
    }

    #[tokio::test]
    async fn force_sync_aggregates_scopes() {
        let (engine, gateway, _) = engine();
        engine.register_scope(Scope::new("tickets"));

        let result = engine.force_sync().await;
        assert!(result.success);
        assert_eq!(gateway.pull_calls(), 2);
        assert_eq!(engine.metrics().total_syncs, 2);
    }

    #[tokio::test]
    async fn invalid_settings_patch_is_rejected() {
        let (engine, _, _) = engine();
        let patch = SettingsPatch {
            sync_interval_minutes: Some(90),
            ..SettingsPatch::default()
        };
        assert!(engine.update_settings(&patch).is_err());
        assert_eq!(engine.settings(), SyncSettings::default());
    }

    #[tokio::test]
    async fn fresh_engine_scores_zero_until_a_cycle_succeeds() {
        let (engine, _, _) = engine();
        assert_eq!(engine.metrics().health_score, 0);
        assert_eq!(engine.status().data_integrity, DataIntegrity::Error);

        assert!(engine.run_cycle(&scope()).await.success);
        assert_eq!(engine.metrics().health_score, 100);
        assert_eq!(engine.status().data_integrity, DataIntegrity::Healthy);
    }

    #[tokio::test]
    async fn reset_metrics_zeroes_counters() {
        let (engine, _, _) = engine();
        engine.run_cycle(&scope()).await;
        assert_eq!(engine.metrics().total_syncs, 1);

        engine.reset_metrics();
        assert_eq!(engine.metrics().total_syncs, 0);
    }

    #[tokio::test]
    async fn test_connection_updates_status() {
        let (engine, gateway, _) = engine();
        gateway.set_connected(false);
        assert!(!engine.test_connection().await);
        assert!(!engine.status().is_online);
    }
}
