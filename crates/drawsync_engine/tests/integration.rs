//! Integration tests for the sync engine against the reference remote.

use async_trait::async_trait;
use drawsync_cache::{CacheConfig, CacheStore, ManualClock};
use drawsync_engine::{
    Connectivity, CyclePhase, DataIntegrity, EngineConfig, LocalStore, MemoryLocalStore,
    RemoteGateway, RetryConfig, Scheduler, SyncEngine, SyncError, SyncResult, SyncSettings,
};
use drawsync_protocol::{
    ConflictChoice, ConflictPolicy, Cursor, PullResponse, PushResponse, Record, RecordId, Scope,
};
use drawsync_remote::{RemoteError, RemoteStore};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Failure injected into one gateway call.
#[derive(Debug, Clone, Copy)]
enum Fault {
    /// The call never returns.
    Hang,
    /// The connection drops.
    Drop,
    /// The remote refuses the credentials.
    Unauthorized,
}

type PushHook = Box<dyn FnOnce(&RemoteStore) + Send>;

/// A gateway that forwards to an in-process [`RemoteStore`], with
/// scripted faults and latency.
struct FaultyGateway {
    remote: Arc<RemoteStore>,
    pull_faults: Mutex<VecDeque<Fault>>,
    push_faults: Mutex<VecDeque<Fault>>,
    before_push: Mutex<Option<PushHook>>,
    latency: Mutex<Duration>,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
}

impl FaultyGateway {
    fn new(remote: Arc<RemoteStore>) -> Self {
        Self {
            remote,
            pull_faults: Mutex::new(VecDeque::new()),
            push_faults: Mutex::new(VecDeque::new()),
            before_push: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
        }
    }

    fn fail_pulls(&self, fault: Fault, times: usize) {
        self.pull_faults
            .lock()
            .extend(std::iter::repeat(fault).take(times));
    }

    fn fail_pushes(&self, fault: Fault, times: usize) {
        self.push_faults
            .lock()
            .extend(std::iter::repeat(fault).take(times));
    }

    /// Runs `hook` against the remote right before the next push lands.
    fn before_next_push(&self, hook: impl FnOnce(&RemoteStore) + Send + 'static) {
        *self.before_push.lock() = Some(Box::new(hook));
    }

    fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    async fn inject(&self, fault: Option<Fault>) -> SyncResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            None => Ok(()),
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Drop) => Err(SyncError::network_retryable("connection reset")),
            Some(Fault::Unauthorized) => Err(SyncError::Auth("token expired".into())),
        }
    }
}

fn to_sync_error(error: RemoteError) -> SyncError {
    if error.is_client_error() {
        SyncError::network_fatal(error.to_string())
    } else {
        SyncError::network_retryable(error.to_string())
    }
}

#[async_trait]
impl RemoteGateway for FaultyGateway {
    async fn pull(&self, scope: &Scope, cursor: Cursor) -> SyncResult<PullResponse> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let fault = self.pull_faults.lock().pop_front();
        self.inject(fault).await?;
        self.remote.pull(scope, cursor).map_err(to_sync_error)
    }

    async fn push(&self, scope: &Scope, records: Vec<Record>) -> SyncResult<PushResponse> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let fault = self.push_faults.lock().pop_front();
        self.inject(fault).await?;
        let hook = self.before_push.lock().take();
        if let Some(hook) = hook {
            hook(&self.remote);
        }
        self.remote.push(scope, records).map_err(to_sync_error)
    }

    async fn test_connection(&self) -> bool {
        self.remote.is_available()
    }
}

type Engine = SyncEngine<Arc<FaultyGateway>, Arc<MemoryLocalStore>>;

struct Harness {
    engine: Engine,
    gateway: Arc<FaultyGateway>,
    remote: Arc<RemoteStore>,
    store: Arc<MemoryLocalStore>,
}

/// Local edits are stamped with the engine clock, fixed at this instant.
const LOCAL_NOW: u64 = 1_000_000;

fn harness(policy: ConflictPolicy) -> Harness {
    let remote = Arc::new(RemoteStore::new());
    let gateway = Arc::new(FaultyGateway::new(Arc::clone(&remote)));
    let store = Arc::new(MemoryLocalStore::new());
    let clock = Arc::new(ManualClock::new(LOCAL_NOW));
    let cache = Arc::new(CacheStore::with_clock(CacheConfig::new(), clock));
    let config = EngineConfig::new()
        .with_request_timeout(Duration::from_millis(200))
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(5))
                .with_jitter(false),
        );
    let settings = SyncSettings {
        conflict_resolution_policy: policy,
        ..SyncSettings::default()
    };

    let engine = SyncEngine::new(
        config,
        Arc::clone(&gateway),
        Arc::clone(&store),
        cache,
        settings,
    )
    .unwrap();
    engine.register_scope(draws());

    Harness {
        engine,
        gateway,
        remote,
        store,
    }
}

fn draws() -> Scope {
    Scope::new("draws")
}

fn id(value: &str) -> RecordId {
    RecordId::from(value)
}

impl Harness {
    fn edit_locally(&self, record: &str, payload: Value) {
        self.engine
            .record_local_change(&draws(), &id(record), Some(payload))
            .unwrap();
    }

    fn local_payload(&self, record: &str) -> Value {
        self.store
            .get(&draws(), &id(record))
            .unwrap()
            .unwrap()
            .record
            .payload
    }

    fn remote_payload(&self, record: &str) -> Value {
        self.remote.get(&draws(), &id(record)).unwrap().payload
    }

    /// Seeds a record on the remote and syncs it down.
    async fn seed(&self, record: &str, payload: Value) {
        self.remote.put(&draws(), record, payload, 0).unwrap();
        let result = self.engine.run_cycle(&draws()).await;
        assert!(result.applied.contains(&id(record)), "{:?}", result.errors);
    }
}

#[tokio::test]
async fn scenario_a_local_record_pushed_without_conflict() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.edit_locally("1", json!({"x": 5}));
    assert_eq!(h.engine.status().pending_changes, 1);

    let result = h.engine.run_cycle(&draws()).await;

    assert!(result.success, "{:?}", result.errors);
    assert!(result.conflicts.is_empty());
    assert_eq!(result.pushed, vec![id("1")]);
    assert_eq!(h.engine.status().pending_changes, 0);
    assert_eq!(h.engine.status().conflicts_detected, 0);
    assert_eq!(h.remote_payload("1"), json!({"x": 5}));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_offline_edit_pushed_on_reconnect() {
    let h = harness(ConflictPolicy::TimestampPriority);
    let scheduler = Scheduler::spawn(h.engine.clone(), Connectivity::Offline);
    assert!(!h.engine.status().is_online);

    h.edit_locally("2", json!({"x": 5}));
    let offline = h.engine.run_cycle(&draws()).await;
    assert!(!offline.success);
    assert_eq!(h.gateway.pulls(), 0);

    scheduler.set_connectivity(Connectivity::Wifi);
    for _ in 0..100 {
        if h.remote.get(&draws(), &id("2")).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(h.remote_payload("2"), json!({"x": 5}));
    assert_eq!(h.engine.status().pending_changes, 0);
    assert_eq!(h.engine.status().conflicts_detected, 0);
    assert!(h.engine.status().is_online);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn scenario_c_later_remote_edit_wins_by_timestamp() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.seed("3", json!({"x": 1})).await;

    h.edit_locally("3", json!({"x": 5}));
    h.remote
        .put(&draws(), "3", json!({"x": 7}), LOCAL_NOW + 1_000)
        .unwrap();

    let result = h.engine.run_cycle(&draws()).await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.conflicts.len(), 1);
    assert!(result.conflicts[0].is_resolved());
    assert_eq!(h.local_payload("3"), json!({"x": 7}));
    assert_eq!(h.remote_payload("3"), json!({"x": 7}));
    assert!(result.pushed.is_empty());
    assert_eq!(h.engine.status().pending_changes, 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_pull_timeouts_exhaust_retries() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.edit_locally("9", json!({"x": 1}));
    let pending_before = h.engine.status().pending_changes;
    h.gateway.fail_pulls(Fault::Hang, 3);

    let result = h.engine.run_cycle(&draws()).await;

    assert!(!result.success);
    assert_eq!(h.gateway.pulls(), 3);
    assert_eq!(h.gateway.pushes(), 0);
    let status = h.engine.status();
    assert_eq!(status.sync_errors.len(), 3);
    assert_eq!(status.data_integrity, DataIntegrity::Error);
    assert_eq!(status.pending_changes, pending_before);
    assert!(!status.sync_in_progress);
    assert_eq!(h.engine.metrics().failed_syncs, 1);
}

#[tokio::test]
async fn scenario_e_ask_policy_holds_record_until_decided() {
    let h = harness(ConflictPolicy::Ask);
    h.seed("4", json!({"x": 1})).await;

    h.edit_locally("4", json!({"x": 5}));
    h.remote
        .put(&draws(), "4", json!({"x": 7}), LOCAL_NOW + 1_000)
        .unwrap();

    let first = h.engine.run_cycle(&draws()).await;
    assert!(first.success, "{:?}", first.errors);
    assert_eq!(h.engine.status().conflicts_detected, 1);
    assert!(!first.applied.contains(&id("4")));
    assert!(!first.pushed.contains(&id("4")));

    // later cycles neither touch the record nor duplicate the conflict
    let second = h.engine.run_cycle(&draws()).await;
    assert!(second.success);
    assert!(!second.applied.contains(&id("4")));
    assert!(!second.pushed.contains(&id("4")));
    assert_eq!(h.engine.status().conflicts_detected, 1);
    assert_eq!(h.engine.pending_conflicts().len(), 1);
    assert_eq!(h.local_payload("4"), json!({"x": 5}));
    assert_eq!(h.remote_payload("4"), json!({"x": 7}));

    assert!(h
        .engine
        .resolve_record_conflict(&draws(), &id("4"), ConflictChoice::Local));
    assert_eq!(h.engine.status().conflicts_detected, 0);

    let third = h.engine.run_cycle(&draws()).await;
    assert!(third.success, "{:?}", third.errors);
    assert_eq!(third.pushed, vec![id("4")]);
    assert_eq!(h.remote_payload("4"), json!({"x": 5}));
    assert_eq!(h.engine.status().pending_changes, 0);
}

#[tokio::test]
async fn repeated_cycles_are_idempotent() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.seed("1", json!({"x": 1})).await;
    h.edit_locally("2", json!({"x": 2}));

    let first = h.engine.run_cycle(&draws()).await;
    assert!(first.success);
    let records = h.store.records(&draws());
    let changes = h.remote.change_count(&draws());
    let cursor = h.store.cursor(&draws()).unwrap();

    for _ in 0..2 {
        let again = h.engine.run_cycle(&draws()).await;
        assert!(again.success, "{:?}", again.errors);
        assert!(again.applied.is_empty());
        assert!(again.pushed.is_empty());
        assert!(again.conflicts.is_empty());
        assert_eq!(h.store.cursor(&draws()).unwrap(), cursor);
    }
    assert_eq!(h.store.records(&draws()), records);
    assert_eq!(h.remote.change_count(&draws()), changes);
}

#[tokio::test(start_paused = true)]
async fn concurrent_force_sync_shares_one_cycle() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.edit_locally("1", json!({"x": 1}));
    h.gateway.set_latency(Duration::from_millis(50));

    let (a, b) = tokio::join!(h.engine.force_sync(), h.engine.force_sync());

    assert!(a.success && b.success);
    assert_eq!(h.gateway.pulls(), 1);
    assert_eq!(h.gateway.pushes(), 1);
    assert_eq!(a.pushed, b.pushed);
    assert_eq!(h.engine.metrics().total_syncs, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_cycle_commits_nothing() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.remote.put(&draws(), "1", json!({"x": 1}), 0).unwrap();
    h.gateway.set_latency(Duration::from_millis(100));

    let engine = h.engine.clone();
    let running = tokio::spawn(async move { engine.run_cycle(&draws()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.engine.cancel(&draws()));

    let result = running.await.unwrap();
    assert!(result.cancelled);
    assert!(!result.success);
    assert!(h.store.records(&draws()).is_empty());
    assert_eq!(h.store.cursor(&draws()).unwrap(), Cursor(0));
    assert!(!h.engine.cancel(&draws()));
    assert_eq!(h.engine.metrics().total_syncs, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_pushing_leaves_conflicts_and_status_untouched() {
    let h = harness(ConflictPolicy::Ask);
    h.seed("4", json!({"x": 1})).await;
    h.edit_locally("4", json!({"x": 5}));
    h.remote
        .put(&draws(), "4", json!({"x": 7}), LOCAL_NOW + 1_000)
        .unwrap();
    h.edit_locally("5", json!({"x": 2}));

    let before = h.engine.status();
    let cursor = h.store.cursor(&draws()).unwrap();
    let metrics = h.engine.metrics();
    h.gateway.set_latency(Duration::from_millis(100));

    let engine = h.engine.clone();
    let running = tokio::spawn(async move { engine.run_cycle(&draws()).await });
    // the pull lands at 100ms, the push at 200ms
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.phase(&draws()), CyclePhase::Pushing);
    assert!(h.engine.cancel(&draws()));

    let result = running.await.unwrap();
    assert!(result.cancelled);
    assert!(h.engine.pending_conflicts().is_empty());
    assert_eq!(h.engine.status(), before);
    assert_eq!(h.engine.metrics(), metrics);
    assert_eq!(h.store.cursor(&draws()).unwrap(), cursor);
    assert_eq!(h.local_payload("4"), json!({"x": 5}));
    assert_eq!(h.store.changed_records(&draws()).unwrap().len(), 2);

    // the next cycle detects the conflict exactly once
    h.gateway.set_latency(Duration::ZERO);
    let again = h.engine.run_cycle(&draws()).await;
    assert!(again.success, "{:?}", again.errors);
    assert_eq!(h.engine.pending_conflicts().len(), 1);
    assert_eq!(h.engine.status().conflicts_detected, 1);
}

#[tokio::test]
async fn decision_on_outdated_conflict_is_refused_until_retried() {
    let h = harness(ConflictPolicy::Ask);
    h.seed("4", json!({"x": 1})).await;
    h.edit_locally("4", json!({"x": 5}));
    h.remote
        .put(&draws(), "4", json!({"x": 7}), LOCAL_NOW + 1_000)
        .unwrap();
    let first = h.engine.run_cycle(&draws()).await;
    assert!(first.success, "{:?}", first.errors);
    assert_eq!(h.engine.pending_conflicts().len(), 1);

    // edited again while the conflict waits
    h.edit_locally("4", json!({"x": 6}));
    assert!(!h
        .engine
        .resolve_record_conflict(&draws(), &id("4"), ConflictChoice::Local));
    assert_eq!(h.engine.status().sync_errors.len(), 1);
    let pending = h.engine.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].local.payload, json!({"x": 6}));

    assert!(h
        .engine
        .resolve_record_conflict(&draws(), &id("4"), ConflictChoice::Local));
    assert!(h.engine.pending_conflicts().is_empty());

    let next = h.engine.run_cycle(&draws()).await;
    assert!(next.success, "{:?}", next.errors);
    assert_eq!(next.pushed, vec![id("4")]);
    assert_eq!(h.remote_payload("4"), json!({"x": 6}));
}

#[tokio::test]
async fn push_rejection_reenters_resolution() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.edit_locally("6", json!({"x": 1}));
    // another device creates the same record between our pull and push
    h.gateway.before_next_push(|remote| {
        remote
            .put(&Scope::new("draws"), "6", json!({"x": 9}), LOCAL_NOW + 5_000)
            .unwrap();
    });

    let result = h.engine.run_cycle(&draws()).await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.conflicts.len(), 1);
    assert!(result.pushed.is_empty());
    assert_eq!(h.local_payload("6"), json!({"x": 9}));
    assert_eq!(h.gateway.pushes(), 1);
    assert_eq!(h.engine.status().pending_changes, 0);
}

#[tokio::test]
async fn local_priority_overwrites_remote() {
    let h = harness(ConflictPolicy::LocalPriority);
    h.seed("5", json!({"x": 1})).await;
    h.edit_locally("5", json!({"x": 5}));
    h.remote
        .put(&draws(), "5", json!({"x": 7}), LOCAL_NOW + 1_000)
        .unwrap();

    let result = h.engine.run_cycle(&draws()).await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.pushed, vec![id("5")]);
    assert_eq!(h.remote_payload("5"), json!({"x": 5}));
    assert_eq!(h.local_payload("5"), json!({"x": 5}));
    assert_eq!(h.engine.status().pending_changes, 0);
}

#[tokio::test]
async fn remote_delete_drops_cached_copy() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.seed("7", json!({"x": 1})).await;
    assert!(h.engine.cache().contains_key("draws/7"));

    h.remote.delete(&draws(), "7", 10).unwrap();
    let result = h.engine.run_cycle(&draws()).await;

    assert!(result.success, "{:?}", result.errors);
    assert!(result.applied.contains(&id("7")));
    assert!(!h.engine.cache().contains_key("draws/7"));
    let local = h.store.get(&draws(), &id("7")).unwrap().unwrap();
    assert!(local.record.deleted);
}

#[tokio::test]
async fn auth_failure_is_not_retried() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.gateway.fail_pulls(Fault::Unauthorized, 1);

    let result = h.engine.run_cycle(&draws()).await;

    assert!(!result.success);
    assert_eq!(h.gateway.pulls(), 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("authentication"));
}

#[tokio::test]
async fn transient_push_failure_recovers_within_cycle() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.edit_locally("8", json!({"x": 1}));
    h.gateway.fail_pushes(Fault::Drop, 2);

    let result = h.engine.run_cycle(&draws()).await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(h.gateway.pushes(), 3);
    assert_eq!(result.pushed, vec![id("8")]);
}

#[tokio::test]
async fn scopes_sync_independently() {
    let h = harness(ConflictPolicy::TimestampPriority);
    let tickets = Scope::new("tickets");
    h.edit_locally("1", json!({"x": 1}));
    h.engine
        .record_local_change(&tickets, &id("1"), Some(json!({"line": [1, 2, 3]})))
        .unwrap();

    let result = h.engine.force_sync().await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.pushed.len(), 2);
    assert_eq!(h.remote.head(&draws()), Cursor(1));
    assert_eq!(h.remote.head(&tickets), Cursor(1));
    assert_eq!(h.engine.status().data_integrity, DataIntegrity::Healthy);
}

#[tokio::test]
async fn unavailable_remote_counts_as_failed_cycle() {
    let h = harness(ConflictPolicy::TimestampPriority);
    h.remote.set_available(false);
    assert!(!h.engine.test_connection().await);
    assert!(!h.engine.status().is_online);

    h.remote.set_available(true);
    assert!(h.engine.test_connection().await);
    let result = h.engine.run_cycle(&draws()).await;
    assert!(result.success);
    assert_eq!(h.engine.metrics().successful_syncs, 1);
}
