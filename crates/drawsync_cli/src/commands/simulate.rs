//! Simulate command implementation.

use async_trait::async_trait;
use drawsync_cache::{CacheConfig, CacheStore, Clock, ManualClock};
use drawsync_engine::{
    EngineConfig, LocalStore, MemoryLocalStore, MetricsSnapshot, RemoteGateway, RetryConfig,
    SyncEngine, SyncError, SyncResult, SyncSettings, SyncStatus,
};
use drawsync_protocol::{
    ConflictChoice, ConflictPolicy, Cursor, FieldMerger, PullResponse, PushResponse, Record,
    RecordId, Scope,
};
use drawsync_remote::{RemoteError, RemoteStore};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Scope holding the simulated draws.
const SCOPE: &str = "draws";

/// Simulated wall clock start (ms since epoch).
const START_MS: u64 = 1_700_000_000_000;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of cycles to run.
    pub cycles: u32,
    /// Number of draw records.
    pub records: u32,
    /// Policy overriding the settings.
    pub policy: Option<ConflictPolicy>,
    /// Choice applied to pending conflicts after each cycle.
    pub decide: Option<ConflictChoice>,
    /// Probability that a gateway call drops.
    pub drop_rate: f64,
    /// Probability that a record is edited on each side per cycle.
    pub edit_rate: f64,
    /// Random seed.
    pub seed: u64,
    /// Settings file.
    pub settings: Option<PathBuf>,
    /// Cache snapshot destination.
    pub snapshot: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cycles: 5,
            records: 10,
            policy: None,
            decide: None,
            drop_rate: 0.1,
            edit_rate: 0.2,
            seed: 7,
            settings: None,
            snapshot: None,
        }
    }
}

/// Outcome of one simulated cycle.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Cycle number, from 1.
    pub cycle: u32,
    /// Local edits made before the cycle.
    pub local_edits: usize,
    /// Remote edits made before the cycle.
    pub remote_edits: usize,
    /// Whether the cycle succeeded.
    pub success: bool,
    /// Remote records applied locally.
    pub applied: usize,
    /// Local records pushed.
    pub pushed: usize,
    /// Conflicts seen by the cycle.
    pub conflicts: usize,
    /// Pending conflicts resolved after the cycle.
    pub decided: usize,
    /// Cycle errors.
    pub errors: Vec<String>,
}

/// Cache statistics at the end of the run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    /// Stored entries.
    pub entries: usize,
    /// Cache hits.
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
    /// Stored bytes.
    pub size_bytes: usize,
}

/// Full simulation report.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    /// Policy in effect.
    pub policy: String,
    /// Per-cycle outcomes.
    pub cycles: Vec<CycleReport>,
    /// Final engine status.
    pub status: SyncStatus,
    /// Final metrics.
    pub metrics: MetricsSnapshot,
    /// Final cache statistics.
    pub cache: CacheSummary,
    /// Records whose local and remote copies differ at the end.
    pub diverged: Vec<String>,
}

/// Gateway to an in-process remote that drops calls at random.
struct SimulatedGateway {
    remote: Arc<RemoteStore>,
    rng: Mutex<StdRng>,
    drop_rate: f64,
}

impl SimulatedGateway {
    fn check_drop(&self, op: &str) -> SyncResult<()> {
        if self.rng.lock().gen_bool(self.drop_rate) {
            debug!(op, "simulated connection drop");
            return Err(SyncError::network_retryable("simulated connection drop"));
        }
        Ok(())
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
impl RemoteGateway for SimulatedGateway {
    async fn pull(&self, scope: &Scope, cursor: Cursor) -> SyncResult<PullResponse> {
        self.check_drop("pull")?;
        self.remote.pull(scope, cursor).map_err(to_sync_error)
    }

    async fn push(&self, scope: &Scope, records: Vec<Record>) -> SyncResult<PushResponse> {
        self.check_drop("push")?;
        self.remote.push(scope, records).map_err(to_sync_error)
    }

    async fn test_connection(&self) -> bool {
        self.remote.is_available()
    }
}

/// Runs the simulate command.
pub fn run(options: &Options, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulate(options))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

/// Runs the simulation and returns its report.
pub async fn simulate(options: &Options) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    for (name, rate) in [("drop rate", options.drop_rate), ("edit rate", options.edit_rate)] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(format!("{name} must be between 0 and 1, got {rate}").into());
        }
    }

    let mut settings = match &options.settings {
        Some(path) => SyncSettings::load(path)?,
        None => SyncSettings::default(),
    };
    if let Some(policy) = options.policy {
        settings.conflict_resolution_policy = policy;
    }
    let policy = settings.conflict_resolution_policy;

    let scope = Scope::new(SCOPE);
    let mut rng = StdRng::seed_from_u64(options.seed);
    let remote = Arc::new(RemoteStore::new());
    for draw in 1..=options.records {
        let payload = draw_payload(&mut rng, draw);
        remote.put(&scope, u64::from(draw), payload, START_MS)?;
    }

    let gateway = Arc::new(SimulatedGateway {
        remote: Arc::clone(&remote),
        rng: Mutex::new(StdRng::seed_from_u64(options.seed.wrapping_add(1))),
        drop_rate: options.drop_rate,
    });
    let store = Arc::new(MemoryLocalStore::new());
    let clock = Arc::new(ManualClock::new(START_MS));
    let cache = Arc::new(CacheStore::with_clock(
        CacheConfig::new(),
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    let config = EngineConfig::new()
        .with_request_timeout(Duration::from_secs(5))
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(2))
                .with_max_delay(Duration::from_millis(20)),
        );

    let engine = SyncEngine::new(config, gateway, Arc::clone(&store), cache, settings)?;
    engine.register_scope(scope.clone());
    engine.register_merger(
        scope.clone(),
        Arc::new(FieldMerger::new().with_atomic_group(["numbers", "bonus"])),
    );
    info!(
        policy = %policy,
        records = options.records,
        cycles = options.cycles,
        "simulation started"
    );

    let mut cycles = Vec::new();
    for cycle in 1..=options.cycles {
        let now = clock.now_ms();
        let mut local_edits = 0;
        let mut remote_edits = 0;

        for draw in 1..=options.records {
            let id = RecordId::from(u64::from(draw));
            if rng.gen_bool(options.edit_rate) {
                if let Some(local) = store.get(&scope, &id)? {
                    if !local.record.deleted {
                        let payload = device_edit(local.record.payload, cycle);
                        engine.record_local_change(&scope, &id, Some(payload))?;
                        local_edits += 1;
                    }
                }
            }
            if rng.gen_bool(options.edit_rate) {
                let payload = correction(&mut rng, draw);
                // remote clocks drift either side of ours
                let modified_at = now - 30_000 + rng.gen_range(0..60_000);
                remote.put(&scope, id, payload, modified_at)?;
                remote_edits += 1;
            }
        }

        let result = engine.run_cycle(&scope).await;

        let mut decided = 0;
        if let Some(choice) = options.decide {
            for conflict in engine.pending_conflicts() {
                if engine.resolve_conflict(conflict.id, choice) {
                    decided += 1;
                }
            }
        }

        cycles.push(CycleReport {
            cycle,
            local_edits,
            remote_edits,
            success: result.success,
            applied: result.applied.len(),
            pushed: result.pushed.len(),
            conflicts: result.conflicts.len(),
            decided,
            errors: result.errors,
        });
        clock.advance(Duration::from_secs(60));
    }

    if let Some(path) = &options.snapshot {
        let saved = engine.cache().save_snapshot(path)?;
        info!(path = %path.display(), entries = saved, "cache snapshot written");
    }

    let mut diverged = Vec::new();
    for draw in 1..=options.records {
        let id = RecordId::from(u64::from(draw));
        let local = store.get(&scope, &id)?.map(|t| t.record);
        let remote = remote.get(&scope, &id);
        let same = match (&local, &remote) {
            (Some(l), Some(r)) => l.same_content(r),
            _ => false,
        };
        if !same {
            diverged.push(id.to_string());
        }
    }

    let stats = engine.cache().stats();
    Ok(SimulationReport {
        policy: policy.to_string(),
        cycles,
        status: engine.status(),
        metrics: engine.metrics(),
        cache: CacheSummary {
            entries: stats.total_entries,
            hits: stats.hit_count,
            misses: stats.miss_count,
            size_bytes: stats.total_size_bytes,
        },
        diverged,
    })
}

fn pick_numbers(rng: &mut StdRng) -> Vec<u32> {
    let mut numbers: Vec<u32> = rand::seq::index::sample(rng, 49, 6)
        .into_iter()
        .map(|n| n as u32 + 1)
        .collect();
    numbers.sort_unstable();
    numbers
}

fn draw_payload(rng: &mut StdRng, draw: u32) -> Value {
    json!({
        "draw": draw,
        "numbers": pick_numbers(rng),
        "bonus": rng.gen_range(1..=10),
        "jackpot": rng.gen_range(1..=50u64) * 1_000_000,
    })
}

/// An official correction of the winning numbers.
fn correction(rng: &mut StdRng, draw: u32) -> Value {
    json!({
        "draw": draw,
        "numbers": pick_numbers(rng),
        "bonus": rng.gen_range(1..=10),
    })
}

/// A device-side annotation.
fn device_edit(mut payload: Value, cycle: u32) -> Value {
    if let Some(fields) = payload.as_object_mut() {
        fields.insert("note".into(), json!(format!("checked in cycle {cycle}")));
        fields.insert("favorite".into(), json!(cycle % 2 == 0));
    }
    payload
}

fn print_text_output(report: &SimulationReport) {
    println!("DrawSync simulation ({})", report.policy);
    println!("=============================");
    println!();

    for cycle in &report.cycles {
        println!(
            "Cycle {:>3}: {}  local edits {:>2}  remote edits {:>2}  applied {:>2}  pushed {:>2}  conflicts {:>2}{}",
            cycle.cycle,
            if cycle.success { "ok    " } else { "FAILED" },
            cycle.local_edits,
            cycle.remote_edits,
            cycle.applied,
            cycle.pushed,
            cycle.conflicts,
            if cycle.decided > 0 {
                format!("  decided {}", cycle.decided)
            } else {
                String::new()
            },
        );
        for error in &cycle.errors {
            println!("           error: {error}");
        }
    }

    let status = &report.status;
    println!();
    println!("Status:");
    println!("  Online:            {}", status.is_online);
    println!("  Pending changes:   {}", status.pending_changes);
    println!("  Conflicts:         {}", status.conflicts_detected);
    println!("  Data integrity:    {}", status.data_integrity.as_str());
    println!("  Sync errors:       {}", status.sync_errors.len());

    let metrics = &report.metrics;
    println!();
    println!("Metrics:");
    println!("  Total syncs:       {}", metrics.total_syncs);
    println!("  Successful:        {}", metrics.successful_syncs);
    println!("  Failed:            {}", metrics.failed_syncs);
    println!("  Avg duration:      {:.2} ms", metrics.average_sync_duration_ms);
    println!("  Health score:      {}", metrics.health_score);

    println!();
    println!("Cache:");
    println!("  Entries:           {}", report.cache.entries);
    println!("  Size:              {} bytes", report.cache.size_bytes);

    println!();
    if report.diverged.is_empty() {
        println!("All records converged.");
    } else {
        println!("Diverged records: {}", report.diverged.join(", "));
    }
}
