//! Sync cycle benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use drawsync_bench::remote_draws;
use drawsync_cache::{CacheConfig, CacheStore};
use drawsync_engine::{
    EngineConfig, MemoryLocalStore, MockGateway, MockReply, SyncEngine, SyncSettings,
};
use drawsync_protocol::{Cursor, PullResponse, RecordId, RemoteChange, Scope};
use serde_json::json;
use std::sync::Arc;

type BenchEngine = SyncEngine<Arc<MockGateway>, Arc<MemoryLocalStore>>;

fn engine_with_pull(count: usize) -> BenchEngine {
    let gateway = Arc::new(MockGateway::new());
    let changes: Vec<RemoteChange> = remote_draws(count)
        .into_iter()
        .enumerate()
        .map(|(i, record)| RemoteChange {
            sequence: i as u64 + 1,
            record,
        })
        .collect();
    gateway.push_pull_reply(MockReply::Respond(PullResponse::new(
        changes,
        Cursor(count as u64),
    )));

    let engine = SyncEngine::new(
        EngineConfig::new(),
        gateway,
        Arc::new(MemoryLocalStore::new()),
        Arc::new(CacheStore::new(CacheConfig::new())),
        SyncSettings::default(),
    )
    .unwrap();
    engine.register_scope(Scope::new("draws"));
    engine
}

/// Benchmark a cycle applying pulled records.
fn bench_pull_cycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("cycle_pull");

    for count in [10, 100, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || engine_with_pull(count),
                |engine| runtime.block_on(engine.run_cycle(&Scope::new("draws"))),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark a cycle pushing local edits.
fn bench_push_cycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("cycle_push");
    let scope = Scope::new("draws");

    for count in [10, 100] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let engine = engine_with_pull(0);
                    for i in 0..count as u64 {
                        engine
                            .record_local_change(&scope, &RecordId::from(i), Some(json!({"n": i})))
                            .unwrap();
                    }
                    engine
                },
                |engine| runtime.block_on(engine.run_cycle(&scope)),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pull_cycle, bench_push_cycle);

criterion_main!(benches);
