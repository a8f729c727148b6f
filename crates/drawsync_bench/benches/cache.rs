//! Cache store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use drawsync_bench::random_draw;
use drawsync_cache::{CacheConfig, CacheStore, ManualClock};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(60);

fn filled_store(count: usize) -> (CacheStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let store = CacheStore::with_clock(CacheConfig::new(), Arc::clone(&clock));
    for i in 0..count {
        store
            .set(&format!("draws/{i}"), &random_draw(i as u64), TTL)
            .unwrap();
    }
    (store, clock)
}

/// Benchmark writes.
fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("draw_record", |b| {
        let store = CacheStore::new(CacheConfig::new());
        let value = random_draw(1);
        let mut i = 0u64;
        b.iter(|| {
            store
                .set(&format!("draws/{}", i % 1_000), black_box(&value), TTL)
                .unwrap();
            i += 1;
        });
    });

    group.bench_function("with_eviction", |b| {
        let store = CacheStore::new(CacheConfig::new().with_max_bytes(16 * 1024));
        let value = random_draw(1);
        let mut i = 0u64;
        b.iter(|| {
            store
                .set(&format!("draws/{i}"), black_box(&value), TTL)
                .unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark reads.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get");

    for count in [100, 10_000] {
        let (store, _clock) = filled_store(count);
        group.bench_with_input(BenchmarkId::new("hit", count), &count, |b, &count| {
            let mut i = 0usize;
            b.iter(|| {
                let value: Option<Value> = store.get(&format!("draws/{}", i % count));
                i += 1;
                black_box(value);
            });
        });
    }

    let (store, _clock) = filled_store(100);
    group.bench_function("miss", |b| {
        b.iter(|| {
            let value: Option<Value> = store.get(black_box("draws/absent"));
            black_box(value);
        });
    });

    group.finish();
}

/// Benchmark expiry sweeps.
fn bench_cleanup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_cleanup");

    for count in [1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("all_expired", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let (store, clock) = filled_store(count);
                    clock.advance(TTL);
                    store
                },
                |store| black_box(store.cleanup()),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark snapshot persistence.
fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_snapshot");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.cbor");
    let (store, _clock) = filled_store(1_000);

    group.bench_function("save_1000", |b| {
        b.iter(|| black_box(store.save_snapshot(&path).unwrap()));
    });

    store.save_snapshot(&path).unwrap();
    group.bench_function("load_1000", |b| {
        b.iter(|| black_box(store.load_snapshot(&path).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_set, bench_get, bench_cleanup, bench_snapshot);

criterion_main!(benches);
