//! Benchmark utilities.

use drawsync_protocol::{Record, TrackedRecord};
use rand::Rng;
use serde_json::{json, Value};

/// Generates a draw payload with random numbers.
pub fn random_draw(draw: u64) -> Value {
    let mut rng = rand::thread_rng();
    let numbers: Vec<u32> = (0..6).map(|_| rng.gen_range(1..=49)).collect();
    json!({
        "draw": draw,
        "numbers": numbers,
        "bonus": rng.gen_range(1..=10),
        "jackpot": rng.gen_range(1..=50u64) * 1_000_000,
    })
}

/// Generates `count` remote draw records at version 1.
pub fn remote_draws(count: usize) -> Vec<Record> {
    (1..=count as u64)
        .map(|draw| Record::remote(draw, random_draw(draw), 1, draw * 1_000))
        .collect()
}

/// A locally edited copy of a synced record and a concurrent remote edit.
pub fn diverged_pair(draw: u64) -> (TrackedRecord, Record) {
    let local = TrackedRecord {
        record: Record::local(draw, random_draw(draw), 2, 2_000),
        base_version: Some(1),
    };
    let remote = Record::remote(draw, random_draw(draw), 2, 3_000);
    (local, remote)
}
