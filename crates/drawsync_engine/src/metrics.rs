//! Sync metrics and the derived health score.
//!
//! Counters only grow until an operator calls
//! [`SyncMetrics::reset`].

use crate::status::DataIntegrity;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Health score lost per conflict awaiting a decision.
pub const CONFLICT_PENALTY: f64 = 5.0;
/// Health score lost per reported sync error.
pub const ERROR_PENALTY: f64 = 10.0;

/// Cumulative cycle counters.
///
/// All counters are atomic and can be read while cycles run.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    total_syncs: AtomicU64,
    successful_syncs: AtomicU64,
    failed_syncs: AtomicU64,
    total_duration_micros: AtomicU64,
}

impl SyncMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores counters from a persisted snapshot.
    pub fn from_snapshot(snapshot: &MetricsSnapshot) -> Self {
        let total_micros =
            snapshot.average_sync_duration_ms * 1000.0 * snapshot.total_syncs as f64;
        Self {
            total_syncs: AtomicU64::new(snapshot.total_syncs),
            successful_syncs: AtomicU64::new(snapshot.successful_syncs),
            failed_syncs: AtomicU64::new(snapshot.failed_syncs),
            total_duration_micros: AtomicU64::new(total_micros.round() as u64),
        }
    }

    /// Records a finished cycle.
    pub(crate) fn record_cycle(&self, success: bool, duration: Duration) {
        self.total_syncs.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_syncs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_syncs.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.total_syncs.store(0, Ordering::Relaxed);
        self.successful_syncs.store(0, Ordering::Relaxed);
        self.failed_syncs.store(0, Ordering::Relaxed);
        self.total_duration_micros.store(0, Ordering::Relaxed);
    }

    /// Takes a snapshot, scoring health against the current conflict and
    /// error counts.
    pub fn snapshot(&self, pending_conflicts: usize, sync_errors: usize) -> MetricsSnapshot {
        let total_syncs = self.total_syncs.load(Ordering::Relaxed);
        let successful_syncs = self.successful_syncs.load(Ordering::Relaxed);
        let failed_syncs = self.failed_syncs.load(Ordering::Relaxed);
        let total_micros = self.total_duration_micros.load(Ordering::Relaxed);

        let average_sync_duration_ms = if total_syncs == 0 {
            0.0
        } else {
            total_micros as f64 / total_syncs as f64 / 1000.0
        };

        MetricsSnapshot {
            total_syncs,
            successful_syncs,
            failed_syncs,
            average_sync_duration_ms,
            health_score: health_score(
                successful_syncs,
                total_syncs,
                pending_conflicts,
                sync_errors,
            ),
        }
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Cycles run.
    pub total_syncs: u64,
    /// Cycles that finished without errors.
    pub successful_syncs: u64,
    /// Cycles that aborted or reported errors.
    pub failed_syncs: u64,
    /// Mean cycle duration in milliseconds.
    pub average_sync_duration_ms: f64,
    /// Derived health in `0..=100`.
    pub health_score: u8,
}

impl MetricsSnapshot {
    /// Mean cycle duration.
    pub fn average_sync_duration(&self) -> Duration {
        Duration::from_secs_f64(self.average_sync_duration_ms.max(0.0) / 1000.0)
    }
}

/// Computes the health score.
///
/// `100 * successful / max(total, 1)`, minus [`CONFLICT_PENALTY`] per
/// pending conflict and [`ERROR_PENALTY`] per sync error, clamped to
/// `0..=100`. With no recorded cycles the score is 0.
pub fn health_score(
    successful: u64,
    total: u64,
    pending_conflicts: usize,
    sync_errors: usize,
) -> u8 {
    let success_rate = 100.0 * successful as f64 / total.max(1) as f64;
    let penalty =
        CONFLICT_PENALTY * pending_conflicts as f64 + ERROR_PENALTY * sync_errors as f64;
    (success_rate - penalty).clamp(0.0, 100.0).round() as u8
}

/// Maps a health score and the pending conflict count to [`DataIntegrity`].
pub fn data_integrity(health_score: u8, pending_conflicts: usize) -> DataIntegrity {
    if health_score >= 90 && pending_conflicts == 0 {
        DataIntegrity::Healthy
    } else if health_score >= 60 || pending_conflicts > 0 {
        DataIntegrity::Warning
    } else {
        DataIntegrity::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fresh_metrics_score_zero() {
        let metrics = SyncMetrics::new();
        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.total_syncs, 0);
        assert_eq!(snapshot.health_score, 0);
        assert_eq!(data_integrity(snapshot.health_score, 0), DataIntegrity::Error);

        metrics.record_cycle(true, Duration::from_millis(10));
        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.health_score, 100);
        assert_eq!(data_integrity(snapshot.health_score, 0), DataIntegrity::Healthy);
    }

    #[test]
    fn average_duration_is_cumulative() {
        let metrics = SyncMetrics::new();
        metrics.record_cycle(true, Duration::from_millis(100));
        metrics.record_cycle(false, Duration::from_millis(300));

        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.total_syncs, 2);
        assert_eq!(snapshot.successful_syncs, 1);
        assert_eq!(snapshot.failed_syncs, 1);
        assert!((snapshot.average_sync_duration_ms - 200.0).abs() < 1e-6);
        assert_eq!(snapshot.health_score, 50);
    }

    #[test]
    fn three_errors_after_a_failed_first_cycle_is_error() {
        let metrics = SyncMetrics::new();
        metrics.record_cycle(false, Duration::from_millis(5));
        let snapshot = metrics.snapshot(0, 3);
        assert_eq!(snapshot.health_score, 0);
        assert_eq!(data_integrity(snapshot.health_score, 0), DataIntegrity::Error);
    }

    #[test]
    fn pending_conflict_downgrades_to_warning() {
        let score = health_score(10, 10, 1, 0);
        assert_eq!(score, 95);
        assert_eq!(data_integrity(score, 1), DataIntegrity::Warning);
        // conflicts keep a low score at warning, not error
        assert_eq!(data_integrity(10, 1), DataIntegrity::Warning);
    }

    #[test]
    fn reset_zeroes_counters() {
        let metrics = SyncMetrics::new();
        metrics.record_cycle(true, Duration::from_millis(10));
        metrics.reset();
        assert_eq!(metrics.snapshot(0, 0), MetricsSnapshot::default());
    }

    #[test]
    fn snapshot_restores() {
        let metrics = SyncMetrics::new();
        metrics.record_cycle(true, Duration::from_millis(40));
        metrics.record_cycle(true, Duration::from_millis(60));
        let snapshot = metrics.snapshot(0, 0);

        let text = serde_json::to_string(&snapshot).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&text).unwrap();
        let restored = SyncMetrics::from_snapshot(&back).snapshot(0, 0);
        assert_eq!(restored, snapshot);
        assert!((restored.average_sync_duration().as_secs_f64() - 0.05).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn health_score_is_bounded(
            total in 0u64..1000,
            successful_ratio in 0.0f64..=1.0,
            conflicts in 0usize..50,
            errors in 0usize..50,
        ) {
            let successful = (total as f64 * successful_ratio) as u64;
            let score = health_score(successful, total, conflicts, errors);
            prop_assert!(score <= 100);

            let integrity = data_integrity(score, conflicts);
            if integrity == DataIntegrity::Healthy {
                prop_assert!(score >= 90 && conflicts == 0);
            }
        }
    }
}
