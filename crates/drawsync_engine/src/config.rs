//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use drawsync_protocol::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Static configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry configuration for gateway calls.
    pub retry: RetryConfig,
    /// Timeout for a single pull or push call.
    pub request_timeout: Duration,
    /// Maximum number of cycles running at once across all scopes.
    pub max_concurrent_cycles: usize,
    /// TTL for remote records written to the cache.
    pub cache_ttl: Duration,
    /// Age after which a pending `ask` conflict is reported.
    pub stale_conflict_after: Duration,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
            max_concurrent_cycles: 4,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            stale_conflict_after: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the concurrent cycle limit. Values below one are raised to one.
    pub fn with_max_concurrent_cycles(mut self, max: usize) -> Self {
        self.max_concurrent_cycles = max.max(1);
        self
    }

    /// Sets the cache TTL for remote records.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the staleness threshold for pending conflicts.
    pub fn with_stale_conflict_after(mut self, after: Duration) -> Self {
        self.stale_conflict_after = after;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25% on top
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// User-facing sync preferences.
///
/// Owned by configuration storage outside the engine. The engine snapshots
/// them at the start of each cycle; the scheduler reads them at each
/// evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Whether periodic sync is enabled.
    pub auto_sync: bool,
    /// Minutes between periodic syncs, in `1..=60`.
    pub sync_interval_minutes: u32,
    /// How conflicts are resolved.
    pub conflict_resolution_policy: ConflictPolicy,
    /// Skip periodic syncs on metered connections.
    pub sync_only_on_wifi: bool,
    /// Keep periodic syncs running while the app is in the background.
    pub background_sync: bool,
}

impl SyncSettings {
    /// Smallest accepted interval.
    pub const MIN_INTERVAL_MINUTES: u32 = 1;
    /// Largest accepted interval.
    pub const MAX_INTERVAL_MINUTES: u32 = 60;

    /// Checks value ranges.
    pub fn validate(&self) -> SyncResult<()> {
        if !(Self::MIN_INTERVAL_MINUTES..=Self::MAX_INTERVAL_MINUTES)
            .contains(&self.sync_interval_minutes)
        {
            return Err(SyncError::InvalidSettings(format!(
                "syncIntervalMinutes must be between {} and {}, got {}",
                Self::MIN_INTERVAL_MINUTES,
                Self::MAX_INTERVAL_MINUTES,
                self.sync_interval_minutes
            )));
        }
        Ok(())
    }

    /// Returns the sync interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sync_interval_minutes) * 60)
    }

    /// Parses and validates settings from JSON.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        let settings: SyncSettings = serde_json::from_str(text)
            .map_err(|e| SyncError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads and validates settings from a JSON file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::InvalidSettings(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Applies a partial update, validating the result.
    ///
    /// On error `self` is left unchanged.
    pub fn apply(&mut self, patch: &SettingsPatch) -> SyncResult<()> {
        let mut next = self.clone();
        if let Some(v) = patch.auto_sync {
            next.auto_sync = v;
        }
        if let Some(v) = patch.sync_interval_minutes {
            next.sync_interval_minutes = v;
        }
        if let Some(v) = patch.conflict_resolution_policy {
            next.conflict_resolution_policy = v;
        }
        if let Some(v) = patch.sync_only_on_wifi {
            next.sync_only_on_wifi = v;
        }
        if let Some(v) = patch.background_sync {
            next.background_sync = v;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync: true,
            sync_interval_minutes: 15,
            conflict_resolution_policy: ConflictPolicy::TimestampPriority,
            sync_only_on_wifi: false,
            background_sync: true,
        }
    }
}

/// A partial settings update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    /// New `auto_sync`.
    pub auto_sync: Option<bool>,
    /// New `sync_interval_minutes`.
    pub sync_interval_minutes: Option<u32>,
    /// New conflict policy.
    pub conflict_resolution_policy: Option<ConflictPolicy>,
    /// New `sync_only_on_wifi`.
    pub sync_only_on_wifi: Option<bool>,
    /// New `background_sync`.
    pub background_sync: Option<bool>,
}
