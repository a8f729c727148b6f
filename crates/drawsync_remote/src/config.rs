//! Remote store configuration.

/// Limits applied by [`RemoteStore`](crate::RemoteStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Maximum changes returned by one pull.
    pub max_pull_batch: usize,
    /// Maximum records accepted by one push.
    pub max_push_batch: usize,
}

impl RemoteConfig {
    /// Creates a configuration with the default limits.
    pub fn new() -> Self {
        Self {
            max_pull_batch: 100,
            max_push_batch: 100,
        }
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: usize) -> Self {
        self.max_pull_batch = size.max(1);
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size.max(1);
        self
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::new()
    }
}
