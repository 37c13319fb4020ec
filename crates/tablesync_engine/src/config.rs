//! Configuration for the sync engine.

use std::time::Duration;

/// How the outbound replicator treats errors the remote marks as permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Every failure counts toward `max_attempts`, whatever its cause.
    #[default]
    RetryAll,
    /// Non-retryable remote errors (validation, conflict) evict the action
    /// on the first failure instead of spending the retry budget.
    SkipNonRetryable,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Prefix of the persistence keys, so several engines can share a store.
    pub namespace: String,
    /// Failed attempts after which a pending action is evicted.
    pub max_attempts: u32,
    /// Interval of the periodic sync timer.
    pub sync_interval: Duration,
    /// Backoff for realtime subscription reconnects.
    pub reconnect: BackoffConfig,
    /// Treatment of permanent remote errors.
    pub retry_policy: RetryPolicy,
    /// Tables subscribed to when the engine starts.
    pub watched_tables: Vec<String>,
    /// Maximum number of cached records; `None` means unbounded.
    pub max_cache_entries: Option<usize>,
    /// Network state assumed before the first OS signal arrives.
    pub initially_online: bool,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            max_attempts: 3,
            sync_interval: Duration::from_secs(30),
            reconnect: BackoffConfig::default(),
            retry_policy: RetryPolicy::default(),
            watched_tables: Vec::new(),
            max_cache_entries: None,
            initially_online: true,
        }
    }

    /// Sets the maximum number of attempts per action.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the periodic sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect = backoff;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Adds a table to subscribe to on start.
    pub fn watch(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        if !self.watched_tables.contains(&table) {
            self.watched_tables.push(table);
        }
        self
    }

    /// Bounds the local cache.
    pub fn with_max_cache_entries(mut self, max: usize) -> Self {
        self.max_cache_entries = Some(max);
        self
    }

    /// Sets the network state assumed at construction.
    pub fn initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }

    /// Persistence key of the pending log.
    pub fn pending_key(&self) -> String {
        format!("{}.pending", self.namespace)
    }

    /// Persistence key of the cache snapshot.
    pub fn cache_key(&self) -> String {
        format!("{}.cache", self.namespace)
    }

    /// Persistence key of the failed-action list.
    pub fn failed_key(&self) -> String {
        format!("{}.failed", self.namespace)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("tablesync")
    }
}

/// Configuration for reconnect backoff.
///
/// The delay before reconnect attempt `n` (0-indexed) is
/// `min(base_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound of any single delay.
    pub max_delay: Duration,
    /// Reconnect attempts before giving up.
    pub max_attempts: u32,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Creates a configuration that never reconnects.
    pub fn no_retry() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 0,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Calculates the delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Returns every delay of a full reconnect cycle, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}
