//! Configuration passed explicitly to every component at construction.

use std::time::Duration;

/// Retention bounds for the per-document operation log.
#[derive(Debug, Clone)]
pub struct OpLogConfig {
    /// Maximum ops retained per document (default: 100)
    pub max_entries: usize,
    /// Age after which a retained op expires (default: 60 minutes)
    pub ttl: Duration,
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Retry and timeout policy for downstream calls (persist, unarchive).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 3)
    pub max_retries: u32,
    /// Bounded wait per attempt (default: 5s)
    pub attempt_timeout: Duration,
    /// First backoff delay, doubled per retry (default: 100ms)
    pub initial_backoff: Duration,
    /// Backoff ceiling (default: 2s)
    pub max_backoff: Duration,
    /// Upper bound of the random delay before retrying a write conflict (default: 100ms)
    pub conflict_backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            conflict_backoff_max: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Batching thresholds for history flushes.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Doc ops per track-changes flush (default: 100)
    pub doc_history_threshold: u64,
    /// Project ops per project-history flush (default: 500)
    pub project_history_threshold: u64,
    /// Unflushed age after which reads force a flush (default: 5 minutes)
    pub max_unflushed_age: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            doc_history_threshold: 100,
            project_history_threshold: 500,
            max_unflushed_age: Duration::from_secs(5 * 60),
        }
    }
}

/// Top-level updater configuration.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Max JSON-serialised length of a document's lines (default: 2MB)
    pub max_doc_length: usize,
    /// Max JSON-serialised size of a document's ranges (default: 3MB)
    pub max_ranges_size: usize,
    /// Operation log retention
    pub op_log: OpLogConfig,
    /// History flush thresholds
    pub flush: FlushConfig,
    /// Downstream retry policy
    pub retry: RetryPolicy,
    /// Applied-ops channel capacity (messages buffered per subscriber)
    pub broadcast_capacity: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            max_doc_length: 2 * 1024 * 1024, // 2MB
            max_ranges_size: 3 * 1024 * 1024, // 3MB
            op_log: OpLogConfig::default(),
            flush: FlushConfig::default(),
            retry: RetryPolicy::default(),
            broadcast_capacity: 1024,
        }
    }
}

impl UpdaterConfig {
    /// Create config for testing (short timeouts, fast backoff).
    pub fn for_testing() -> Self {
        Self {
            retry: RetryPolicy {
                max_retries: 2,
                attempt_timeout: Duration::from_millis(200),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                conflict_backoff_max: Duration::from_millis(5),
            },
            broadcast_capacity: 256,
            ..Self::default()
        }
    }
}
