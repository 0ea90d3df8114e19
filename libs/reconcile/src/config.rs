//! Engine configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tunables for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delay before a service with no backends is removed from the table.
    pub grace_period: Duration,

    /// Number of shard workers.
    pub workers: usize,

    /// Interval between full sweeps of every known key.
    pub resync_interval: Duration,

    /// Delay before re-triggering a key whose pass was incomplete.
    pub retry_interval: Duration,

    /// Per-address write retry bounds.
    pub retry: RetryPolicy,

    /// Incomplete passes inside `failure_window` before a key is reported
    /// as stuck.
    pub max_incomplete_passes: u32,

    pub failure_window: Duration,

    /// How long a reclaimed key keeps rejecting older epochs.
    pub tombstone_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_period: crate::DEFAULT_GRACE_PERIOD,
            workers: crate::DEFAULT_WORKERS,
            resync_interval: crate::DEFAULT_RESYNC_INTERVAL,
            retry_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            max_incomplete_passes: 10,
            failure_window: Duration::from_secs(10 * 60), // 10 minutes
            tombstone_retention: crate::DEFAULT_TOMBSTONE_RETENTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.workers, 8);
        assert_eq!(config.retry.max_attempts, 5);
    }
}
