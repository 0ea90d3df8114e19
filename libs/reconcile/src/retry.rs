//! Backoff and retry bookkeeping for table writes.

use std::collections::BTreeMap;
use std::time::Duration;

use lifter_addr::ServiceKey;
use rand::Rng;
use tokio::time::Instant;

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(2),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounds for retrying a single per-address table write within one pass.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per address per convergence pass (at least 1).
    pub max_attempts: u32,

    /// Timeout applied to each individual attempt.
    pub attempt_timeout: Duration,

    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_APPLY_ATTEMPTS,
            attempt_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Tracks keys whose convergence keeps coming back incomplete.
///
/// Used to escalate logging once a key has failed more than `max_failures`
/// passes inside `window`. It never stops a key from being retried.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_failures: u32,
    window: Duration,
    /// key -> (count, first_failure_time)
    failures: BTreeMap<ServiceKey, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record an incomplete pass for a key.
    ///
    /// Returns true exactly once per window: on the pass that crosses the limit.
    pub fn record_failure(&mut self, key: ServiceKey) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count == self.max_failures + 1
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: ServiceKey) {
        self.failures.remove(&key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}
