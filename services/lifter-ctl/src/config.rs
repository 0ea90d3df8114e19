//! Synchronizer configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use lifter_reconcile::{EngineConfig, RetryPolicy, DEFAULT_TABLE_CAPACITY};

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint feed base URL (example: http://127.0.0.1:8080).
    pub source_url: String,

    /// SQLite file backing the service table.
    pub table_path: PathBuf,

    /// Table capacity in (service key, backend) pairs.
    pub table_capacity: usize,

    /// Feed poll interval when no new events are available.
    pub poll_interval: Duration,

    /// Max events to fetch per poll.
    pub fetch_limit: i64,

    /// Bind address for `/metrics` and `/healthz`. Disabled when unset.
    pub metrics_addr: Option<SocketAddr>,

    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,

    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let source_url = lookup("LIFTER_SOURCE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let table_path = lookup("LIFTER_TABLE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/lifter/svc_table.db"));

        let table_capacity: usize = parse(&lookup, "LIFTER_TABLE_CAPACITY", "an integer")?
            .unwrap_or(DEFAULT_TABLE_CAPACITY);
        if table_capacity == 0 {
            anyhow::bail!("LIFTER_TABLE_CAPACITY must be greater than zero.");
        }

        let defaults = EngineConfig::default();

        let workers: usize =
            parse(&lookup, "LIFTER_WORKERS", "an integer")?.unwrap_or(defaults.workers);

        let grace_period_ms: u64 =
            parse(&lookup, "LIFTER_GRACE_PERIOD_MS", "an integer (milliseconds)")?
                .unwrap_or(defaults.grace_period.as_millis() as u64);

        let resync_interval_secs: u64 =
            parse(&lookup, "LIFTER_RESYNC_INTERVAL_SECS", "an integer (seconds)")?
                .unwrap_or(defaults.resync_interval.as_secs());

        let poll_interval_ms: u64 =
            parse(&lookup, "LIFTER_POLL_INTERVAL_MS", "an integer (milliseconds)")?
                .unwrap_or(1000);
        let poll_interval = Duration::from_millis(poll_interval_ms.max(50));

        let fetch_limit: i64 = parse(&lookup, "LIFTER_FETCH_LIMIT", "an integer")?
            .unwrap_or(200)
            .clamp(1, 1000);

        let max_attempts: u32 = parse(&lookup, "LIFTER_MAX_APPLY_ATTEMPTS", "an integer")?
            .unwrap_or(defaults.retry.max_attempts);

        let apply_timeout_ms: u64 =
            parse(&lookup, "LIFTER_APPLY_TIMEOUT_MS", "an integer (milliseconds)")?
                .unwrap_or(defaults.retry.attempt_timeout.as_millis() as u64);

        let metrics_addr: Option<SocketAddr> =
            parse(&lookup, "LIFTER_METRICS_ADDR", "a socket address (host:port)")?;

        let log_level = lookup("LIFTER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let engine = EngineConfig {
            grace_period: Duration::from_millis(grace_period_ms),
            workers: workers.max(1),
            resync_interval: Duration::from_secs(resync_interval_secs.max(1)),
            retry: RetryPolicy {
                max_attempts: max_attempts.max(1),
                attempt_timeout: Duration::from_millis(apply_timeout_ms.max(1)),
                ..defaults.retry.clone()
            },
            ..defaults
        };

        Ok(Self {
            source_url,
            table_path,
            table_capacity,
            poll_interval,
            fetch_limit,
            metrics_addr,
            log_level,
            engine,
        })
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    expected: &str,
) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {expected}."))
}
