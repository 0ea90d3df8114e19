//! Reconciliation engine for the lifter service table.
//!
//! Keeps a fixed-capacity, kernel-visible service table consistent with the
//! live membership reported by an event source. Key concepts:
//!
//! - **Desired state**: the backend set the source last asserted for a key,
//!   held in the [`ShadowStore`].
//! - **Applied state**: what has been confirmed written to the table.
//! - **Convergence**: the minimal ordered writes that make applied match
//!   desired ([`Reconciler::converge`]).
//!
//! # Invariants
//!
//! - All table writes are idempotent
//! - A service with live backends never has an empty table entry set
//! - Versions are strictly increasing per key; stale epochs are discarded
//! - A service with no backends is removed only after the grace period
//!
//! # Layout
//!
//! ```text
//! EventSource -> SyncDriver -> Normalizer -> WorkerPool (shard per key)
//!                                               |
//!                                 ShadowStore <-+-> Reconciler -> ServiceTable
//! ```

mod config;
mod driver;
mod engine;
mod error;
mod metrics;
mod normalizer;
mod pool;
mod reconciler;
mod resync;
mod retry;
mod shadow;
mod source;
mod table;

use std::time::Duration;

pub use config::EngineConfig;
pub use driver::SyncDriver;
pub use engine::Engine;
pub use error::{InitError, MalformedEvent, SourceError, TableError, TableErrorKind};
pub use metrics::{Metrics, MetricsSnapshot};
pub use normalizer::{parse_notification, MembershipEvent, Normalizer};
pub use pool::{Pending, PoolHandle, WorkerPool};
pub use reconciler::{ConvergeOutcome, Reconciler};
pub use resync::{resync, ResyncReport};
pub use retry::{BackoffPolicy, RetryPolicy, RetryTracker};
pub use shadow::{GcState, Observation, ShadowEntry, ShadowStatus, ShadowStore};
pub use source::{ChannelEventSource, EventSource, NotificationKind, RawNotification};
pub use table::{group_by_key, MemoryTable, ServiceTable, TableOp};

/// Default grace period before a service with no backends is removed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default interval between full sweeps (matches the source's redelivery).
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of shard workers.
pub const DEFAULT_WORKERS: usize = 8;

/// Default table capacity in `(key, backend)` pairs.
pub const DEFAULT_TABLE_CAPACITY: usize = 512;

/// Default attempts per address per convergence pass.
pub const DEFAULT_MAX_APPLY_ATTEMPTS: u32 = 5;

/// Default time a reclaimed key's epoch is remembered.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(10 * 60);
