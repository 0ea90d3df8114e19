//! Reconciler: converges the service table to the shadow store.
//!
//! For one key, a convergence pass:
//! 1. Computes `to_add = desired - last_applied` and
//!    `to_remove = last_applied - desired` (ascending address order)
//! 2. Applies every addition before any removal while the desired set is
//!    non-empty, so a service never loses all of its routable entries
//! 3. Records each confirmed write in `last_applied` immediately, so a
//!    partial failure leaves the shadow store matching the table exactly
//! 4. When the desired set is empty, waits out the grace period and then
//!    deletes everything that is left (garbage collection)
//!
//! ## GC State Machine
//!
//! ```text
//! Live --(desired empty)--> Draining --(grace elapsed, deletes ok)--> Reclaimed
//!   ^                          |
//!   +---(desired non-empty)----+
//! ```

use std::sync::Arc;
use std::time::Duration;

use lifter_addr::{BackendAddress, ServiceKey};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::TableError;
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::shadow::{GcState, ShadowEntry, ShadowStore};
use crate::table::ServiceTable;

/// Result of a single convergence pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergeOutcome {
    /// The key is not in the shadow store.
    Absent,

    /// The table now matches desired state.
    Converged { upserts: usize, deletes: usize },

    /// Some writes failed and remain pending.
    Incomplete {
        upserts: usize,
        deletes: usize,
        pending: usize,
    },

    /// Desired set is empty; removal is due after `remaining`.
    Draining { remaining: Duration },

    /// All entries deleted and the shadow entry removed.
    Reclaimed { deletes: usize },
}

impl ConvergeOutcome {
    /// Number of confirmed table writes in this pass.
    pub fn writes(&self) -> usize {
        match self {
            Self::Converged { upserts, deletes } | Self::Incomplete { upserts, deletes, .. } => {
                upserts + deletes
            }
            Self::Reclaimed { deletes } => *deletes,
            Self::Absent | Self::Draining { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ApplyOp {
    Upsert,
    Delete,
}

impl ApplyOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Default)]
struct PassStats {
    upserts: usize,
    deletes: usize,
}

/// Diff and apply engine. One pass per key at a time, enforced by the
/// shadow store's per-key lock.
pub struct Reconciler {
    table: Arc<dyn ServiceTable>,
    shadow: Arc<ShadowStore>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        table: Arc<dyn ServiceTable>,
        shadow: Arc<ShadowStore>,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            table,
            shadow,
            retry,
            metrics,
        }
    }

    pub fn shadow(&self) -> &Arc<ShadowStore> {
        &self.shadow
    }

    pub fn table(&self) -> &Arc<dyn ServiceTable> {
        &self.table
    }

    /// Run one convergence pass for `key`.
    pub async fn converge(&self, key: ServiceKey) -> ConvergeOutcome {
        let Some(slot) = self.shadow.slot(key).await else {
            return ConvergeOutcome::Absent;
        };
        let mut entry = slot.lock().await;
        if entry.reclaimed {
            return ConvergeOutcome::Absent;
        }

        let gc = entry.gc;
        match gc {
            GcState::Live if entry.desired.is_empty() => {
                // Desired became empty without passing through observe.
                let deadline = Instant::now() + self.shadow.grace_period();
                entry.gc = GcState::Draining { deadline };
                ConvergeOutcome::Draining {
                    remaining: self.shadow.grace_period(),
                }
            }
            GcState::Live => self.converge_live(&mut entry).await,
            GcState::Draining { .. } if !entry.desired.is_empty() => {
                entry.gc = GcState::Live;
                self.converge_live(&mut entry).await
            }
            GcState::Draining { deadline } => {
                let now = Instant::now();
                if now < deadline {
                    return ConvergeOutcome::Draining {
                        remaining: deadline - now,
                    };
                }
                self.reclaim(&mut entry).await
            }
        }
    }

    /// Converge every key in the shadow store, ascending.
    pub async fn converge_all(&self) -> Vec<(ServiceKey, ConvergeOutcome)> {
        let mut outcomes = Vec::new();
        for key in self.shadow.keys().await {
            outcomes.push((key, self.converge(key).await));
        }
        outcomes
    }

    async fn converge_live(&self, entry: &mut ShadowEntry) -> ConvergeOutcome {
        let mut stats = PassStats::default();

        let capacity_blocked = self.add_missing(entry, &mut stats).await;
        let removed = self.remove_extra(entry, &mut stats).await;

        if capacity_blocked && removed > 0 {
            debug!(
                service_key = %entry.key,
                freed = removed,
                "retrying additions after removals freed capacity"
            );
            self.add_missing(entry, &mut stats).await;
        }

        let pending = entry.desired.missing_from(&entry.last_applied).len()
            + entry.last_applied.missing_from(&entry.desired).len();

        if stats.upserts + stats.deletes > 0 || pending > 0 {
            info!(
                service_key = %entry.key,
                version = entry.version,
                upserts = stats.upserts,
                deletes = stats.deletes,
                pending,
                applied = %entry.last_applied,
                "convergence pass applied"
            );
        }

        if pending == 0 {
            ConvergeOutcome::Converged {
                upserts: stats.upserts,
                deletes: stats.deletes,
            }
        } else {
            self.metrics.record_incomplete();
            ConvergeOutcome::Incomplete {
                upserts: stats.upserts,
                deletes: stats.deletes,
                pending,
            }
        }
    }

    /// Upsert desired addresses not yet in the table. Returns true if any
    /// addition was refused for capacity.
    async fn add_missing(&self, entry: &mut ShadowEntry, stats: &mut PassStats) -> bool {
        let mut capacity_blocked = false;

        for backend in entry.desired.missing_from(&entry.last_applied) {
            match self.apply(ApplyOp::Upsert, entry.key, backend).await {
                Ok(()) => {
                    entry.last_applied.insert(backend);
                    stats.upserts += 1;
                }
                Err(TableError::CapacityExceeded { .. }) => capacity_blocked = true,
                Err(_) => {}
            }
        }

        capacity_blocked
    }

    /// Delete table addresses no longer desired. Returns the number removed.
    async fn remove_extra(&self, entry: &mut ShadowEntry, stats: &mut PassStats) -> usize {
        let to_remove = entry.last_applied.missing_from(&entry.desired);
        if to_remove.is_empty() {
            return 0;
        }

        if !entry.desired.overlaps(&entry.last_applied) {
            debug!(
                service_key = %entry.key,
                deferred = to_remove.len(),
                "no desired backend confirmed yet, deferring removals"
            );
            return 0;
        }

        let mut removed = 0;
        for backend in to_remove {
            if self.apply(ApplyOp::Delete, entry.key, backend).await.is_ok() {
                entry.last_applied.remove(&backend);
                removed += 1;
            }
        }
        stats.deletes += removed;
        removed
    }

    async fn reclaim(&self, entry: &mut ShadowEntry) -> ConvergeOutcome {
        let mut deletes = 0;
        for backend in entry.last_applied.missing_from(&entry.desired) {
            if self.apply(ApplyOp::Delete, entry.key, backend).await.is_ok() {
                entry.last_applied.remove(&backend);
                deletes += 1;
            }
        }

        if !entry.last_applied.is_empty() {
            self.metrics.record_incomplete();
            return ConvergeOutcome::Incomplete {
                upserts: 0,
                deletes,
                pending: entry.last_applied.len(),
            };
        }

        self.shadow.detach(entry).await;
        self.metrics.record_reclaimed();
        info!(
            service_key = %entry.key,
            version = entry.version,
            deletes,
            "service key reclaimed"
        );

        ConvergeOutcome::Reclaimed { deletes }
    }

    /// Apply one per-address write with bounded, time-limited retries.
    async fn apply(
        &self,
        op: ApplyOp,
        key: ServiceKey,
        backend: BackendAddress,
    ) -> Result<(), TableError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let call = async {
                match op {
                    ApplyOp::Upsert => self.table.upsert(key, backend).await,
                    ApplyOp::Delete => self.table.delete(key, backend).await,
                }
            };
            let result = match tokio::time::timeout(self.retry.attempt_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(TableError::Transient(format!(
                    "{} timed out after {:?}",
                    op.as_str(),
                    self.retry.attempt_timeout
                ))),
            };

            let err = match result {
                Ok(()) => {
                    match op {
                        ApplyOp::Upsert => self.metrics.record_upsert(),
                        ApplyOp::Delete => self.metrics.record_delete(),
                    }
                    debug!(service_key = %key, backend = %backend, op = op.as_str(), "table write applied");
                    return Ok(());
                }
                Err(err) => err,
            };

            self.metrics.record_failure(err.kind());
            attempt += 1;

            if !err.is_retryable() || attempt >= max_attempts {
                warn!(
                    service_key = %key,
                    backend = %backend,
                    op = op.as_str(),
                    attempts = attempt,
                    error = %err,
                    "table write left pending"
                );
                return Err(err);
            }

            let delay = self.retry.backoff.delay(attempt - 1);
            debug!(
                service_key = %key,
                backend = %backend,
                op = op.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying table write"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;
    use crate::shadow::Observation;
    use crate::table::{MemoryTable, TableOp};
    use lifter_addr::BackendSet;

    fn key(s: &str) -> ServiceKey {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> BackendAddress {
        s.parse().unwrap()
    }

    fn set(addrs: &[&str]) -> BackendSet {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            attempt_timeout: Duration::from_millis(500),
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(4),
                jitter: 0.0,
            },
        }
    }

    fn setup(capacity: usize, grace: Duration) -> (Arc<MemoryTable>, Reconciler) {
        let metrics = Arc::new(Metrics::new());
        let table = Arc::new(MemoryTable::new(capacity));
        let shadow = Arc::new(ShadowStore::new(grace, Arc::clone(&metrics)));
        let reconciler = Reconciler::new(
            Arc::clone(&table) as Arc<dyn ServiceTable>,
            shadow,
            fast_retry(3),
            metrics,
        );
        (table, reconciler)
    }

    #[tokio::test]
    async fn test_absent_key() {
        let (_, reconciler) = setup(8, Duration::from_secs(1));
        assert_eq!(reconciler.converge(key("10.96.0.1")).await, ConvergeOutcome::Absent);
    }

    #[tokio::test]
    async fn test_additions_precede_removals() {
        let (table, reconciler) = setup(8, Duration::from_secs(1));
        let k = key("10.96.0.1");

        reconciler.shadow().observe(k, set(&["10.0.0.1", "10.0.0.2"]), None).await;
        reconciler.converge(k).await;
        table.clear_ops();

        reconciler.shadow().observe(k, set(&["10.0.0.3", "10.0.0.4"]), None).await;
        let outcome = reconciler.converge(k).await;
        assert_eq!(outcome, ConvergeOutcome::Converged { upserts: 2, deletes: 2 });
        assert_eq!(
            table.ops(),
            vec![
                TableOp::Upsert(k, addr("10.0.0.3")),
                TableOp::Upsert(k, addr("10.0.0.4")),
                TableOp::Delete(k, addr("10.0.0.1")),
                TableOp::Delete(k, addr("10.0.0.2")),
            ]
        );
    }

    #[tokio::test]
    async fn test_converged_key_issues_no_writes() {
        let (table, reconciler) = setup(8, Duration::from_secs(1));
        let k = key("10.96.0.1");

        reconciler.shadow().observe(k, set(&["10.0.0.1"]), None).await;
        reconciler.converge(k).await;
        table.clear_ops();

        assert_eq!(
            reconciler.converge(k).await,
            ConvergeOutcome::Converged { upserts: 0, deletes: 0 }
        );
        assert_eq!(table.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let (table, reconciler) = setup(8, Duration::from_secs(1));
        let k = key("10.96.0.1");
        table.fail_pair(k, addr("10.0.0.1"), 2);

        reconciler.shadow().observe(k, set(&["10.0.0.1"]), None).await;
        assert_eq!(
            reconciler.converge(k).await,
            ConvergeOutcome::Converged { upserts: 1, deletes: 0 }
        );
        assert_eq!(table.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_leave_pair_pending() {
        let (table, reconciler) = setup(8, Duration::from_secs(1));
        let k = key("10.96.0.1");
        table.fail_pair(k, addr("10.0.0.2"), 3);

        reconciler.shadow().observe(k, set(&["10.0.0.1", "10.0.0.2"]), None).await;
        assert_eq!(
            reconciler.converge(k).await,
            ConvergeOutcome::Incomplete { upserts: 1, deletes: 0, pending: 1 }
        );

        let entry = reconciler.shadow().get(k).await.unwrap();
        assert_eq!(entry.last_applied, set(&["10.0.0.1"]));
        assert_eq!(table.backends_for(k), entry.last_applied);

        // Next trigger picks the pending address back up.
        assert_eq!(
            reconciler.converge(k).await,
            ConvergeOutcome::Converged { upserts: 1, deletes: 0 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_table_write_times_out() {
        let (table, reconciler) = setup(8, Duration::from_secs(1));
        let k = key("10.96.0.1");
        table.set_latency(Duration::from_secs(5));

        reconciler.shadow().observe(k, set(&["10.0.0.1"]), None).await;
        assert!(matches!(
            reconciler.converge(k).await,
            ConvergeOutcome::Incomplete { pending: 1, .. }
        ));
        assert!(reconciler.shadow().get(k).await.unwrap().last_applied.is_empty());
    }

    #[tokio::test]
    async fn test_removals_deferred_until_a_desired_backend_lands() {
        let (table, reconciler) = setup(8, Duration::from_secs(1));
        let k = key("10.96.0.1");

        reconciler.shadow().observe(k, set(&["10.0.0.1"]), None).await;
        reconciler.converge(k).await;

        // Replacement backend cannot be written yet.
        table.fail_next(TableError::CapacityExceeded { capacity: 8 });
        reconciler.shadow().observe(k, set(&["10.0.0.2"]), None).await;
        assert!(matches!(
            reconciler.converge(k).await,
            ConvergeOutcome::Incomplete { upserts: 0, deletes: 0, pending: 2 }
        ));
        assert_eq!(table.backends_for(k), set(&["10.0.0.1"]));

        assert_eq!(
            reconciler.converge(k).await,
            ConvergeOutcome::Converged { upserts: 1, deletes: 1 }
        );
    }

    #[tokio::test]
    async fn test_capacity_freed_by_removals_is_reused() {
        let (table, reconciler) = setup(2, Duration::from_secs(1));
        let k = key("10.96.0.1");

        reconciler.shadow().observe(k, set(&["10.0.0.1", "10.0.0.2"]), None).await;
        reconciler.converge(k).await;

        reconciler.shadow().observe(k, set(&["10.0.0.2", "10.0.0.3"]), None).await;
        assert_eq!(
            reconciler.converge(k).await,
            ConvergeOutcome::Converged { upserts: 1, deletes: 1 }
        );
        assert_eq!(table.backends_for(k), set(&["10.0.0.2", "10.0.0.3"]));
        assert_eq!(reconciler.metrics.snapshot().failures_capacity, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_waits_for_grace_period() {
        let grace = Duration::from_secs(30);
        let (table, reconciler) = setup(8, grace);
        let k = key("10.96.0.1");

        reconciler.shadow().observe(k, set(&["10.0.0.1"]), None).await;
        reconciler.converge(k).await;

        reconciler.shadow().observe(k, BackendSet::new(), None).await;
        assert_eq!(reconciler.converge(k).await, ConvergeOutcome::Draining { remaining: grace });
        assert!(table.contains_key(k));

        tokio::time::advance(grace).await;
        assert_eq!(reconciler.converge(k).await, ConvergeOutcome::Reclaimed { deletes: 1 });
        assert!(!table.contains_key(k));
        assert!(reconciler.shadow().get(k).await.is_none());
        assert_eq!(reconciler.converge(k).await, ConvergeOutcome::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reclaim_keeps_entry() {
        let grace = Duration::from_secs(5);
        let (table, reconciler) = setup(8, grace);
        let k = key("10.96.0.1");

        reconciler.shadow().observe(k, set(&["10.0.0.1"]), None).await;
        reconciler.converge(k).await;
        reconciler.shadow().observe(k, BackendSet::new(), None).await;
        tokio::time::advance(grace).await;

        table.fail_pair(k, addr("10.0.0.1"), 3);
        assert!(matches!(
            reconciler.converge(k).await,
            ConvergeOutcome::Incomplete { pending: 1, .. }
        ));
        assert!(reconciler.shadow().get(k).await.is_some());

        assert_eq!(reconciler.converge(k).await, ConvergeOutcome::Reclaimed { deletes: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_delivery_does_not_revive_reclaimed_key() {
        let grace = Duration::from_secs(5);
        let (table, reconciler) = setup(8, grace);
        let k = key("10.96.0.1");

        reconciler.shadow().observe(k, set(&["10.0.0.1"]), Some(1)).await;
        reconciler.converge(k).await;
        reconciler.shadow().observe(k, BackendSet::new(), Some(2)).await;
        tokio::time::advance(grace).await;
        assert_eq!(reconciler.converge(k).await, ConvergeOutcome::Reclaimed { deletes: 1 });

        let obs = reconciler.shadow().observe(k, set(&["10.0.0.1"]), Some(1)).await;
        assert_eq!(obs, Observation::Stale);
        assert_eq!(reconciler.converge(k).await, ConvergeOutcome::Absent);
        assert!(!table.contains_key(k));

        // A genuinely newer assertion brings the service back.
        let obs = reconciler.shadow().observe(k, set(&["10.0.0.2"]), Some(3)).await;
        assert!(obs.is_applied());
        assert_eq!(
            reconciler.converge(k).await,
            ConvergeOutcome::Converged { upserts: 1, deletes: 0 }
        );
    }
}
