//! Startup resynchronization.
//!
//! Runs once before steady-state processing. Whatever a previous process
//! left in the table is treated as `last_applied`; the source snapshot is
//! treated as desired. Every key where the two disagree is converged before
//! the first incremental event is handled.

use std::collections::{BTreeMap, BTreeSet};

use lifter_addr::{BackendSet, ServiceKey};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::InitError;
use crate::normalizer::{MembershipEvent, Normalizer};
use crate::reconciler::{ConvergeOutcome, Reconciler};
use crate::shadow::GcState;
use crate::source::EventSource;
use crate::table::group_by_key;

/// Summary of a startup resync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Keys found in the table or the snapshot.
    pub keys_seen: usize,

    /// Keys that already matched and needed no writes.
    pub in_sync: usize,

    /// Keys converged (or reclaimed) by this pass.
    pub converged: usize,

    /// Keys with writes still pending.
    pub incomplete: usize,

    /// Keys waiting out the grace period.
    pub draining: usize,

    /// Keys in the table with no counterpart in the snapshot.
    pub orphans: usize,
}

/// Repair drift between the table and the source, and seed the shadow
/// store and normalizer with the result.
pub async fn resync(
    reconciler: &Reconciler,
    source: &dyn EventSource,
    normalizer: &mut Normalizer,
) -> Result<ResyncReport, InitError> {
    let applied = group_by_key(reconciler.table().list().await?);
    let snapshot = source.snapshot().await?;

    let mut desired: BTreeMap<ServiceKey, MembershipEvent> = BTreeMap::new();
    for raw in &snapshot {
        let Some(event) = normalizer.parse(raw) else {
            continue;
        };
        match desired.get(&event.key) {
            // Duplicate key in one snapshot: keep the newer assertion.
            Some(existing) if existing.epoch > event.epoch => {}
            _ => {
                desired.insert(event.key, event);
            }
        }
    }

    let keys: BTreeSet<ServiceKey> = applied.keys().chain(desired.keys()).copied().collect();
    let shadow = reconciler.shadow();
    let now = Instant::now();

    let mut report = ResyncReport {
        keys_seen: keys.len(),
        ..Default::default()
    };

    for key in keys {
        let last_applied = applied.get(&key).cloned().unwrap_or_default();

        match desired.get(&key) {
            Some(event) => {
                normalizer.prime(event);
                if event.backends.is_empty() && last_applied.is_empty() {
                    continue;
                }
                let gc = if event.backends.is_empty() {
                    GcState::Draining {
                        deadline: now + shadow.grace_period(),
                    }
                } else {
                    GcState::Live
                };
                shadow
                    .seed(key, event.backends.clone(), last_applied, event.epoch, gc)
                    .await;
            }
            None => {
                report.orphans += 1;
                debug!(service_key = %key, backends = %last_applied, "orphaned table entries");
                shadow
                    .seed(
                        key,
                        BackendSet::new(),
                        last_applied,
                        None,
                        GcState::Draining { deadline: now },
                    )
                    .await;
            }
        }

        let in_sync = shadow.get(key).await.is_some_and(|entry| entry.is_converged());
        if in_sync {
            report.in_sync += 1;
            continue;
        }

        match reconciler.converge(key).await {
            ConvergeOutcome::Converged { .. } | ConvergeOutcome::Reclaimed { .. } => {
                report.converged += 1
            }
            ConvergeOutcome::Incomplete { .. } => report.incomplete += 1,
            ConvergeOutcome::Draining { .. } => report.draining += 1,
            ConvergeOutcome::Absent => {}
        }
    }

    info!(
        keys_seen = report.keys_seen,
        in_sync = report.in_sync,
        converged = report.converged,
        incomplete = report.incomplete,
        draining = report.draining,
        orphans = report.orphans,
        "startup resync complete"
    );

    Ok(report)
}
