//! Counters for the synchronizer's observable output.
//!
//! All counters are monotonic except `shadow_entries`, which is a gauge kept
//! current by the shadow store. Exposition is left to the embedding process,
//! which reads [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::TableErrorKind;

/// Shared counters, cheap to update from any task.
#[derive(Debug, Default)]
pub struct Metrics {
    upserts: AtomicU64,
    deletes: AtomicU64,
    failures_transient: AtomicU64,
    failures_capacity: AtomicU64,
    failures_unavailable: AtomicU64,
    events_forwarded: AtomicU64,
    events_duplicate: AtomicU64,
    events_malformed: AtomicU64,
    events_stale: AtomicU64,
    keys_reclaimed: AtomicU64,
    passes_incomplete: AtomicU64,
    shadow_entries: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upsert(&self) {
        self.upserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed table attempt by kind.
    pub fn record_failure(&self, kind: TableErrorKind) {
        let counter = match kind {
            TableErrorKind::Transient => &self.failures_transient,
            TableErrorKind::CapacityExceeded => &self.failures_capacity,
            TableErrorKind::Unavailable => &self.failures_unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.events_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.events_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.events_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.events_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self) {
        self.keys_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_incomplete(&self) {
        self.passes_incomplete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_shadow_entries(&self, count: usize) {
        self.shadow_entries.store(count as u64, Ordering::Relaxed);
    }

    /// Take a consistent-enough point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            upserts: self.upserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures_transient: self.failures_transient.load(Ordering::Relaxed),
            failures_capacity: self.failures_capacity.load(Ordering::Relaxed),
            failures_unavailable: self.failures_unavailable.load(Ordering::Relaxed),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            events_malformed: self.events_malformed.load(Ordering::Relaxed),
            events_stale: self.events_stale.load(Ordering::Relaxed),
            keys_reclaimed: self.keys_reclaimed.load(Ordering::Relaxed),
            passes_incomplete: self.passes_incomplete.load(Ordering::Relaxed),
            shadow_entries: self.shadow_entries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub upserts: u64,
    pub deletes: u64,
    pub failures_transient: u64,
    pub failures_capacity: u64,
    pub failures_unavailable: u64,
    pub events_forwarded: u64,
    pub events_duplicate: u64,
    pub events_malformed: u64,
    pub events_stale: u64,
    pub keys_reclaimed: u64,
    pub passes_incomplete: u64,
    pub shadow_entries: u64,
}

impl MetricsSnapshot {
    /// Total failed table attempts across all kinds.
    pub fn failures_total(&self) -> u64 {
        self.failures_transient + self.failures_capacity + self.failures_unavailable
    }
}
