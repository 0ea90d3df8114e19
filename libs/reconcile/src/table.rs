//! Service table interface and in-memory implementation.
//!
//! The table is the data-plane's key/value map: one row per
//! `(ServiceKey, BackendAddress)` pair, fixed capacity, kernel visible. The
//! engine only needs three atomic per-pair operations and a full listing,
//! so that is all [`ServiceTable`] exposes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lifter_addr::{BackendAddress, BackendSet, ServiceKey};
use tracing::debug;

use crate::error::TableError;

/// Narrow contract of the external service table.
///
/// - `upsert` is idempotent.
/// - `delete` of a missing pair succeeds.
/// - A full table reports [`TableError::CapacityExceeded`], never drops.
#[async_trait]
pub trait ServiceTable: Send + Sync {
    /// Insert the pair if absent.
    async fn upsert(&self, key: ServiceKey, backend: BackendAddress) -> Result<(), TableError>;

    /// Remove the pair if present.
    async fn delete(&self, key: ServiceKey, backend: BackendAddress) -> Result<(), TableError>;

    /// List every pair currently in the table.
    async fn list(&self) -> Result<Vec<(ServiceKey, BackendAddress)>, TableError>;

    /// Configured capacity in pairs.
    fn capacity(&self) -> usize;
}

/// Group a flat table listing by service key.
pub fn group_by_key(
    pairs: impl IntoIterator<Item = (ServiceKey, BackendAddress)>,
) -> BTreeMap<ServiceKey, BackendSet> {
    let mut grouped: BTreeMap<ServiceKey, BackendSet> = BTreeMap::new();
    for (key, backend) in pairs {
        grouped.entry(key).or_default().insert(backend);
    }
    grouped
}

// =============================================================================
// In-memory table
// =============================================================================

/// A successful mutation recorded by [`MemoryTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Upsert(ServiceKey, BackendAddress),
    Delete(ServiceKey, BackendAddress),
}

#[derive(Debug, Default)]
struct MemoryTableState {
    entries: BTreeSet<(ServiceKey, BackendAddress)>,
    ops: Vec<TableOp>,
    attempts: u64,
    fail_next: VecDeque<TableError>,
    failing_pairs: HashMap<(ServiceKey, BackendAddress), u32>,
    list_unavailable: bool,
    latency: Duration,
}

/// In-process table with a capacity limit, an operation log, and fault
/// injection. Backs dev mode and every engine test.
#[derive(Debug)]
pub struct MemoryTable {
    capacity: usize,
    state: Mutex<MemoryTableState>,
}

impl MemoryTable {
    /// Create an empty table.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(MemoryTableState::default()),
        }
    }

    /// Create a table pre-populated with pairs (simulates state left behind
    /// by a previous process).
    pub fn with_entries(
        capacity: usize,
        entries: impl IntoIterator<Item = (ServiceKey, BackendAddress)>,
    ) -> Self {
        let table = Self::new(capacity);
        table.lock().entries.extend(entries);
        table
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTableState> {
        // A poisoned lock only means a test panicked mid-operation.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next write attempt with `error`. Calls queue up.
    pub fn fail_next(&self, error: TableError) {
        self.lock().fail_next.push_back(error);
    }

    /// Fail the next `times` writes touching this pair with a transient error.
    pub fn fail_pair(&self, key: ServiceKey, backend: BackendAddress, times: u32) {
        self.lock().failing_pairs.insert((key, backend), times);
    }

    /// Make `list` fail as unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().list_unavailable = unavailable;
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Backends currently stored for a key.
    pub fn backends_for(&self, key: ServiceKey) -> BackendSet {
        self.lock()
            .entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, b)| *b)
            .collect()
    }

    pub fn contains_key(&self, key: ServiceKey) -> bool {
        self.lock().entries.iter().any(|(k, _)| *k == key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Successful mutations, in order.
    pub fn ops(&self) -> Vec<TableOp> {
        self.lock().ops.clone()
    }

    /// Total write attempts, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    pub fn clear_ops(&self) {
        let mut state = self.lock();
        state.ops.clear();
        state.attempts = 0;
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn injected_failure(
        state: &mut MemoryTableState,
        key: ServiceKey,
        backend: BackendAddress,
    ) -> Option<TableError> {
        if let Some(err) = state.fail_next.pop_front() {
            return Some(err);
        }
        match state.failing_pairs.get_mut(&(key, backend)) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Some(TableError::Transient(format!("injected failure for {key}/{backend}")))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ServiceTable for MemoryTable {
    async fn upsert(&self, key: ServiceKey, backend: BackendAddress) -> Result<(), TableError> {
        self.simulate_latency().await;

        let mut state = self.lock();
        state.attempts += 1;
        if let Some(err) = Self::injected_failure(&mut state, key, backend) {
            return Err(err);
        }

        if !state.entries.contains(&(key, backend)) {
            if state.entries.len() >= self.capacity {
                return Err(TableError::CapacityExceeded {
                    capacity: self.capacity,
                });
            }
            state.entries.insert((key, backend));
        }
        state.ops.push(TableOp::Upsert(key, backend));

        debug!(service_key = %key, backend = %backend, "[MEMORY] upsert");
        Ok(())
    }

    async fn delete(&self, key: ServiceKey, backend: BackendAddress) -> Result<(), TableError> {
        self.simulate_latency().await;

        let mut state = self.lock();
        state.attempts += 1;
        if let Some(err) = Self::injected_failure(&mut state, key, backend) {
            return Err(err);
        }

        state.entries.remove(&(key, backend));
        state.ops.push(TableOp::Delete(key, backend));

        debug!(service_key = %key, backend = %backend, "[MEMORY] delete");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(ServiceKey, BackendAddress)>, TableError> {
        let state = self.lock();
        if state.list_unavailable {
            return Err(TableError::Unavailable("memory table marked unavailable".into()));
        }
        Ok(state.entries.iter().copied().collect())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ServiceKey {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> BackendAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let table = MemoryTable::new(4);
        table.upsert(key("10.96.0.1"), addr("10.0.0.1")).await.unwrap();
        table.upsert(key("10.96.0.1"), addr("10.0.0.1")).await.unwrap();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let table = MemoryTable::new(4);
        table.delete(key("10.96.0.1"), addr("10.0.0.1")).await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_exceeded_is_reported() {
        let table = MemoryTable::new(1);
        table.upsert(key("10.96.0.1"), addr("10.0.0.1")).await.unwrap();

        let err = table.upsert(key("10.96.0.1"), addr("10.0.0.2")).await.unwrap_err();
        assert_eq!(err, TableError::CapacityExceeded { capacity: 1 });

        // Re-upserting an existing pair at capacity is still fine.
        table.upsert(key("10.96.0.1"), addr("10.0.0.1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let table = MemoryTable::new(8);
        table.fail_pair(key("10.96.0.1"), addr("10.0.0.1"), 1);

        assert!(table.upsert(key("10.96.0.1"), addr("10.0.0.1")).await.is_err());
        assert!(table.upsert(key("10.96.0.1"), addr("10.0.0.1")).await.is_ok());
        assert_eq!(table.attempts(), 2);
        assert_eq!(table.ops().len(), 1);

        table.set_unavailable(true);
        assert!(matches!(table.list().await, Err(TableError::Unavailable(_))));
    }

    #[test]
    fn test_group_by_key() {
        let grouped = group_by_key([
            (key("10.96.0.2"), addr("10.0.0.3")),
            (key("10.96.0.1"), addr("10.0.0.2")),
            (key("10.96.0.1"), addr("10.0.0.1")),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&key("10.96.0.1")].len(), 2);
    }
}
