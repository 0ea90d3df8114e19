//! Shadow state store: the authoritative desired view of every service.
//!
//! The store keeps, per `ServiceKey`, the desired backend set, a strictly
//! increasing version, the source epoch last accepted, what was last
//! confirmed written to the table, and the garbage-collection state.
//!
//! ## Locking
//!
//! The map itself sits behind an `RwLock` that is only held long enough to
//! look up or insert a slot. Each slot has its own async mutex, so work on
//! one key never contends with another. Lock order is always slot, then map.
//!
//! ## Tombstones
//!
//! Reclaiming a key forgets its entry but not its epoch. The epoch is kept
//! as a tombstone for `tombstone_retention`, so a late delivery from before
//! the delete cannot bring the service back. Tombstones are only read and
//! written under the map's write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lifter_addr::{BackendSet, ServiceKey};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::Metrics;
use crate::DEFAULT_TOMBSTONE_RETENTION;

/// Garbage-collection state of a service key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    /// Desired set is non-empty (or the key was just created).
    Live,
    /// Desired set is empty; eligible for removal at `deadline`.
    Draining { deadline: Instant },
}

impl GcState {
    pub fn is_draining(&self) -> bool {
        matches!(self, Self::Draining { .. })
    }
}

/// Shadow record for one service key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    pub key: ServiceKey,

    /// Desired backends.
    pub desired: BackendSet,

    /// Incremented on every desired-state change.
    pub version: u64,

    /// Highest source epoch accepted.
    pub epoch: Option<u64>,

    /// Backends confirmed written to the table.
    pub last_applied: BackendSet,

    pub gc: GcState,

    /// Set once the entry has been removed from the store.
    pub(crate) reclaimed: bool,
}

impl ShadowEntry {
    fn new(key: ServiceKey) -> Self {
        Self {
            key,
            desired: BackendSet::new(),
            version: 0,
            epoch: None,
            last_applied: BackendSet::new(),
            gc: GcState::Live,
            reclaimed: false,
        }
    }

    /// True when the table matches desired state and nothing is draining.
    pub fn is_converged(&self) -> bool {
        self.desired == self.last_applied && !self.gc.is_draining()
    }
}

/// Result of [`ShadowStore::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Desired state changed; carries the new version.
    Changed { version: u64 },
    /// Already the desired state.
    Unchanged,
    /// Older than what is stored; discarded.
    Stale,
}

impl Observation {
    /// Whether the observation changed desired state.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Lock-free summary of the store, see [`ShadowStore::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowStatus {
    pub entries: usize,
    /// Live keys whose table entries do not match desired state.
    pub pending: usize,
    /// Keys locked by a convergence pass right now.
    pub in_flight: usize,
}

/// Last epoch of a reclaimed key.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    epoch: u64,
    at: Instant,
}

type Slot = Arc<Mutex<ShadowEntry>>;

/// In-memory authoritative mapping `ServiceKey -> ShadowEntry`.
pub struct ShadowStore {
    entries: RwLock<HashMap<ServiceKey, Slot>>,
    tombstones: StdMutex<HashMap<ServiceKey, Tombstone>>,
    grace_period: Duration,
    tombstone_retention: Duration,
    metrics: Arc<Metrics>,
}

impl ShadowStore {
    pub fn new(grace_period: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tombstones: StdMutex::new(HashMap::new()),
            grace_period,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
            metrics,
        }
    }

    #[must_use]
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Record a desired backend set for a key.
    ///
    /// Assigns the next version when the set changes. An observation whose
    /// epoch is not newer than the stored epoch is stale and ignored.
    pub async fn observe(
        &self,
        key: ServiceKey,
        backends: BackendSet,
        epoch: Option<u64>,
    ) -> Observation {
        loop {
            let slot = match self.slot(key).await {
                Some(slot) => slot,
                // Nothing to remove for a service we have never seen.
                None if backends.is_empty() => return Observation::Unchanged,
                None => match self.revive(key, epoch).await {
                    Some(slot) => slot,
                    None => {
                        self.metrics.record_stale();
                        debug!(
                            service_key = %key,
                            epoch = ?epoch,
                            "discarding observation older than reclaim"
                        );
                        return Observation::Stale;
                    }
                },
            };

            let mut entry = slot.lock().await;
            if entry.reclaimed {
                // Reclaimed between lookup and lock; look again.
                continue;
            }

            return self.apply_observation(&mut entry, backends, epoch);
        }
    }

    fn apply_observation(
        &self,
        entry: &mut ShadowEntry,
        backends: BackendSet,
        epoch: Option<u64>,
    ) -> Observation {
        if let (Some(new), Some(stored)) = (epoch, entry.epoch) {
            if new <= stored {
                self.metrics.record_stale();
                debug!(
                    service_key = %entry.key,
                    epoch = new,
                    stored_epoch = stored,
                    "discarding stale observation"
                );
                return Observation::Stale;
            }
        }
        if epoch.is_some() {
            entry.epoch = epoch;
        }

        if entry.desired == backends {
            return Observation::Unchanged;
        }

        entry.version += 1;
        entry.gc = if backends.is_empty() {
            match entry.gc {
                GcState::Draining { deadline } => GcState::Draining { deadline },
                GcState::Live => GcState::Draining {
                    deadline: Instant::now() + self.grace_period,
                },
            }
        } else {
            GcState::Live
        };
        entry.desired = backends;

        debug!(
            service_key = %entry.key,
            version = entry.version,
            desired = %entry.desired,
            draining = entry.gc.is_draining(),
            "desired state changed"
        );

        Observation::Changed {
            version: entry.version,
        }
    }

    /// Install state discovered at startup.
    ///
    /// `last_applied` must come from the table listing; `desired` from the
    /// source snapshot.
    pub async fn seed(
        &self,
        key: ServiceKey,
        desired: BackendSet,
        last_applied: BackendSet,
        epoch: Option<u64>,
        gc: GcState,
    ) {
        let slot = self.slot_or_insert(key).await;
        let mut entry = slot.lock().await;
        entry.version += 1;
        entry.desired = desired;
        entry.last_applied = last_applied;
        entry.epoch = entry.epoch.max(epoch);
        entry.gc = gc;
    }

    /// Copy of one entry.
    pub async fn get(&self, key: ServiceKey) -> Option<ShadowEntry> {
        let slot = self.slot(key).await?;
        let entry = slot.lock().await;
        (!entry.reclaimed).then(|| entry.clone())
    }

    /// Counts for health reporting. Never waits on a key that is being
    /// converged; such keys are reported as in flight.
    pub async fn status(&self) -> ShadowStatus {
        let slots: Vec<Slot> = self.entries.read().await.values().cloned().collect();

        let mut status = ShadowStatus::default();
        for slot in slots {
            match slot.try_lock() {
                Ok(entry) if entry.reclaimed => continue,
                Ok(entry) => {
                    if !entry.gc.is_draining() && entry.desired != entry.last_applied {
                        status.pending += 1;
                    }
                }
                Err(_) => status.in_flight += 1,
            }
            status.entries += 1;
        }
        status
    }

    /// Number of reclaimed keys still remembered.
    pub fn tombstones(&self) -> usize {
        self.lock_tombstones().len()
    }

    /// Copy of every entry, ordered by key.
    pub async fn snapshot(&self) -> BTreeMap<ServiceKey, ShadowEntry> {
        let slots: Vec<Slot> = self.entries.read().await.values().cloned().collect();

        let mut out = BTreeMap::new();
        for slot in slots {
            let entry = slot.lock().await;
            if !entry.reclaimed {
                out.insert(entry.key, entry.clone());
            }
        }
        out
    }

    /// All keys, ascending.
    pub async fn keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self.entries.read().await.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub(crate) async fn slot(&self, key: ServiceKey) -> Option<Slot> {
        self.entries.read().await.get(&key).cloned()
    }

    async fn slot_or_insert(&self, key: ServiceKey) -> Slot {
        let mut entries = self.entries.write().await;
        let slot = Arc::clone(
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(ShadowEntry::new(key)))),
        );
        self.metrics.set_shadow_entries(entries.len());
        slot
    }

    /// Create the slot for a key that has no entry, unless `epoch` is not
    /// newer than the key's tombstone. A revived entry inherits the
    /// tombstone epoch.
    async fn revive(&self, key: ServiceKey, epoch: Option<u64>) -> Option<Slot> {
        let mut entries = self.entries.write().await;
        if let Some(slot) = entries.get(&key) {
            return Some(Arc::clone(slot));
        }

        let floor = {
            let mut tombstones = self.lock_tombstones();
            let floor = tombstones.get(&key).map(|t| t.epoch);
            if let (Some(new), Some(floor)) = (epoch, floor) {
                if new <= floor {
                    return None;
                }
            }
            tombstones.remove(&key);
            floor
        };

        let mut entry = ShadowEntry::new(key);
        entry.epoch = floor;
        let slot = Arc::new(Mutex::new(entry));
        entries.insert(key, Arc::clone(&slot));
        self.metrics.set_shadow_entries(entries.len());
        Some(slot)
    }

    /// Remove a fully reclaimed entry. The caller holds the entry's lock.
    pub(crate) async fn detach(&self, entry: &mut ShadowEntry) {
        entry.reclaimed = true;
        let mut entries = self.entries.write().await;
        entries.remove(&entry.key);
        self.metrics.set_shadow_entries(entries.len());

        let now = Instant::now();
        let mut tombstones = self.lock_tombstones();
        tombstones.retain(|_, t| now.duration_since(t.at) < self.tombstone_retention);
        if let Some(epoch) = entry.epoch {
            tombstones.insert(entry.key, Tombstone { epoch, at: now });
        }
    }

    fn lock_tombstones(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceKey, Tombstone>> {
        self.tombstones.lock().unwrap_or_else(|e| e.into_inner())
    }
}
