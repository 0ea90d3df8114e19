//! Sharded worker pool.
//!
//! Every `ServiceKey` hashes to exactly one shard, and each shard has one
//! worker task, so all writes for a key are issued by a single writer.
//!
//! Deliveries never block: they land in the shard's coalescing mailbox,
//! which holds at most one pending item per key. A burst of updates for one
//! key collapses into the newest one before the worker gets to it.
//!
//! ## Timers
//!
//! - GC timer: armed when a pass reports `Draining`, re-triggers the key at
//!   the deadline, aborted when the key becomes live again.
//! - Retry timer: armed when a pass is incomplete.

use std::collections::HashMap;
use std::hash::{BuildHasher, BuildHasherDefault, DefaultHasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lifter_addr::ServiceKey;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::normalizer::MembershipEvent;
use crate::reconciler::{ConvergeOutcome, Reconciler};
use crate::retry::RetryTracker;

// =============================================================================
// Mailbox
// =============================================================================

/// Work queued for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    /// A new desired-state assertion.
    Observe(MembershipEvent),
    /// Converge without new input (timers, sweeps).
    Trigger,
}

impl Pending {
    /// Fold a newer delivery into what is already queued.
    fn merge(self, incoming: Pending) -> Pending {
        match (self, incoming) {
            (Pending::Observe(current), Pending::Observe(next)) => {
                // Highest epoch wins; without epochs the latest does.
                match (current.epoch, next.epoch) {
                    (Some(a), Some(b)) if a > b => Pending::Observe(current),
                    _ => Pending::Observe(next),
                }
            }
            (Pending::Observe(current), Pending::Trigger) => Pending::Observe(current),
            (Pending::Trigger, incoming) => incoming,
        }
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    pending: Mutex<HashMap<ServiceKey, Pending>>,
    notify: Notify,
}

impl Mailbox {
    fn push(&self, key: ServiceKey, item: Pending) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let merged = match pending.remove(&key) {
                Some(existing) => existing.merge(item),
                None => item,
            };
            pending.insert(key, merged);
        }
        self.notify.notify_one();
    }

    /// Take everything queued, ordered by key.
    fn drain(&self) -> Vec<(ServiceKey, Pending)> {
        let mut batch: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        batch.sort_unstable_by_key(|(key, _)| *key);
        batch
    }

    fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// =============================================================================
// Pool Handle
// =============================================================================

/// Cloneable handle for feeding work into the pool.
#[derive(Clone)]
pub struct PoolHandle {
    mailboxes: Arc<[Arc<Mailbox>]>,
    reconciler: Arc<Reconciler>,
}

impl PoolHandle {
    fn mailbox(&self, key: ServiceKey) -> &Arc<Mailbox> {
        &self.mailboxes[shard_for(key, self.mailboxes.len())]
    }

    /// Queue a membership event for its key's shard.
    pub fn submit(&self, event: MembershipEvent) {
        let key = event.key;
        self.mailbox(key).push(key, Pending::Observe(event));
    }

    /// Queue a convergence pass for a key.
    pub fn trigger(&self, key: ServiceKey) {
        self.mailbox(key).push(key, Pending::Trigger);
    }

    /// Queue a convergence pass for every key in the shadow store.
    /// Returns the swept keys.
    pub async fn sweep(&self) -> Vec<ServiceKey> {
        let keys = self.reconciler.shadow().keys().await;
        for key in &keys {
            self.trigger(*key);
        }
        debug!(keys = keys.len(), "periodic sweep queued");
        keys
    }

    /// Items waiting across all mailboxes.
    pub fn queued(&self) -> usize {
        self.mailboxes.iter().map(|m| m.len()).sum()
    }

    pub fn workers(&self) -> usize {
        self.mailboxes.len()
    }
}

fn shard_for(key: ServiceKey, shards: usize) -> usize {
    let hash = BuildHasherDefault::<DefaultHasher>::default().hash_one(key);
    (hash % shards.max(1) as u64) as usize
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Fixed-size set of shard workers.
pub struct WorkerPool {
    handle: PoolHandle,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `config.workers` shard workers.
    pub fn start(reconciler: Arc<Reconciler>, config: &EngineConfig) -> Self {
        let workers = config.workers.max(1);
        let mailboxes: Arc<[Arc<Mailbox>]> =
            (0..workers).map(|_| Arc::new(Mailbox::default())).collect();
        let handle = PoolHandle {
            mailboxes: Arc::clone(&mailboxes),
            reconciler: Arc::clone(&reconciler),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = mailboxes
            .iter()
            .enumerate()
            .map(|(shard, mailbox)| {
                let worker = ShardWorker {
                    shard,
                    mailbox: Arc::clone(mailbox),
                    reconciler: Arc::clone(&reconciler),
                    retry_interval: config.retry_interval,
                    tracker: RetryTracker::new(config.max_incomplete_passes, config.failure_window),
                    gc_timers: HashMap::new(),
                    retry_timers: HashMap::new(),
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        info!(workers, "worker pool started");

        Self {
            handle,
            tasks,
            shutdown_tx,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Stop all workers. In-flight passes get `grace` to finish, then the
    /// remaining tasks are aborted.
    pub async fn shutdown(self, grace: Duration) {
        info!(workers = self.tasks.len(), "stopping worker pool");
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.tasks.iter().all(|t| t.is_finished()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for (shard, task) in self.tasks.iter().enumerate() {
            if !task.is_finished() {
                warn!(shard, "force aborting shard worker");
                task.abort();
            }
        }
    }
}

// =============================================================================
// Shard Worker
// =============================================================================

struct ShardWorker {
    shard: usize,
    mailbox: Arc<Mailbox>,
    reconciler: Arc<Reconciler>,
    retry_interval: Duration,
    tracker: RetryTracker,
    gc_timers: HashMap<ServiceKey, JoinHandle<()>>,
    retry_timers: HashMap<ServiceKey, JoinHandle<()>>,
}

impl ShardWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(shard = self.shard, "shard worker started");
        let mailbox = Arc::clone(&self.mailbox);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = mailbox.notify.notified() => {
                    for (key, pending) in mailbox.drain() {
                        self.process(key, pending).await;
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    self.tracker.prune();
                }
            }
        }

        for (_, timer) in self.gc_timers.drain().chain(self.retry_timers.drain()) {
            timer.abort();
        }
        debug!(shard = self.shard, "shard worker stopped");
    }

    async fn process(&mut self, key: ServiceKey, pending: Pending) {
        if let Pending::Observe(event) = pending {
            let live = !event.backends.is_empty();
            self.reconciler
                .shadow()
                .observe(key, event.backends, event.epoch)
                .await;
            if live {
                cancel(&mut self.gc_timers, key);
            }
        }

        match self.reconciler.converge(key).await {
            ConvergeOutcome::Converged { .. } => {
                self.tracker.clear(key);
                cancel(&mut self.retry_timers, key);
            }
            ConvergeOutcome::Incomplete { pending, .. } => {
                if self.tracker.record_failure(key) {
                    error!(
                        service_key = %key,
                        pending,
                        "service key keeps failing to converge"
                    );
                }
                self.arm_retry(key);
            }
            ConvergeOutcome::Draining { remaining } => {
                cancel(&mut self.retry_timers, key);
                self.arm_gc(key, remaining);
            }
            ConvergeOutcome::Reclaimed { .. } | ConvergeOutcome::Absent => {
                self.tracker.clear(key);
                cancel(&mut self.gc_timers, key);
                cancel(&mut self.retry_timers, key);
            }
        }
    }

    fn arm_gc(&mut self, key: ServiceKey, remaining: Duration) {
        cancel(&mut self.gc_timers, key);
        debug!(service_key = %key, remaining_ms = remaining.as_millis() as u64, "gc timer armed");
        let timer = spawn_trigger(Arc::clone(&self.mailbox), key, remaining);
        self.gc_timers.insert(key, timer);
    }

    fn arm_retry(&mut self, key: ServiceKey) {
        if self.retry_timers.get(&key).is_some_and(|t| !t.is_finished()) {
            return;
        }
        let timer = spawn_trigger(Arc::clone(&self.mailbox), key, self.retry_interval);
        self.retry_timers.insert(key, timer);
    }
}

fn spawn_trigger(mailbox: Arc<Mailbox>, key: ServiceKey, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        mailbox.push(key, Pending::Trigger);
    })
}

fn cancel(timers: &mut HashMap<ServiceKey, JoinHandle<()>>, key: ServiceKey) {
    if let Some(timer) = timers.remove(&key) {
        timer.abort();
    }
}
