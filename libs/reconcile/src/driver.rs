//! Sync driver: subscription -> normalizer -> worker pool.
//!
//! Also owns the periodic sweep, which re-triggers every known key so that
//! pending writes and expired grace periods are picked up even when the
//! source is quiet. Each sweep also prunes the normalizer's dedup memory
//! down to the keys the shadow store still tracks.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::normalizer::Normalizer;
use crate::pool::PoolHandle;
use crate::source::RawNotification;

/// Single consumer of the event subscription.
pub struct SyncDriver {
    rx: Option<mpsc::Receiver<RawNotification>>,
    normalizer: Normalizer,
    pool: PoolHandle,
    sweep_interval: Duration,
}

impl SyncDriver {
    pub fn new(
        rx: mpsc::Receiver<RawNotification>,
        normalizer: Normalizer,
        pool: PoolHandle,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            rx: Some(rx),
            normalizer,
            pool,
            sweep_interval,
        }
    }

    /// Run until shutdown. A closed subscription stops intake but keeps
    /// sweeps running.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "starting sync driver"
        );

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sync driver shutting down");
                        break;
                    }
                }

                msg = recv(&mut self.rx) => {
                    match msg {
                        Some(raw) => {
                            if let Some(event) = self.normalizer.normalize(raw) {
                                debug!(
                                    service_key = %event.key,
                                    backends = %event.backends,
                                    "membership event queued"
                                );
                                self.pool.submit(event);
                            }
                        }
                        None => {
                            warn!("event subscription closed, continuing with periodic sweeps only");
                            self.rx = None;
                        }
                    }
                }

                _ = sweep.tick() => {
                    let tracked: HashSet<_> = self.pool.sweep().await.into_iter().collect();
                    let forgotten = self.normalizer.forget_absent(&tracked);
                    if forgotten > 0 {
                        debug!(forgotten, "pruned dedup memory of reclaimed keys");
                    }
                }
            }
        }
    }
}

async fn recv(rx: &mut Option<mpsc::Receiver<RawNotification>>) -> Option<RawNotification> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
