//! Engine assembly: wires the components together and owns their tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::driver::SyncDriver;
use crate::error::InitError;
use crate::metrics::Metrics;
use crate::normalizer::Normalizer;
use crate::pool::{PoolHandle, WorkerPool};
use crate::reconciler::Reconciler;
use crate::resync::{resync, ResyncReport};
use crate::shadow::ShadowStore;
use crate::source::EventSource;
use crate::table::ServiceTable;

/// A running synchronizer.
pub struct Engine {
    metrics: Arc<Metrics>,
    reconciler: Arc<Reconciler>,
    report: ResyncReport,
    pool: WorkerPool,
    driver: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Subscribe, run the startup resync, then start the workers and the
    /// sync driver.
    ///
    /// The subscription is opened before the snapshot is taken so that no
    /// change falls between the two; anything buffered meanwhile is
    /// processed after the resync and deduplicated against the snapshot.
    pub async fn start(
        table: Arc<dyn ServiceTable>,
        source: Arc<dyn EventSource>,
        config: EngineConfig,
    ) -> Result<Self, InitError> {
        let metrics = Arc::new(Metrics::new());
        let shadow = Arc::new(
            ShadowStore::new(config.grace_period, Arc::clone(&metrics))
                .with_tombstone_retention(config.tombstone_retention),
        );
        let reconciler = Arc::new(Reconciler::new(
            table,
            shadow,
            config.retry.clone(),
            Arc::clone(&metrics),
        ));
        let mut normalizer = Normalizer::new(Arc::clone(&metrics));

        let rx = source.subscribe().await?;
        let report = resync(&reconciler, source.as_ref(), &mut normalizer).await?;

        let pool = WorkerPool::start(Arc::clone(&reconciler), &config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = SyncDriver::new(rx, normalizer, pool.handle(), config.resync_interval);
        let driver = tokio::spawn(driver.run(shutdown_rx));

        info!(
            workers = config.workers,
            grace_period_ms = config.grace_period.as_millis() as u64,
            capacity = reconciler.table().capacity(),
            "engine started"
        );

        Ok(Self {
            metrics,
            reconciler,
            report,
            pool,
            driver,
            shutdown_tx,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn shadow(&self) -> &Arc<ShadowStore> {
        self.reconciler.shadow()
    }

    pub fn handle(&self) -> PoolHandle {
        self.pool.handle()
    }

    /// Result of the startup resync.
    pub fn resync_report(&self) -> &ResyncReport {
        &self.report
    }

    /// Stop intake, then give in-flight passes `grace` to finish.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let mut driver = self.driver;
        if tokio::time::timeout(grace, &mut driver).await.is_err() {
            warn!("sync driver did not stop in time, aborting");
            driver.abort();
        }
        self.pool.shutdown(grace).await;
        info!("engine stopped");
    }
}
