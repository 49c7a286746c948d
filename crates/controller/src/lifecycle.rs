use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use xposer_core::{CacheSyncError, Notification};

use crate::bridge::EventBridge;
use crate::config::SyncFailurePolicy;
use crate::context::Context;
use crate::reconcile::process_next;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("cache did not sync within {0:?}")]
    SyncTimeout(Duration),
    #[error(transparent)]
    Sync(#[from] CacheSyncError),
}

pub struct Controller {
    ctx: Arc<Context>,
}

impl Controller {
    pub fn new(ctx: Arc<Context>) -> Self { Self { ctx } }

    pub fn context(&self) -> &Arc<Context> { &self.ctx }

    /// Wait for the cache's initial listing, bounded by `sync_timeout`.
    pub async fn wait_for_sync(&self) -> Result<(), ControllerError> {
        let limit = self.ctx.config.sync_timeout;
        match tokio::time::timeout(limit, self.ctx.cache.wait_until_synced()).await {
            Ok(res) => res.map_err(ControllerError::from),
            Err(_) => Err(ControllerError::SyncTimeout(limit)),
        }
    }

    /// Run until `shutdown` flips to true (or its sender goes away).
    ///
    /// Notifications are bridged into the queue right away so nothing is lost
    /// while the cache syncs; workers only start once the sync gate passes.
    /// A shutdown request during the sync wait returns `Ok` without starting
    /// any worker.
    pub async fn run(
        self,
        notifications: mpsc::Receiver<Notification>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        info!(workers = self.ctx.config.workers, "starting xposer controller");
        let pump = tokio::spawn(EventBridge::new(&self.ctx).pump(notifications));

        let synced = tokio::select! {
            res = self.wait_for_sync() => res,
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("shutdown requested before the cache synced");
                pump.abort();
                self.ctx.queue.shut_down();
                return Ok(());
            }
        };
        match synced {
            Ok(()) => info!("workload cache synced"),
            Err(e) => match self.ctx.config.on_sync_failure {
                SyncFailurePolicy::Abort => {
                    error!(error = %e, "workload cache failed to sync; aborting");
                    pump.abort();
                    return Err(e);
                }
                SyncFailurePolicy::Continue => warn!(error = %e, "workload cache failed to sync; continuing anyway"),
            },
        }

        let workers: Vec<JoinHandle<()>> = (0..self.ctx.config.workers.max(1))
            .map(|id| tokio::spawn(worker(Arc::clone(&self.ctx), id)))
            .collect();
        let resyncer = (!self.ctx.config.resync.is_zero()).then(|| tokio::spawn(resync(Arc::clone(&self.ctx))));

        wait_for_shutdown(&mut shutdown).await;
        info!("shutdown requested; draining workers");
        pump.abort();
        if let Some(r) = resyncer {
            r.abort();
        }
        self.ctx.queue.shut_down();
        for w in workers {
            if let Err(e) = w.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("xposer controller stopped");
        Ok(())
    }
}

/// Re-enqueue every cached workload once per `resync` period.
async fn resync(ctx: Arc<Context>) {
    let period = ctx.config.resync;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let keys = ctx.cache.keys();
        debug!(count = keys.len(), "periodic resync");
        counter!("resync_total", 1);
        for w in keys {
            ctx.queue.add(w.key());
        }
    }
}

async fn worker(ctx: Arc<Context>, id: usize) {
    debug!(worker = id, "worker started");
    while process_next(&ctx).await {}
    debug!(worker = id, "worker stopped");
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
