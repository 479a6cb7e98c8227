use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::Result;
use data_model::JobKey;
use futures::FutureExt;
use metrics::queue_metrics;
use state_store::{cluster_error, ResourceCache};
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    enqueuer::EventEnqueuer,
    reconciler::SyncHandler,
    work_queue::{ExponentialBackoff, WorkQueue},
};

/// Event enqueuer plus a fixed pool of reconciliation workers sharing one
/// work queue.
pub struct Controller {
    cache: Arc<ResourceCache>,
    queue: Arc<WorkQueue<JobKey>>,
    handler: Arc<dyn SyncHandler>,
    resync_period: Option<Duration>,
}

impl Controller {
    pub fn new(
        cache: Arc<ResourceCache>,
        handler: Arc<dyn SyncHandler>,
        backoff: ExponentialBackoff,
        resync_period: Option<Duration>,
        queue_metrics: Arc<queue_metrics::Metrics>,
    ) -> Self {
        Self {
            cache,
            queue: Arc::new(WorkQueue::new(backoff, queue_metrics)),
            handler,
            resync_period,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<JobKey>> {
        self.queue.clone()
    }

    /// Waits for the cache to sync, then reconciles jobs with `worker_count`
    /// workers until `shutdown_rx` fires. Returns once every in-flight sync
    /// has finished.
    pub async fn run(&self, worker_count: usize, mut shutdown_rx: watch::Receiver<()>) -> Result<()> {
        info!("waiting for resource cache to sync");
        tokio::select! {
            res = self.cache.wait_for_sync() => res?,
            _ = shutdown_rx.changed() => {
                info!("shutdown before cache sync");
                return Ok(());
            }
        }

        let enqueuer = EventEnqueuer::new(self.cache.clone(), self.queue.clone(), self.resync_period);
        let enqueuer_shutdown_rx = shutdown_rx.clone();
        let enqueuer_handle = tokio::spawn(async move {
            enqueuer.start(enqueuer_shutdown_rx).await;
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let queue = self.queue.clone();
            let handler = self.handler.clone();
            workers.spawn(async move {
                while process_next_item(&queue, &handler).await {}
                debug!(worker_id, "worker stopped");
            });
        }
        info!(worker_count, "controller started");

        // an error means the sender is gone, which is a shutdown as well
        let _ = shutdown_rx.changed().await;
        info!("controller shutting down");
        self.queue.shut_down().await;
        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                error!("reconciliation worker failed: {:?}", err);
            }
        }
        enqueuer_handle.await?;
        info!("controller stopped");
        Ok(())
    }
}

/// Takes one key off the queue and syncs it. Returns false once the queue
/// is shutting down.
async fn process_next_item(queue: &Arc<WorkQueue<JobKey>>, handler: &Arc<dyn SyncHandler>) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match AssertUnwindSafe(handler.sync(&key)).catch_unwind().await {
        Ok(Ok(satisfied)) => {
            debug!(job = %key, satisfied, "job synced");
            queue.forget(&key).await;
        }
        Ok(Err(err)) => {
            match cluster_error(&err) {
                Some(cluster_err) if cluster_err.is_retryable() => {
                    warn!(job = %key, "error syncing job, will retry: {:?}", err)
                }
                _ => error!(job = %key, "error syncing job: {:?}", err),
            }
            queue.add_rate_limited(key.clone()).await;
        }
        Err(panic) => {
            error!(job = %key, "sync panicked: {}", panic_message(&*panic));
            queue.add_rate_limited(key.clone()).await;
        }
    }
    queue.done(&key).await;
    true
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
