use std::{sync::Arc, time::Duration};

use data_model::JobKey;
use state_store::{Resource, ResourceCache, ResourceEvent};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    time::{interval_at, Instant, Interval},
};
use tracing::{debug, info, warn};

use crate::work_queue::WorkQueue;

/// Job that needs reconciliation after `event`. Children resolve to their
/// owning job.
pub fn job_key_for_event(event: &ResourceEvent) -> Option<JobKey> {
    match &event.resource {
        Resource::Job(job) => Some(job.key()),
        Resource::Process(process) => process.owner_job_key(),
        Resource::Endpoint(endpoint) => endpoint.owner_job_key(),
    }
}

/// Turns cache change notifications into work queue keys.
pub struct EventEnqueuer {
    cache: Arc<ResourceCache>,
    queue: Arc<WorkQueue<JobKey>>,
    resync_period: Option<Duration>,
}

impl EventEnqueuer {
    pub fn new(
        cache: Arc<ResourceCache>,
        queue: Arc<WorkQueue<JobKey>>,
        resync_period: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            queue,
            resync_period: resync_period.filter(|p| !p.is_zero()),
        }
    }

    /// Enqueues every cached job, then follows the change stream until
    /// shutdown.
    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        // subscribe before listing so nothing falls between the two
        let mut events = self.cache.subscribe();
        self.enqueue_all().await;

        let mut resync = self
            .resync_period
            .map(|period| interval_at(Instant::now() + period, period));
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change events were dropped, re-enqueueing all jobs");
                        self.enqueue_all().await;
                    }
                    Err(RecvError::Closed) => {
                        info!("change event stream closed");
                        break;
                    }
                },
                _ = tick(&mut resync) => {
                    debug!("periodic resync");
                    self.enqueue_all().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("event enqueuer shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_event(&self, event: &ResourceEvent) {
        match job_key_for_event(event) {
            Some(key) => {
                debug!(
                    job = %key,
                    event_type = event.event_type.as_ref(),
                    kind = event.resource.kind(),
                    "enqueue job"
                );
                self.queue.add(key).await;
            }
            None => debug!(
                object = event.resource.object_key(),
                "ignoring event for object without an owning job"
            ),
        }
    }

    async fn enqueue_all(&self) {
        for key in self.cache.job_keys().await {
            self.queue.add(key).await;
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
