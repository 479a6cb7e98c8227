use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::{
    replica_name,
    EndpointBuilder,
    Job,
    JobKey,
    JobStatus,
    ReplicaSpec,
    ReplicaType,
    WorkerProcess,
    WorkerProcessBuilder,
};
use metrics::{controller_metrics, AutoIncrement, Timer};
use opentelemetry::KeyValue;
use state_store::{is_already_exists, is_not_found, CacheSnapshot, ClusterClient, ResourceCache};
use tracing::{debug, info, warn};
use trainjob_utils::{get_elapsed_secs, get_epoch_time_in_ms};

use crate::{
    cluster_spec::set_cluster_spec,
    restart_policy::{set_restart_policy, termination_action, TerminationAction},
    status::{invalid_spec_status, next_status, CountsSnapshot, ReplicaCounts},
};

/// Reconciles one job. Returns whether the job is fully satisfied; an error
/// requeues the key with backoff.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, key: &JobKey) -> Result<bool>;
}

/// Publishes a job's status.
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn update_status(&self, job: &Job) -> Result<()>;
}

pub struct ClientStatusUpdater {
    client: Arc<dyn ClusterClient>,
}

impl ClientStatusUpdater {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusUpdater for ClientStatusUpdater {
    async fn update_status(&self, job: &Job) -> Result<()> {
        self.client.update_job_status(job).await?;
        Ok(())
    }
}

pub struct Reconciler {
    cache: Arc<ResourceCache>,
    client: Arc<dyn ClusterClient>,
    status_updater: Arc<dyn StatusUpdater>,
    service_domain: String,
    metrics: Arc<controller_metrics::Metrics>,
}

impl Reconciler {
    pub fn new(
        cache: Arc<ResourceCache>,
        client: Arc<dyn ClusterClient>,
        service_domain: &str,
        metrics: Arc<controller_metrics::Metrics>,
    ) -> Self {
        Self {
            cache,
            status_updater: Arc::new(ClientStatusUpdater::new(client.clone())),
            client,
            service_domain: service_domain.to_string(),
            metrics,
        }
    }

    pub fn with_status_updater(mut self, status_updater: Arc<dyn StatusUpdater>) -> Self {
        self.status_updater = status_updater;
        self
    }

    #[tracing::instrument(name = "sync_job", skip(self, key), fields(job = %key))]
    async fn sync_job(&self, key: &JobKey) -> Result<bool> {
        let snapshot = self.cache.snapshot().await;
        let Some(job) = snapshot.get_job(key).cloned() else {
            debug!("job not found, it has been deleted");
            return Ok(true);
        };
        if job.status.is_terminal() {
            debug!(phase = ?job.status.phase, "job is finished");
            return Ok(true);
        }
        if let Err(err) = job.spec.validate() {
            warn!(error = %err, "job spec is invalid");
            let status = invalid_spec_status(&job.status, &err.to_string(), get_epoch_time_in_ms());
            self.write_status(&job, status).await?;
            return Ok(true);
        }

        let mut counts = CountsSnapshot::new();
        let mut retiring = Vec::new();
        let mut acted = false;
        for (rt, spec) in &job.spec.replica_specs {
            let (replica_counts, replica_acted) = self
                .reconcile_replicas(&snapshot, &job, rt, spec, &mut retiring)
                .await?;
            acted |= replica_acted;
            counts.insert(rt.clone(), replica_counts);
        }

        // A retiring process is deleted only after the status recording its
        // exit is written.
        let status = next_status(key, &job.status, &counts, get_epoch_time_in_ms());
        if status != job.status {
            self.write_status(&job, status).await?;
        }
        for process in &retiring {
            self.delete_process(process).await?;
        }
        acted |= !retiring.is_empty();

        Ok(!acted && counts.values().all(|c| c.is_satisfied()))
    }

    /// Converges one replica type. Indices are slots in `[0, replicas)`; a
    /// slot is filled by a live process or by a retired entry in status.
    /// Terminated processes to remove are pushed to `retiring`; the caller
    /// deletes them once the status recording their exit is written.
    async fn reconcile_replicas(
        &self,
        snapshot: &CacheSnapshot,
        job: &Job,
        rt: &ReplicaType,
        spec: &ReplicaSpec,
        retiring: &mut Vec<WorkerProcess>,
    ) -> Result<(ReplicaCounts, bool)> {
        let desired = spec.replicas;
        let mut slots: Vec<Option<WorkerProcess>> = vec![None; desired as usize];
        for process in snapshot.list_processes(&job.key(), Some(rt)) {
            if !process.is_owned_by(job) {
                warn!(
                    process = %process.name,
                    "ignoring process owned by an earlier job of the same name"
                );
                continue;
            }
            match process.replica_index() {
                Some(index) if index < desired => {
                    let slot = &mut slots[index as usize];
                    if slot.is_some() {
                        warn!(process = %process.name, index, "duplicate process for replica index");
                        continue;
                    }
                    *slot = Some(process);
                }
                _ => warn!(
                    process = %process.name,
                    replica_type = %rt,
                    "ignoring process with a missing or out of range replica index"
                ),
            }
        }
        let endpoints: HashSet<String> = snapshot
            .list_endpoints(&job.key(), Some(rt))
            .into_iter()
            .map(|e| e.name)
            .collect();
        let retired = job.status.retired(rt);

        let mut counts = ReplicaCounts::new(desired);
        let mut acted = false;
        for (index, slot) in (0..desired).zip(slots) {
            if !endpoints.contains(&replica_name(&job.name, rt, index)) {
                self.create_endpoint(job, rt, index).await?;
            }
            match (slot, retired.get(&index)) {
                (Some(process), Some(&exit_code)) => {
                    if process.phase.is_terminal() {
                        debug!(process = %process.name, index, "removing process at retired index");
                        retiring.push(process);
                    }
                    counts.observe_retired(index, exit_code);
                }
                (Some(process), None) => match termination_action(spec.restart_policy, &process) {
                    TerminationAction::Leave => counts.observe(&process, spec.restart_policy),
                    TerminationAction::DeleteNonFatal { exit_code } |
                    TerminationAction::DeleteFatal { exit_code } => {
                        info!(
                            process = %process.name,
                            exit_code,
                            "retiring terminated process"
                        );
                        counts.observe_retired(index, exit_code);
                        retiring.push(process);
                    }
                },
                (None, Some(&exit_code)) => counts.observe_retired(index, exit_code),
                (None, None) => {
                    self.create_process(job, rt, spec, index).await?;
                    counts.active += 1;
                    acted = true;
                }
            }
        }
        Ok((counts, acted))
    }

    async fn create_process(
        &self,
        job: &Job,
        rt: &ReplicaType,
        spec: &ReplicaSpec,
        index: u32,
    ) -> Result<()> {
        let mut template = spec.template.clone();
        set_cluster_spec(&mut template, job, rt, index, &self.service_domain)?;
        set_restart_policy(&mut template, spec.restart_policy);
        let process = WorkerProcessBuilder::default()
            .namespace(job.namespace.clone())
            .name(replica_name(&job.name, rt, index))
            .labels(job.replica_labels(rt, index))
            .owner(Some(job.owner_reference()))
            .template(template)
            .build()?;

        match self.client.create_process(&process).await {
            Ok(_) => {
                self.metrics
                    .processes_created
                    .increment(&[KeyValue::new("replica_type", rt.key())]);
                info!(process = %process.name, replica_type = %rt, index, "created process");
                Ok(())
            }
            Err(err) if is_already_exists(&err) => {
                debug!(process = %process.name, "process already exists");
                Ok(())
            }
            Err(err) => Err(err.context(format!("creating process {}", process.name))),
        }
    }

    async fn create_endpoint(&self, job: &Job, rt: &ReplicaType, index: u32) -> Result<()> {
        let endpoint = EndpointBuilder::default()
            .namespace(job.namespace.clone())
            .name(replica_name(&job.name, rt, index))
            .selector(job.replica_labels(rt, index))
            .owner(Some(job.owner_reference()))
            .port(job.port())
            .build()?;
        match self.client.create_endpoint(&endpoint).await {
            Ok(_) => {
                self.metrics
                    .endpoints_created
                    .increment(&[KeyValue::new("replica_type", rt.key())]);
                debug!(endpoint = %endpoint.name, "created endpoint");
                Ok(())
            }
            Err(err) if is_already_exists(&err) => Ok(()),
            Err(err) => Err(err.context(format!("creating endpoint {}", endpoint.name))),
        }
    }

    async fn delete_process(&self, process: &WorkerProcess) -> Result<()> {
        match self
            .client
            .delete_process(&process.namespace, &process.name)
            .await
        {
            Ok(()) => {
                let rt = process.replica_type().unwrap_or_default().to_string();
                self.metrics
                    .processes_deleted
                    .increment(&[KeyValue::new("replica_type", rt)]);
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                debug!(process = %process.name, "process already deleted");
                Ok(())
            }
            Err(err) => Err(err.context(format!("deleting process {}", process.name))),
        }
    }

    async fn write_status(&self, job: &Job, status: JobStatus) -> Result<()> {
        let mut updated = job.clone();
        updated.status = status;
        match self.status_updater.update_status(&updated).await {
            Ok(()) => {
                self.metrics.status_updates.increment(&[]);
                info!(phase = ?updated.status.phase, "updated job status");
                if let (true, Some(start_time)) =
                    (updated.status.is_terminal(), updated.status.start_time)
                {
                    info!(
                        duration_secs = get_elapsed_secs(start_time),
                        "job finished"
                    );
                }
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                debug!("job deleted before its status was written");
                Ok(())
            }
            Err(err) => Err(err).context("updating job status"),
        }
    }
}

#[async_trait]
impl SyncHandler for Reconciler {
    async fn sync(&self, key: &JobKey) -> Result<bool> {
        let _timer = Timer::start_with_labels(&self.metrics.sync_duration, &[]);
        let result = self.sync_job(key).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .syncs
            .increment(&[KeyValue::new("result", outcome)]);
        if result.is_err() {
            self.metrics.sync_errors.increment(&[]);
        }
        result
    }
}
