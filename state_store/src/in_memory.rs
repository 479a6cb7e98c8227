//! In-memory orchestration layer.
//!
//! Stores jobs, processes and endpoints, applies every accepted write to the
//! [`ResourceCache`] the way a watch would, and records the write actions it
//! served. Used by standalone mode and as the test double for the live API.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{
    ContainerStatus,
    Endpoint,
    Job,
    JobKey,
    JobStatus,
    ProcessPhase,
    WorkerProcess,
    DEFAULT_CONTAINER_NAME,
};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    cache::object_key,
    ClusterClient,
    ClusterError,
    EventType,
    Resource,
    ResourceCache,
    ResourceEvent,
};

/// Write calls served by the cluster, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actions {
    pub created_processes: Vec<String>,
    pub deleted_processes: Vec<String>,
    pub created_endpoints: Vec<String>,
    pub status_updates: Vec<JobStatus>,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.created_processes.is_empty() &&
            self.deleted_processes.is_empty() &&
            self.created_endpoints.is_empty() &&
            self.status_updates.is_empty()
    }
}

#[derive(Default)]
struct Faults {
    create_process: Option<ClusterError>,
    delete_process: Option<ClusterError>,
    status_update: Option<ClusterError>,
}

#[derive(Default)]
struct Objects {
    jobs: HashMap<JobKey, Job>,
    processes: HashMap<String, WorkerProcess>,
    endpoints: HashMap<String, Endpoint>,
}

pub struct InMemoryCluster {
    cache: Arc<ResourceCache>,
    objects: Mutex<Objects>,
    actions: Mutex<Actions>,
    faults: Mutex<Faults>,
}

impl InMemoryCluster {
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self {
            cache,
            objects: Mutex::new(Objects::default()),
            actions: Mutex::new(Actions::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn cache(&self) -> Arc<ResourceCache> {
        self.cache.clone()
    }

    /// Completes the initial list so that cache readers may start.
    pub fn mark_synced(&self) {
        self.cache.mark_synced();
    }

    /// Submits a job the way an external actor would.
    pub async fn create_job(&self, mut job: Job) -> Result<Job> {
        if job.uid.is_empty() {
            job.uid = nanoid::nanoid!();
        }
        {
            let mut objects = self.objects.lock().await;
            if objects.jobs.contains_key(&job.key()) {
                return Err(ClusterError::AlreadyExists(job.key().to_string()).into());
            }
            objects.jobs.insert(job.key(), job.clone());
        }
        info!(job = %job.key(), "job submitted");
        self.emit(EventType::Added, Resource::Job(job.clone())).await;
        Ok(job)
    }

    pub async fn get_job(&self, key: &JobKey) -> Option<Job> {
        self.objects.lock().await.jobs.get(key).cloned()
    }

    /// Deletes a job and garbage-collects every child owned by it.
    pub async fn delete_job(&self, key: &JobKey) -> Result<()> {
        let (job, processes, endpoints) = {
            let mut objects = self.objects.lock().await;
            let job = objects
                .jobs
                .remove(key)
                .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
            let process_keys: Vec<String> = objects
                .processes
                .iter()
                .filter(|(_, p)| p.owner_job_key().as_ref() == Some(key))
                .map(|(k, _)| k.clone())
                .collect();
            let processes: Vec<WorkerProcess> = process_keys
                .iter()
                .filter_map(|k| objects.processes.remove(k))
                .collect();
            let endpoint_keys: Vec<String> = objects
                .endpoints
                .iter()
                .filter(|(_, e)| e.owner_job_key().as_ref() == Some(key))
                .map(|(k, _)| k.clone())
                .collect();
            let endpoints: Vec<Endpoint> = endpoint_keys
                .iter()
                .filter_map(|k| objects.endpoints.remove(k))
                .collect();
            (job, processes, endpoints)
        };
        for process in processes {
            self.emit(EventType::Deleted, Resource::Process(process))
                .await;
        }
        for endpoint in endpoints {
            self.emit(EventType::Deleted, Resource::Endpoint(endpoint))
                .await;
        }
        self.emit(EventType::Deleted, Resource::Job(job)).await;
        Ok(())
    }

    /// Inserts a process as if it had been created by someone else, without
    /// recording an action.
    pub async fn add_process(&self, process: WorkerProcess) {
        let event_type = {
            let mut objects = self.objects.lock().await;
            let key = object_key(&process.namespace, &process.name);
            match objects.processes.insert(key, process.clone()) {
                Some(_) => EventType::Updated,
                None => EventType::Added,
            }
        };
        self.emit(event_type, Resource::Process(process)).await;
    }

    /// Moves a process to `phase` as the orchestration layer would, recording
    /// the main container's exit code when given.
    pub async fn set_process_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: ProcessPhase,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let process = {
            let mut objects = self.objects.lock().await;
            let process = objects
                .processes
                .get_mut(&object_key(namespace, name))
                .ok_or_else(|| ClusterError::NotFound(object_key(namespace, name)))?;
            process.phase = phase;
            if let Some(exit_code) = exit_code {
                process.container_statuses = vec![ContainerStatus {
                    name: DEFAULT_CONTAINER_NAME.to_string(),
                    exit_code: Some(exit_code),
                }];
            }
            process.clone()
        };
        self.emit(EventType::Updated, Resource::Process(process))
            .await;
        Ok(())
    }

    pub async fn list_processes(&self) -> Vec<WorkerProcess> {
        let mut processes: Vec<WorkerProcess> =
            self.objects.lock().await.processes.values().cloned().collect();
        processes.sort_by(|a, b| a.name.cmp(&b.name));
        processes
    }

    pub async fn actions(&self) -> Actions {
        self.actions.lock().await.clone()
    }

    pub async fn clear_actions(&self) {
        *self.actions.lock().await = Actions::default();
    }

    pub async fn fail_next_create(&self, err: ClusterError) {
        self.faults.lock().await.create_process = Some(err);
    }

    pub async fn fail_next_delete(&self, err: ClusterError) {
        self.faults.lock().await.delete_process = Some(err);
    }

    pub async fn fail_next_status_update(&self, err: ClusterError) {
        self.faults.lock().await.status_update = Some(err);
    }

    async fn emit(&self, event_type: EventType, resource: Resource) {
        self.cache
            .apply(ResourceEvent::new(event_type, resource))
            .await;
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create_process(&self, process: &WorkerProcess) -> Result<WorkerProcess> {
        if let Some(err) = self.faults.lock().await.create_process.take() {
            return Err(err.into());
        }
        let key = object_key(&process.namespace, &process.name);
        let created = {
            let mut objects = self.objects.lock().await;
            if objects.processes.contains_key(&key) {
                return Err(ClusterError::AlreadyExists(key).into());
            }
            let mut created = process.clone();
            created.phase = ProcessPhase::Pending;
            created.container_statuses.clear();
            objects.processes.insert(key.clone(), created.clone());
            created
        };
        self.actions.lock().await.created_processes.push(key);
        self.emit(EventType::Added, Resource::Process(created.clone()))
            .await;
        Ok(created)
    }

    async fn delete_process(&self, namespace: &str, name: &str) -> Result<()> {
        if let Some(err) = self.faults.lock().await.delete_process.take() {
            return Err(err.into());
        }
        let key = object_key(namespace, name);
        let removed = self.objects.lock().await.processes.remove(&key);
        self.actions.lock().await.deleted_processes.push(key.clone());
        match removed {
            Some(process) => {
                self.emit(EventType::Deleted, Resource::Process(process))
                    .await;
                Ok(())
            }
            None => Err(ClusterError::NotFound(key).into()),
        }
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let key = object_key(&endpoint.namespace, &endpoint.name);
        {
            let mut objects = self.objects.lock().await;
            if objects.endpoints.contains_key(&key) {
                return Err(ClusterError::AlreadyExists(key).into());
            }
            objects.endpoints.insert(key.clone(), endpoint.clone());
        }
        self.actions.lock().await.created_endpoints.push(key);
        self.emit(EventType::Added, Resource::Endpoint(endpoint.clone()))
            .await;
        Ok(endpoint.clone())
    }

    async fn update_job_status(&self, job: &Job) -> Result<Job> {
        if let Some(err) = self.faults.lock().await.status_update.take() {
            return Err(err.into());
        }
        let updated = {
            let mut objects = self.objects.lock().await;
            let stored = objects
                .jobs
                .get_mut(&job.key())
                .ok_or_else(|| ClusterError::NotFound(job.key().to_string()))?;
            stored.status = job.status.clone();
            stored.clone()
        };
        self.actions
            .lock()
            .await
            .status_updates
            .push(job.status.clone());
        self.emit(EventType::Updated, Resource::Job(updated.clone()))
            .await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{new_job, new_process},
        JobPhase,
        ReplicaType,
    };

    use super::*;
    use crate::is_not_found;

    #[tokio::test]
    async fn test_writes_propagate_to_cache() {
        let cache = Arc::new(ResourceCache::new());
        let cluster = InMemoryCluster::new(cache.clone());
        let job = cluster.create_job(new_job(1, 0)).await.unwrap();

        let process = new_process(&job, &ReplicaType::worker(), 0, ProcessPhase::Running);
        let created = cluster.create_process(&process).await.unwrap();
        assert_eq!(created.phase, ProcessPhase::Pending);

        let snapshot = cache.snapshot().await;
        assert!(snapshot.get_job(&job.key()).is_some());
        assert_eq!(snapshot.list_processes(&job.key(), None), vec![created]);

        let err = cluster.create_process(&process).await.unwrap_err();
        assert!(crate::is_already_exists(&err));

        cluster
            .delete_process(&process.namespace, &process.name)
            .await
            .unwrap();
        let err = cluster
            .delete_process(&process.namespace, &process.name)
            .await
            .unwrap_err();
        assert!(is_not_found(&err));
        assert!(cache
            .snapshot()
            .await
            .list_processes(&job.key(), None)
            .is_empty());

        let actions = cluster.actions().await;
        assert_eq!(actions.created_processes, vec!["default/test-trainjob-worker-0"]);
        assert_eq!(actions.deleted_processes.len(), 2);
    }

    #[tokio::test]
    async fn test_status_update_only_touches_status() {
        let cache = Arc::new(ResourceCache::new());
        let cluster = InMemoryCluster::new(cache.clone());
        let job = cluster.create_job(new_job(1, 0)).await.unwrap();

        let mut changed = job.clone();
        changed.status.phase = Some(JobPhase::Running);
        changed.spec.replica_specs.clear();
        let updated = cluster.update_job_status(&changed).await.unwrap();
        assert_eq!(updated.spec, job.spec);
        assert_eq!(updated.status.phase, Some(JobPhase::Running));
        assert_eq!(cache.get_job(&job.key()).await, Some(updated));

        cluster.delete_job(&job.key()).await.unwrap();
        let err = cluster.update_job_status(&changed).await.unwrap_err();
        assert!(is_not_found(&err));
    }

    #[tokio::test]
    async fn test_delete_job_collects_children() {
        let cache = Arc::new(ResourceCache::new());
        let cluster = InMemoryCluster::new(cache.clone());
        let job = cluster.create_job(new_job(2, 0)).await.unwrap();
        for index in 0..2 {
            cluster
                .add_process(new_process(
                    &job,
                    &ReplicaType::worker(),
                    index,
                    ProcessPhase::Running,
                ))
                .await;
        }
        cluster.delete_job(&job.key()).await.unwrap();
        assert!(cluster.list_processes().await.is_empty());
        let snapshot = cache.snapshot().await;
        assert!(snapshot.get_job(&job.key()).is_none());
        assert!(snapshot.list_processes(&job.key(), None).is_empty());
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once() {
        let cache = Arc::new(ResourceCache::new());
        let cluster = InMemoryCluster::new(cache);
        let job = cluster.create_job(new_job(1, 0)).await.unwrap();
        cluster
            .fail_next_create(ClusterError::Forbidden("quota".to_string()))
            .await;
        let process = new_process(&job, &ReplicaType::worker(), 0, ProcessPhase::Pending);
        assert!(cluster.create_process(&process).await.is_err());
        assert!(cluster.create_process(&process).await.is_ok());
    }
}
