use anyhow::{anyhow, Result};
use data_model::{Endpoint, Job, JobKey, ReplicaType, WorkerProcess, LABEL_REPLICA_TYPE};
use im::{HashMap, HashSet};
use strum::AsRefStr;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Job(Job),
    Process(WorkerProcess),
    Endpoint(Endpoint),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Job(_) => "job",
            Resource::Process(_) => "process",
            Resource::Endpoint(_) => "endpoint",
        }
    }

    pub fn object_key(&self) -> String {
        match self {
            Resource::Job(job) => job.key().to_string(),
            Resource::Process(p) => object_key(&p.namespace, &p.name),
            Resource::Endpoint(e) => object_key(&e.namespace, &e.name),
        }
    }
}

/// A change notification carrying the object's current snapshot, or its
/// last known snapshot for deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub event_type: EventType,
    pub resource: Resource,
}

impl ResourceEvent {
    pub fn new(event_type: EventType, resource: Resource) -> Self {
        Self {
            event_type,
            resource,
        }
    }
}

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Point-in-time view of the mirrored objects. Cloning is cheap, so readers
/// take a snapshot and work on it without holding any lock.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    jobs: HashMap<JobKey, Job>,

    // namespace/name -> object
    processes: HashMap<String, WorkerProcess>,
    endpoints: HashMap<String, Endpoint>,

    // Reverse index by owning job
    processes_by_owner: HashMap<JobKey, HashSet<String>>,
    endpoints_by_owner: HashMap<JobKey, HashSet<String>>,
}

impl CacheSnapshot {
    pub fn get_job(&self, key: &JobKey) -> Option<&Job> {
        self.jobs.get(key)
    }

    pub fn job_keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.jobs.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Processes owned by `owner`, optionally restricted to one replica type,
    /// ordered by name.
    pub fn list_processes(&self, owner: &JobKey, rt: Option<&ReplicaType>) -> Vec<WorkerProcess> {
        let mut processes: Vec<WorkerProcess> = self
            .processes_by_owner
            .get(owner)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|key| self.processes.get(key))
            .filter(|p| matches_replica_type(p.labels.get(LABEL_REPLICA_TYPE), rt))
            .cloned()
            .collect();
        processes.sort_by(|a, b| a.name.cmp(&b.name));
        processes
    }

    pub fn list_endpoints(&self, owner: &JobKey, rt: Option<&ReplicaType>) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .endpoints_by_owner
            .get(owner)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|key| self.endpoints.get(key))
            .filter(|e| matches_replica_type(e.labels.get(LABEL_REPLICA_TYPE), rt))
            .cloned()
            .collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    fn apply(&mut self, event: &ResourceEvent) {
        match (&event.event_type, &event.resource) {
            (EventType::Deleted, Resource::Job(job)) => {
                self.jobs.remove(&job.key());
            }
            (_, Resource::Job(job)) => {
                self.jobs.insert(job.key(), job.clone());
            }
            (event_type, Resource::Process(process)) => {
                let key = object_key(&process.namespace, &process.name);
                if let Some(previous) = self.processes.remove(&key) {
                    if let Some(owner) = previous.owner_job_key() {
                        remove_from_index(&mut self.processes_by_owner, &owner, &key);
                    }
                }
                if *event_type == EventType::Deleted {
                    return;
                }
                match process.owner_job_key() {
                    Some(owner) => {
                        self.processes_by_owner
                            .entry(owner)
                            .or_default()
                            .insert(key.clone());
                    }
                    None => warn!(process = key, "process has no owning job"),
                }
                self.processes.insert(key, process.clone());
            }
            (event_type, Resource::Endpoint(endpoint)) => {
                let key = object_key(&endpoint.namespace, &endpoint.name);
                if let Some(previous) = self.endpoints.remove(&key) {
                    if let Some(owner) = previous.owner_job_key() {
                        remove_from_index(&mut self.endpoints_by_owner, &owner, &key);
                    }
                }
                if *event_type == EventType::Deleted {
                    return;
                }
                if let Some(owner) = endpoint.owner_job_key() {
                    self.endpoints_by_owner
                        .entry(owner)
                        .or_default()
                        .insert(key.clone());
                }
                self.endpoints.insert(key, endpoint.clone());
            }
        }
    }
}

fn matches_replica_type(label: Option<&String>, rt: Option<&ReplicaType>) -> bool {
    match rt {
        None => true,
        Some(rt) => label.map(|l| *l == rt.key()).unwrap_or(false),
    }
}

fn remove_from_index(index: &mut HashMap<JobKey, HashSet<String>>, owner: &JobKey, key: &str) {
    let now_empty = match index.get_mut(owner) {
        Some(keys) => {
            keys.remove(key);
            keys.is_empty()
        }
        None => false,
    };
    if now_empty {
        index.remove(owner);
    }
}

/// Watch-synchronized local mirror of jobs and their children. Only the
/// watch layer writes to it; every applied change is fanned out to
/// subscribers.
pub struct ResourceCache {
    state: RwLock<CacheSnapshot>,
    events_tx: broadcast::Sender<ResourceEvent>,
    synced_tx: watch::Sender<bool>,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCache {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (synced_tx, _) = watch::channel(false);
        Self {
            state: RwLock::new(CacheSnapshot::default()),
            events_tx,
            synced_tx,
        }
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        self.state.read().await.clone()
    }

    pub async fn get_job(&self, key: &JobKey) -> Option<Job> {
        self.state.read().await.get_job(key).cloned()
    }

    pub async fn job_keys(&self) -> Vec<JobKey> {
        self.state.read().await.job_keys()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events_tx.subscribe()
    }

    /// Applies a watch event and notifies subscribers.
    pub async fn apply(&self, event: ResourceEvent) {
        {
            let mut state = self.state.write().await;
            state.apply(&event);
        }
        debug!(
            event_type = event.event_type.as_ref(),
            kind = event.resource.kind(),
            object = event.resource.object_key(),
            "cache updated"
        );
        // No subscribers is fine, e.g. before the controller starts.
        let _ = self.events_tx.send(event);
    }

    /// Marks the initial list as complete.
    pub fn mark_synced(&self) {
        self.synced_tx.send_replace(true);
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    pub async fn wait_for_sync(&self) -> Result<()> {
        let mut rx = self.synced_tx.subscribe();
        rx.wait_for(|synced| *synced)
            .await
            .map_err(|e| anyhow!("cache sync watch closed: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{new_job, new_process},
        ProcessPhase,
    };

    use super::*;

    #[tokio::test]
    async fn test_list_processes_by_owner_and_type() {
        let cache = ResourceCache::new();
        let job = new_job(2, 1);
        let mut other_job = new_job(1, 0);
        other_job.name = "other".to_string();

        for process in [
            new_process(&job, &ReplicaType::worker(), 0, ProcessPhase::Running),
            new_process(&job, &ReplicaType::worker(), 1, ProcessPhase::Pending),
            new_process(&job, &ReplicaType::ps(), 0, ProcessPhase::Running),
            new_process(&other_job, &ReplicaType::worker(), 0, ProcessPhase::Running),
        ] {
            cache
                .apply(ResourceEvent::new(EventType::Added, Resource::Process(process)))
                .await;
        }

        let snapshot = cache.snapshot().await;
        let workers = snapshot.list_processes(&job.key(), Some(&ReplicaType::worker()));
        assert_eq!(
            workers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["test-trainjob-worker-0", "test-trainjob-worker-1"]
        );
        assert_eq!(snapshot.list_processes(&job.key(), None).len(), 3);
        assert_eq!(snapshot.list_processes(&other_job.key(), None).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_from_owner_index() {
        let cache = ResourceCache::new();
        let job = new_job(1, 0);
        let process = new_process(&job, &ReplicaType::worker(), 0, ProcessPhase::Failed);
        cache
            .apply(ResourceEvent::new(
                EventType::Added,
                Resource::Process(process.clone()),
            ))
            .await;
        cache
            .apply(ResourceEvent::new(
                EventType::Deleted,
                Resource::Process(process),
            ))
            .await;

        let snapshot = cache.snapshot().await;
        assert!(snapshot.list_processes(&job.key(), None).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_writes() {
        let cache = ResourceCache::new();
        let job = new_job(1, 0);
        let before = cache.snapshot().await;
        cache
            .apply(ResourceEvent::new(EventType::Added, Resource::Job(job.clone())))
            .await;
        assert!(before.get_job(&job.key()).is_none());
        assert_eq!(cache.get_job(&job.key()).await, Some(job));
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let cache = ResourceCache::new();
        let mut rx = cache.subscribe();
        let job = new_job(1, 0);
        cache
            .apply(ResourceEvent::new(EventType::Added, Resource::Job(job.clone())))
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Added);
        assert_eq!(event.resource, Resource::Job(job));
    }

    #[tokio::test]
    async fn test_wait_for_sync() {
        let cache = std::sync::Arc::new(ResourceCache::new());
        assert!(!cache.has_synced());
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_for_sync().await })
        };
        cache.mark_synced();
        waiter.await.unwrap().unwrap();
        assert!(cache.has_synced());
    }
}
