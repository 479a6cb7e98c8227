pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter};

/// Kind recorded in owner references pointing at a job.
pub const JOB_KIND: &str = "TrainJob";

/// Name of the container that runs the training framework. Its exit code is
/// the one inspected by the exit-code restart policy.
pub const DEFAULT_CONTAINER_NAME: &str = "tensorflow";
pub const DEFAULT_PORT_NAME: &str = "tfjob-port";
pub const DEFAULT_PORT: u16 = 2222;

/// Environment variable carrying the peer-addressing document.
pub const CLUSTER_SPEC_ENV: &str = "TF_CONFIG";

/// Exit code of a process stopped by an operator-issued interrupt (128 +
/// SIGINT). Not treated as a failure under the exit-code policy.
pub const CLEAN_SHUTDOWN_EXIT_CODE: i32 = 130;

pub const GROUP_NAME: &str = "trainjob.dev";
pub const LABEL_GROUP_NAME: &str = "group-name";
pub const LABEL_JOB_NAME: &str = "trainjob-name";
pub const LABEL_REPLICA_TYPE: &str = "replica-type";
pub const LABEL_REPLICA_INDEX: &str = "replica-index";

/// Upper bound on one replica type's replica count.
pub const MAX_REPLICAS: u32 = 10_000;

fn default_replicas() -> u32 {
    1
}

/// Namespace-qualified job identity, rendered as `namespace/name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A role within a job, e.g. `Worker` or `PS`. The set is open; the
/// lower-cased form is used for names, labels and cluster-spec keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ReplicaType(String);

impl ReplicaType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn worker() -> Self {
        Self::new("Worker")
    }

    pub fn ps() -> Self {
        Self::new("PS")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn key(&self) -> String {
        self.0.to_lowercase()
    }
}

impl Display for ReplicaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Restart policy declared on a replica type.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, AsRefStr, EnumIter,
)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
    ExitCode,
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "")]
    Unspecified,
}

/// Restart directive understood by the orchestration layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr)]
pub enum ProcessRestartPolicy {
    Always,
    OnFailure,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub restart_policy: Option<ProcessRestartPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    pub template: ProcessTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default)]
    pub replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NoReplicaSpecs,
    EmptyReplicaType,
    DuplicateReplicaType(String),
    NoContainers(ReplicaType),
    EmptyImage {
        replica_type: ReplicaType,
        container: String,
    },
    MissingDefaultContainer(ReplicaType),
    TooManyReplicas {
        replica_type: ReplicaType,
        replicas: u32,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NoReplicaSpecs => write!(f, "job declares no replica types"),
            ValidationError::EmptyReplicaType => write!(f, "replica type name is empty"),
            ValidationError::DuplicateReplicaType(name) => {
                write!(f, "replica type {} is declared more than once", name)
            }
            ValidationError::NoContainers(rt) => {
                write!(f, "replica type {} has no containers", rt)
            }
            ValidationError::EmptyImage {
                replica_type,
                container,
            } => write!(
                f,
                "container {} of replica type {} has no image",
                container, replica_type
            ),
            ValidationError::MissingDefaultContainer(rt) => write!(
                f,
                "replica type {} has no container named {}",
                rt, DEFAULT_CONTAINER_NAME
            ),
            ValidationError::TooManyReplicas {
                replica_type,
                replicas,
            } => write!(
                f,
                "replica type {} asks for {} replicas, at most {} are allowed",
                replica_type, replicas, MAX_REPLICAS
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

impl JobSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.replica_specs.is_empty() {
            return Err(ValidationError::NoReplicaSpecs);
        }
        let mut seen = std::collections::BTreeSet::new();
        for (rt, spec) in &self.replica_specs {
            if rt.as_str().trim().is_empty() {
                return Err(ValidationError::EmptyReplicaType);
            }
            if !seen.insert(rt.key()) {
                return Err(ValidationError::DuplicateReplicaType(rt.key()));
            }
            if spec.replicas > MAX_REPLICAS {
                return Err(ValidationError::TooManyReplicas {
                    replica_type: rt.clone(),
                    replicas: spec.replicas,
                });
            }
            if spec.template.containers.is_empty() {
                return Err(ValidationError::NoContainers(rt.clone()));
            }
            if let Some(container) = spec.template.containers.iter().find(|c| c.image.is_empty()) {
                return Err(ValidationError::EmptyImage {
                    replica_type: rt.clone(),
                    container: container.name.clone(),
                });
            }
            if !spec
                .template
                .containers
                .iter()
                .any(|c| c.name == DEFAULT_CONTAINER_NAME)
            {
                return Err(ValidationError::MissingDefaultContainer(rt.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr)]
pub enum JobPhase {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

impl Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: JobPhase,
    pub reason: String,
    pub message: String,
    pub last_transition_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Indices whose terminated process was removed by the controller, with
    /// the exit code observed at removal. These indices are never recreated.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retired: BTreeMap<u32, i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub replica_statuses: BTreeMap<ReplicaType, ReplicaStatus>,
    #[serde(default)]
    pub phase: Option<JobPhase>,
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub completion_time: Option<u64>,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        self.phase.map(|p| p.is_terminal()).unwrap_or(false)
    }

    pub fn retired(&self, rt: &ReplicaType) -> BTreeMap<u32, i32> {
        self.replica_statuses
            .get(rt)
            .map(|s| s.retired.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.name)
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: JOB_KIND.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: true,
        }
    }

    /// Port every replica listens on: the default container's `tfjob-port`
    /// in the first replica type declaring one, otherwise [`DEFAULT_PORT`].
    pub fn port(&self) -> u16 {
        self.spec
            .replica_specs
            .values()
            .flat_map(|spec| spec.template.containers.iter())
            .filter(|c| c.name == DEFAULT_CONTAINER_NAME)
            .flat_map(|c| c.ports.iter())
            .find(|p| p.name == DEFAULT_PORT_NAME)
            .map(|p| p.container_port)
            .unwrap_or(DEFAULT_PORT)
    }

    /// Labels shared by every child of this job.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_GROUP_NAME.to_string(), GROUP_NAME.to_string()),
            (LABEL_JOB_NAME.to_string(), self.name.clone()),
        ])
    }

    /// Labels identifying the child for one replica type and index.
    pub fn replica_labels(&self, rt: &ReplicaType, index: u32) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.insert(LABEL_REPLICA_TYPE.to_string(), rt.key());
        labels.insert(LABEL_REPLICA_INDEX.to_string(), index.to_string());
        labels
    }
}

/// Deterministic name shared by the process and endpoint of one replica.
pub fn replica_name(job_name: &str, rt: &ReplicaType, index: u32) -> String {
    format!("{}-{}-{}", job_name, rt.key(), index)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, AsRefStr)]
pub enum ProcessPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl ProcessPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessPhase::Succeeded | ProcessPhase::Failed)
    }
}

/// Termination detail for one container of a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// One materialized replica, owned by exactly one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct WorkerProcess {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    pub template: ProcessTemplate,
    pub phase: ProcessPhase,
    pub container_statuses: Vec<ContainerStatus>,
}

impl WorkerProcessBuilder {
    pub fn build(&mut self) -> Result<WorkerProcess> {
        let namespace = self
            .namespace
            .clone()
            .ok_or(anyhow!("namespace is required"))?;
        let name = self.name.clone().ok_or(anyhow!("name is required"))?;
        let template = self
            .template
            .clone()
            .ok_or(anyhow!("template is required"))?;
        Ok(WorkerProcess {
            namespace,
            name,
            uid: self.uid.clone().unwrap_or_else(|| nanoid::nanoid!()),
            labels: self.labels.clone().unwrap_or_default(),
            owner: self.owner.clone().flatten(),
            template,
            phase: self.phase.unwrap_or_default(),
            container_statuses: self.container_statuses.clone().unwrap_or_default(),
        })
    }
}

impl WorkerProcess {
    pub fn replica_type(&self) -> Option<&str> {
        self.labels.get(LABEL_REPLICA_TYPE).map(String::as_str)
    }

    pub fn replica_index(&self) -> Option<u32> {
        self.labels
            .get(LABEL_REPLICA_INDEX)
            .and_then(|index| index.parse().ok())
    }

    pub fn owner_job_key(&self) -> Option<JobKey> {
        owner_job_key(&self.namespace, self.owner.as_ref(), &self.labels)
    }

    /// Whether this process belongs to `job` itself rather than to an earlier
    /// job of the same name. Processes without an owner reference are matched
    /// by label only.
    pub fn is_owned_by(&self, job: &Job) -> bool {
        match &self.owner {
            Some(owner) => {
                owner.kind == JOB_KIND && owner.name == job.name && owner.uid == job.uid
            }
            None => self.labels.get(LABEL_JOB_NAME) == Some(&job.name),
        }
    }

    /// Exit code of the container running the training framework, if it has
    /// terminated.
    pub fn main_container_exit_code(&self) -> Option<i32> {
        self.container_statuses
            .iter()
            .find(|c| c.name == DEFAULT_CONTAINER_NAME)
            .and_then(|c| c.exit_code)
    }
}

/// Stable network identity for one replica, selecting its process by labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct Endpoint {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    pub selector: BTreeMap<String, String>,
    pub port: u16,
}

impl EndpointBuilder {
    pub fn build(&mut self) -> Result<Endpoint> {
        let namespace = self
            .namespace
            .clone()
            .ok_or(anyhow!("namespace is required"))?;
        let name = self.name.clone().ok_or(anyhow!("name is required"))?;
        let selector = self.selector.clone().unwrap_or_default();
        Ok(Endpoint {
            namespace,
            name,
            uid: self.uid.clone().unwrap_or_else(|| nanoid::nanoid!()),
            labels: self.labels.clone().unwrap_or_else(|| selector.clone()),
            owner: self.owner.clone().flatten(),
            selector,
            port: self.port.unwrap_or(DEFAULT_PORT),
        })
    }
}

impl Endpoint {
    pub fn owner_job_key(&self) -> Option<JobKey> {
        owner_job_key(&self.namespace, self.owner.as_ref(), &self.labels)
    }
}

/// Resolves the owning job through the owner reference, falling back to the
/// job-name label when no job owner is recorded.
fn owner_job_key(
    namespace: &str,
    owner: Option<&OwnerReference>,
    labels: &BTreeMap<String, String>,
) -> Option<JobKey> {
    if let Some(owner) = owner {
        if owner.kind == JOB_KIND {
            return Some(JobKey::new(namespace, &owner.name));
        }
        return None;
    }
    labels
        .get(LABEL_JOB_NAME)
        .map(|name| JobKey::new(namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_objects::tests::{new_job, new_process, TEST_JOB_NAME, TEST_NAMESPACE};

    #[test]
    fn test_job_key_display() {
        assert_eq!(JobKey::new("default", "mnist").to_string(), "default/mnist");
    }

    #[test]
    fn test_replica_name_is_lowercased() {
        assert_eq!(
            replica_name("mnist", &ReplicaType::ps(), 3),
            "mnist-ps-3".to_string()
        );
        assert_eq!(
            replica_name("mnist", &ReplicaType::worker(), 0),
            "mnist-worker-0".to_string()
        );
    }

    #[test]
    fn test_validate() {
        let job = new_job(2, 1);
        assert!(job.spec.validate().is_ok());

        let empty = JobSpec::default();
        assert_eq!(empty.validate(), Err(ValidationError::NoReplicaSpecs));

        let mut job = new_job(1, 0);
        let spec = job
            .spec
            .replica_specs
            .get_mut(&ReplicaType::worker())
            .unwrap();
        spec.template.containers[0].name = "main".to_string();
        assert_eq!(
            job.spec.validate(),
            Err(ValidationError::MissingDefaultContainer(ReplicaType::worker()))
        );

        let mut job = new_job(1, 0);
        let spec = job.spec.replica_specs[&ReplicaType::worker()].clone();
        job.spec
            .replica_specs
            .insert(ReplicaType::new("worker"), spec);
        assert_eq!(
            job.spec.validate(),
            Err(ValidationError::DuplicateReplicaType("worker".to_string()))
        );

        let mut job = new_job(1, 0);
        job.spec
            .replica_specs
            .get_mut(&ReplicaType::worker())
            .unwrap()
            .template
            .containers
            .clear();
        assert_eq!(
            job.spec.validate(),
            Err(ValidationError::NoContainers(ReplicaType::worker()))
        );

        let job = new_job(u32::MAX, 0);
        assert_eq!(
            job.spec.validate(),
            Err(ValidationError::TooManyReplicas {
                replica_type: ReplicaType::worker(),
                replicas: u32::MAX,
            })
        );
        assert!(new_job(MAX_REPLICAS, 0).spec.validate().is_ok());
    }

    #[test]
    fn test_job_manifest_defaults() {
        let manifest = r#"
namespace: default
name: dist-mnist
spec:
  replicaSpecs:
    Worker:
      template:
        containers:
          - name: tensorflow
            image: mnist:latest
            ports:
              - name: tfjob-port
                containerPort: 3333
    PS:
      replicas: 2
      restartPolicy: ExitCode
      template:
        containers:
          - name: tensorflow
            image: mnist:latest
"#;
        let job: Job = serde_yaml::from_str(manifest).unwrap();
        let worker = &job.spec.replica_specs[&ReplicaType::worker()];
        assert_eq!(worker.replicas, 1);
        assert_eq!(worker.restart_policy, RestartPolicy::Unspecified);
        let ps = &job.spec.replica_specs[&ReplicaType::ps()];
        assert_eq!(ps.replicas, 2);
        assert_eq!(ps.restart_policy, RestartPolicy::ExitCode);
        assert_eq!(job.port(), 3333);
        assert_eq!(job.status, JobStatus::default());
    }

    #[test]
    fn test_owner_resolution_falls_back_to_labels() {
        let job = new_job(1, 0);
        let mut process = new_process(&job, &ReplicaType::worker(), 0, ProcessPhase::Running);
        assert_eq!(
            process.owner_job_key(),
            Some(JobKey::new(TEST_NAMESPACE, TEST_JOB_NAME))
        );

        process.owner = None;
        assert_eq!(
            process.owner_job_key(),
            Some(JobKey::new(TEST_NAMESPACE, TEST_JOB_NAME))
        );

        process.owner = Some(OwnerReference {
            kind: "ReplicaSet".to_string(),
            name: "other".to_string(),
            uid: "1".to_string(),
            controller: true,
        });
        assert_eq!(process.owner_job_key(), None);
    }

    #[test]
    fn test_ownership_checks_uid() {
        let job = new_job(1, 0);
        let mut process = new_process(&job, &ReplicaType::worker(), 0, ProcessPhase::Running);
        assert!(process.is_owned_by(&job));

        let mut recreated = job.clone();
        recreated.uid = "recreated-uid".to_string();
        assert!(!process.is_owned_by(&recreated));
        // still routed to the job's key so the new job gets reconciled
        assert_eq!(process.owner_job_key(), Some(recreated.key()));

        process.owner = None;
        assert!(process.is_owned_by(&recreated));
    }

    #[test]
    fn test_process_labels() {
        let job = new_job(1, 0);
        let process = new_process(&job, &ReplicaType::worker(), 4, ProcessPhase::Pending);
        assert_eq!(process.replica_type(), Some("worker"));
        assert_eq!(process.replica_index(), Some(4));
        assert_eq!(process.main_container_exit_code(), None);
    }
}
