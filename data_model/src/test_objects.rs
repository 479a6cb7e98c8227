pub mod tests {
    use std::collections::BTreeMap;

    use crate::{
        replica_name,
        Container,
        ContainerPort,
        ContainerStatus,
        Job,
        JobSpec,
        JobStatus,
        ProcessPhase,
        ProcessTemplate,
        ReplicaSpec,
        ReplicaType,
        RestartPolicy,
        WorkerProcess,
        WorkerProcessBuilder,
        DEFAULT_CONTAINER_NAME,
        DEFAULT_PORT,
        DEFAULT_PORT_NAME,
    };

    pub const TEST_NAMESPACE: &str = "default";
    pub const TEST_JOB_NAME: &str = "test-trainjob";
    pub const TEST_JOB_UID: &str = "test-trainjob-uid";
    pub const TEST_IMAGE: &str = "trainjob/mnist:1.0";

    pub fn default_template() -> ProcessTemplate {
        ProcessTemplate {
            labels: BTreeMap::new(),
            containers: vec![Container {
                name: DEFAULT_CONTAINER_NAME.to_string(),
                image: TEST_IMAGE.to_string(),
                ports: vec![ContainerPort {
                    name: DEFAULT_PORT_NAME.to_string(),
                    container_port: DEFAULT_PORT,
                }],
                ..Default::default()
            }],
            restart_policy: None,
        }
    }

    pub fn replica_spec(replicas: u32, restart_policy: RestartPolicy) -> ReplicaSpec {
        ReplicaSpec {
            replicas,
            restart_policy,
            template: default_template(),
        }
    }

    /// A job with `workers` Worker replicas and, when non-zero, `ps` PS
    /// replicas.
    pub fn new_job(workers: u32, ps: u32) -> Job {
        let mut replica_specs = BTreeMap::new();
        replica_specs.insert(
            ReplicaType::worker(),
            replica_spec(workers, RestartPolicy::Never),
        );
        if ps > 0 {
            replica_specs.insert(ReplicaType::ps(), replica_spec(ps, RestartPolicy::Never));
        }
        Job {
            namespace: TEST_NAMESPACE.to_string(),
            name: TEST_JOB_NAME.to_string(),
            uid: TEST_JOB_UID.to_string(),
            spec: JobSpec { replica_specs },
            status: JobStatus::default(),
        }
    }

    pub fn set_restart_policy(job: &mut Job, rt: &ReplicaType, policy: RestartPolicy) {
        if let Some(spec) = job.spec.replica_specs.get_mut(rt) {
            spec.restart_policy = policy;
        }
    }

    pub fn new_process(job: &Job, rt: &ReplicaType, index: u32, phase: ProcessPhase) -> WorkerProcess {
        WorkerProcessBuilder::default()
            .namespace(job.namespace.clone())
            .name(replica_name(&job.name, rt, index))
            .labels(job.replica_labels(rt, index))
            .owner(Some(job.owner_reference()))
            .template(default_template())
            .phase(phase)
            .build()
            .unwrap()
    }

    pub fn with_exit_code(mut process: WorkerProcess, exit_code: i32) -> WorkerProcess {
        process.container_statuses = vec![ContainerStatus {
            name: DEFAULT_CONTAINER_NAME.to_string(),
            exit_code: Some(exit_code),
        }];
        process
    }
}
