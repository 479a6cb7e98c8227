use std::collections::BTreeMap;

use anyhow::Result;
use data_model::{replica_name, EnvVar, Job, ProcessTemplate, ReplicaType, CLUSTER_SPEC_ENV};
use serde::{Deserialize, Serialize};

/// Peer-addressing document injected into every worker process.
///
/// Keys of `cluster` are lower-cased replica types; maps are ordered so the
/// serialized form is stable across syncs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterSpec {
    pub cluster: BTreeMap<String, Vec<String>>,
    pub task: TaskSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    pub index: u32,
}

impl ClusterSpec {
    pub fn new(job: &Job, rt: &ReplicaType, index: u32, service_domain: &str) -> Self {
        let port = job.port();
        let cluster = job
            .spec
            .replica_specs
            .iter()
            .filter(|(_, spec)| spec.replicas > 0)
            .map(|(rt, spec)| {
                let addresses = (0..spec.replicas)
                    .map(|i| {
                        format!(
                            "{}.{}.{}:{}",
                            replica_name(&job.name, rt, i),
                            job.namespace,
                            service_domain,
                            port
                        )
                    })
                    .collect();
                (rt.key(), addresses)
            })
            .collect();
        Self {
            cluster,
            task: TaskSpec {
                task_type: rt.key(),
                index,
            },
        }
    }
}

pub fn generate(job: &Job, rt: &ReplicaType, index: u32, service_domain: &str) -> Result<String> {
    Ok(serde_json::to_string(&ClusterSpec::new(
        job,
        rt,
        index,
        service_domain,
    ))?)
}

/// Writes the document into every container's environment, replacing a
/// previous value.
pub fn set_cluster_spec(
    template: &mut ProcessTemplate,
    job: &Job,
    rt: &ReplicaType,
    index: u32,
    service_domain: &str,
) -> Result<()> {
    let value = generate(job, rt, index, service_domain)?;
    for container in template.containers.iter_mut() {
        match container.env.iter_mut().find(|e| e.name == CLUSTER_SPEC_ENV) {
            Some(env) => env.value = value.clone(),
            None => container.env.push(EnvVar {
                name: CLUSTER_SPEC_ENV.to_string(),
                value: value.clone(),
            }),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{new_job, TEST_JOB_NAME};

    use super::*;

    const DOMAIN: &str = "svc.cluster.local";

    #[test]
    fn test_cluster_spec_single_worker() {
        let job = new_job(1, 0);
        let actual = generate(&job, &ReplicaType::worker(), 0, DOMAIN).unwrap();
        assert_eq!(
            actual,
            format!(
                r#"{{"cluster":{{"worker":["{}-worker-0.default.svc.cluster.local:2222"]}},"task":{{"type":"worker","index":0}}}}"#,
                TEST_JOB_NAME
            )
        );
    }

    #[test]
    fn test_cluster_spec_worker_and_ps() {
        let job = new_job(1, 1);
        let mut template = job.spec.replica_specs[&ReplicaType::worker()]
            .template
            .clone();
        set_cluster_spec(&mut template, &job, &ReplicaType::worker(), 0, DOMAIN).unwrap();
        assert_eq!(
            template.containers[0].env[0].value,
            format!(
                r#"{{"cluster":{{"ps":["{0}-ps-0.default.svc.cluster.local:2222"],"worker":["{0}-worker-0.default.svc.cluster.local:2222"]}},"task":{{"type":"worker","index":0}}}}"#,
                TEST_JOB_NAME
            )
        );
    }

    #[test]
    fn test_index_only_changes_task() {
        let job = new_job(3, 2);
        let first = ClusterSpec::new(&job, &ReplicaType::worker(), 0, DOMAIN);
        let again = generate(&job, &ReplicaType::worker(), 0, DOMAIN).unwrap();
        assert_eq!(serde_json::to_string(&first).unwrap(), again);

        let second = ClusterSpec::new(&job, &ReplicaType::worker(), 2, DOMAIN);
        assert_eq!(first.cluster, second.cluster);
        assert_eq!(second.task.index, 2);
        assert_eq!(first.cluster["worker"].len(), 3);
        assert_eq!(first.cluster["ps"].len(), 2);
    }

    #[test]
    fn test_zero_replica_type_is_omitted() {
        let mut job = new_job(2, 1);
        job.spec
            .replica_specs
            .get_mut(&ReplicaType::ps())
            .unwrap()
            .replicas = 0;
        let spec = ClusterSpec::new(&job, &ReplicaType::worker(), 1, DOMAIN);
        assert!(!spec.cluster.contains_key("ps"));
    }

    #[test]
    fn test_set_cluster_spec_is_idempotent() {
        let job = new_job(2, 0);
        let mut template = job.spec.replica_specs[&ReplicaType::worker()]
            .template
            .clone();
        set_cluster_spec(&mut template, &job, &ReplicaType::worker(), 1, DOMAIN).unwrap();
        let once = template.clone();
        set_cluster_spec(&mut template, &job, &ReplicaType::worker(), 1, DOMAIN).unwrap();
        assert_eq!(template, once);
        assert_eq!(template.containers[0].env.len(), 1);
        assert_eq!(template.containers[0].env[0].name, CLUSTER_SPEC_ENV);
    }
}
