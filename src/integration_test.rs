#[cfg(test)]
mod tests {
    use std::{future::Future, sync::Arc, time::Duration};

    use anyhow::Result;
    use async_trait::async_trait;
    use data_model::{
        test_objects::tests::{new_job, new_process, set_restart_policy},
        JobKey,
        JobPhase,
        ProcessPhase,
        ReplicaType,
        RestartPolicy,
    };
    use metrics::queue_metrics;
    use processor::{
        controller::Controller,
        reconciler::SyncHandler,
        work_queue::ExponentialBackoff,
    };
    use state_store::{EventType, Resource, ResourceCache, ResourceEvent};
    use tokio::sync::{mpsc, watch};

    use crate::{
        config::ControllerConfig,
        service::{load_jobs, Service},
    };

    const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    struct KeyRecorder {
        keys_tx: mpsc::UnboundedSender<JobKey>,
    }

    #[async_trait]
    impl SyncHandler for KeyRecorder {
        async fn sync(&self, key: &JobKey) -> Result<bool> {
            let _ = self.keys_tx.send(key.clone());
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_process_added_triggers_sync() {
        let cache = Arc::new(ResourceCache::new());
        let job = new_job(1, 0);
        cache
            .apply(ResourceEvent::new(EventType::Added, Resource::Job(job.clone())))
            .await;
        cache.mark_synced();

        let (keys_tx, mut keys_rx) = mpsc::unbounded_channel();
        let controller = Arc::new(Controller::new(
            cache.clone(),
            Arc::new(KeyRecorder { keys_tx }),
            ExponentialBackoff::default(),
            None,
            Arc::new(queue_metrics::Metrics::new()),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let run = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run(1, shutdown_rx).await })
        };

        // initial listing
        let key = tokio::time::timeout(WAIT_TIMEOUT, keys_rx.recv()).await.unwrap();
        assert_eq!(key, Some(job.key()));

        let process = new_process(&job, &ReplicaType::worker(), 0, ProcessPhase::Pending);
        cache
            .apply(ResourceEvent::new(EventType::Added, Resource::Process(process)))
            .await;
        let key = tokio::time::timeout(WAIT_TIMEOUT, keys_rx.recv()).await.unwrap();
        assert_eq!(key, Some(job.key()));

        shutdown_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let config = ControllerConfig {
            worker_count: 2,
            ..Default::default()
        };
        let service = Arc::new(Service::new(config).await.unwrap());
        let cluster = service.cluster.clone();

        let mut job = new_job(2, 1);
        set_restart_policy(&mut job, &ReplicaType::worker(), RestartPolicy::ExitCode);
        let job = cluster.create_job(job).await.unwrap();
        let key = job.key();

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let run = {
            let service = service.clone();
            tokio::spawn(async move { service.run(shutdown_rx).await })
        };

        wait_until(|| {
            let cluster = cluster.clone();
            async move { cluster.list_processes().await.len() == 3 }
        })
        .await;
        for process in cluster.list_processes().await {
            cluster
                .set_process_phase(&process.namespace, &process.name, ProcessPhase::Running, None)
                .await
                .unwrap();
        }
        wait_until(|| {
            let (cluster, key) = (cluster.clone(), key.clone());
            async move { cluster.get_job(&key).await.unwrap().status.phase == Some(JobPhase::Running) }
        })
        .await;

        // one worker is interrupted, the rest finish normally
        cluster
            .set_process_phase(
                "default",
                "test-trainjob-worker-0",
                ProcessPhase::Failed,
                Some(130),
            )
            .await
            .unwrap();
        for name in ["test-trainjob-worker-1", "test-trainjob-ps-0"] {
            cluster
                .set_process_phase("default", name, ProcessPhase::Succeeded, Some(0))
                .await
                .unwrap();
        }
        wait_until(|| {
            let (cluster, key) = (cluster.clone(), key.clone());
            async move { cluster.get_job(&key).await.unwrap().status.phase == Some(JobPhase::Succeeded) }
        })
        .await;

        let job = cluster.get_job(&key).await.unwrap();
        let worker_status = &job.status.replica_statuses[&ReplicaType::worker()];
        assert_eq!(worker_status.succeeded, 2);
        assert_eq!(worker_status.retired.get(&0), Some(&130));
        assert!(job.status.start_time.is_some());
        assert!(job.status.completion_time.is_some());
        let phases: Vec<JobPhase> = job
            .status
            .conditions
            .iter()
            .map(|c| c.condition_type)
            .collect();
        assert_eq!(
            phases,
            vec![JobPhase::Created, JobPhase::Running, JobPhase::Succeeded]
        );

        let actions = cluster.actions().await;
        assert_eq!(actions.created_processes.len(), 3);
        assert_eq!(actions.deleted_processes, vec!["default/test-trainjob-worker-0"]);

        shutdown_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_standalone_manifests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mnist.yaml"),
            r#"
namespace: default
name: mnist
spec:
  replicaSpecs:
    Worker:
      replicas: 2
      template:
        containers:
          - name: tensorflow
            image: mnist:latest
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

        let config = ControllerConfig {
            jobs_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let service = Arc::new(Service::new(config).await.unwrap());
        let cluster = service.cluster.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let run = {
            let service = service.clone();
            tokio::spawn(async move { service.run(shutdown_rx).await })
        };

        wait_until(|| {
            let cluster = cluster.clone();
            async move { cluster.list_processes().await.len() == 2 }
        })
        .await;
        assert!(cluster.get_job(&JobKey::new("default", "mnist")).await.is_some());

        shutdown_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_load_jobs_rejects_bad_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yml"), "name: [").unwrap();
        let cluster = state_store::in_memory::InMemoryCluster::new(Arc::new(ResourceCache::new()));
        let err = load_jobs(&cluster, dir.path()).await.unwrap_err();
        assert!(format!("{:?}", err).contains("broken.yml"));
    }
}
