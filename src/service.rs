use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use data_model::Job;
use metrics::{controller_metrics, queue_metrics};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use processor::{controller::Controller, reconciler::Reconciler};
use state_store::{in_memory::InMemoryCluster, ClusterClient, ResourceCache, TimeoutClient};
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::config::ControllerConfig;

pub struct Service {
    pub config: ControllerConfig,
    pub cluster: Arc<InMemoryCluster>,
    controller: Controller,
    metrics_provider: Option<SdkMeterProvider>,
}

impl Service {
    pub async fn new(config: ControllerConfig) -> Result<Self> {
        // meters created below bind to the provider installed here
        let metrics_provider = metrics::init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.telemetry.metrics_interval(),
            &config.instance_id(),
            env!("CARGO_PKG_VERSION"),
        )?;

        let cache = Arc::new(ResourceCache::new());
        let cluster = Arc::new(InMemoryCluster::new(cache.clone()));
        let client: Arc<dyn ClusterClient> =
            Arc::new(TimeoutClient::new(cluster.clone(), config.request_timeout()));
        let reconciler = Arc::new(Reconciler::new(
            cache.clone(),
            client,
            &config.service_domain,
            Arc::new(controller_metrics::Metrics::new()),
        ));
        let controller = Controller::new(
            cache,
            reconciler,
            config.queue.backoff(),
            config.resync_period(),
            Arc::new(queue_metrics::Metrics::new()),
        );

        Ok(Self {
            config,
            cluster,
            controller,
            metrics_provider,
        })
    }

    /// Runs until SIGINT or SIGTERM.
    pub async fn start(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        tokio::spawn(shutdown_signal(shutdown_tx));
        self.run(shutdown_rx).await
    }

    pub async fn run(&self, shutdown_rx: watch::Receiver<()>) -> Result<()> {
        if let Some(jobs_dir) = &self.config.jobs_dir {
            let loaded = load_jobs(&self.cluster, jobs_dir).await?;
            info!(jobs = loaded, dir = %jobs_dir.display(), "submitted job manifests");
        }
        // everything known up front is in the cache now
        self.cluster.mark_synced();

        let res = self
            .controller
            .run(self.config.worker_count, shutdown_rx)
            .await;

        if let Some(provider) = &self.metrics_provider {
            if let Err(err) = provider.shutdown() {
                error!("error shutting down meter provider: {:?}", err);
            }
        }
        res
    }
}

/// Submits every `*.yaml` / `*.yml` job manifest in `dir`, in file name
/// order. Returns the number of jobs submitted.
pub async fn load_jobs(cluster: &InMemoryCluster, dir: &Path) -> Result<usize> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("reading jobs directory {}", dir.display()))?
    {
        let path = entry?.path();
        let is_manifest = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);
        if path.is_file() && is_manifest {
            paths.push(path);
        }
    }
    paths.sort();

    for path in &paths {
        let manifest = std::fs::read_to_string(path)
            .with_context(|| format!("reading job manifest {}", path.display()))?;
        let job: Job = serde_yaml::from_str(&manifest)
            .with_context(|| format!("parsing job manifest {}", path.display()))?;
        let job = cluster.create_job(job).await?;
        info!(job = %job.key(), manifest = %path.display(), "submitted job");
    }
    Ok(paths.len())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    info!("signal received, shutting down controller gracefully");
    if shutdown_tx.send(()).is_err() {
        error!("controller already stopped");
    }
}
