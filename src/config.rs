use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use processor::work_queue::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "TRAINJOB_";

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_service_domain() -> String {
    "svc.cluster.local".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    1000
}

fn default_metrics_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    /// Number of concurrent reconciliation workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Suffix of replica addresses, `<replica>.<namespace>.<service_domain>`.
    #[serde(default = "default_service_domain")]
    pub service_domain: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Re-enqueue every job on this period. 0 disables it.
    #[serde(default)]
    pub resync_period_secs: u64,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Job manifests submitted at startup.
    #[serde(default)]
    pub jobs_dir: Option<PathBuf>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            env: default_env(),
            worker_count: default_worker_count(),
            service_domain: default_service_domain(),
            request_timeout_secs: default_request_timeout_secs(),
            resync_period_secs: 0,
            queue: Default::default(),
            jobs_dir: None,
            telemetry: Default::default(),
        }
    }
}

impl ControllerConfig {
    /// Defaults, overlaid by the YAML file at `path` and then by
    /// `TRAINJOB_` environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<ControllerConfig> {
        let mut figment = Figment::from(Serialized::defaults(ControllerConfig::default()));
        if let Some(path) = path {
            let config_str = std::fs::read_to_string(path)
                .map_err(|e| anyhow!("unable to read config file {}: {}", path.display(), e))?;
            figment = figment.merge(Yaml::string(&config_str));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn from_figment(figment: Figment) -> Result<ControllerConfig> {
        let config: ControllerConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(anyhow!("worker_count must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than 0"));
        }
        if self.service_domain.trim().is_empty() {
            return Err(anyhow!("service_domain must not be empty"));
        }
        if self.queue.base_delay_ms == 0 {
            return Err(anyhow!("queue.base_delay_ms must be greater than 0"));
        }
        if Duration::from_millis(self.queue.base_delay_ms) >
            Duration::from_secs(self.queue.max_delay_secs)
        {
            return Err(anyhow!(
                "queue.base_delay_ms must not exceed queue.max_delay_secs"
            ));
        }
        if self.telemetry.metrics_interval_secs == 0 {
            return Err(anyhow!(
                "telemetry.metrics_interval_secs must be greater than 0"
            ));
        }
        Ok(())
    }

    /// Applies command line overrides and re-validates.
    pub fn with_overrides(mut self, jobs_dir: Option<PathBuf>, workers: Option<usize>) -> Result<Self> {
        if let Some(jobs_dir) = jobs_dir {
            self.jobs_dir = Some(jobs_dir);
        }
        if let Some(workers) = workers {
            self.worker_count = workers;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resync_period(&self) -> Option<Duration> {
        match self.resync_period_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl QueueConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_secs(self.max_delay_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    // Used as the metric attribute "trainjob.instance.id".
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval_secs: default_metrics_interval_secs(),
            instance_id: None,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}
