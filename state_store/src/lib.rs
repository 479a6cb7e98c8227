use std::{fmt, future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{Endpoint, Job, WorkerProcess};

pub mod cache;
pub mod in_memory;

pub use cache::{CacheSnapshot, EventType, Resource, ResourceCache, ResourceEvent};

/// Failure categories reported by the orchestration layer's write API.
/// Carried inside `anyhow::Error`; recover with [`cluster_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    AlreadyExists(String),
    NotFound(String),
    Conflict(String),
    Invalid(String),
    Forbidden(String),
    Timeout(Duration),
    Unavailable(String),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::AlreadyExists(name) => write!(f, "{} already exists", name),
            ClusterError::NotFound(name) => write!(f, "{} not found", name),
            ClusterError::Conflict(name) => {
                write!(f, "conflicting update on {}, object was modified", name)
            }
            ClusterError::Invalid(reason) => write!(f, "invalid object: {}", reason),
            ClusterError::Forbidden(reason) => write!(f, "forbidden: {}", reason),
            ClusterError::Timeout(timeout) => {
                write!(f, "request timed out after {:?}", timeout)
            }
            ClusterError::Unavailable(reason) => write!(f, "api unavailable: {}", reason),
        }
    }
}

impl std::error::Error for ClusterError {}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Conflict(_) | ClusterError::Timeout(_) | ClusterError::Unavailable(_)
        )
    }
}

pub fn cluster_error(err: &anyhow::Error) -> Option<&ClusterError> {
    err.downcast_ref::<ClusterError>()
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(cluster_error(err), Some(ClusterError::NotFound(_)))
}

pub fn is_already_exists(err: &anyhow::Error) -> bool {
    matches!(cluster_error(err), Some(ClusterError::AlreadyExists(_)))
}

/// Write operations the controller issues against the orchestration layer.
/// Reads go through the [`ResourceCache`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_process(&self, process: &WorkerProcess) -> Result<WorkerProcess>;

    async fn delete_process(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<Endpoint>;

    /// Replaces the job's status. The job's spec is never written.
    async fn update_job_status(&self, job: &Job) -> Result<Job>;
}

/// Bounds every call to the wrapped client. An elapsed call fails with
/// [`ClusterError::Timeout`].
pub struct TimeoutClient {
    inner: Arc<dyn ClusterClient>,
    timeout: Duration,
}

impl TimeoutClient {
    pub fn new(inner: Arc<dyn ClusterClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ClusterError::Timeout(self.timeout).into()),
        }
    }
}

#[async_trait]
impl ClusterClient for TimeoutClient {
    async fn create_process(&self, process: &WorkerProcess) -> Result<WorkerProcess> {
        self.bounded(self.inner.create_process(process)).await
    }

    async fn delete_process(&self, namespace: &str, name: &str) -> Result<()> {
        self.bounded(self.inner.delete_process(namespace, name)).await
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        self.bounded(self.inner.create_endpoint(endpoint)).await
    }

    async fn update_job_status(&self, job: &Job) -> Result<Job> {
        self.bounded(self.inner.update_job_status(job)).await
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::new_job;

    use super::*;

    struct StalledClient;

    #[async_trait]
    impl ClusterClient for StalledClient {
        async fn create_process(&self, process: &WorkerProcess) -> Result<WorkerProcess> {
            Ok(process.clone())
        }

        async fn delete_process(&self, _namespace: &str, _name: &str) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<Endpoint> {
            Ok(endpoint.clone())
        }

        async fn update_job_status(&self, _job: &Job) -> Result<Job> {
            Err(ClusterError::Conflict("default/test-trainjob".to_string()).into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_client_bounds_calls() {
        let client = TimeoutClient::new(Arc::new(StalledClient), Duration::from_secs(10));

        let err = client.delete_process("default", "p").await.unwrap_err();
        assert_eq!(
            cluster_error(&err),
            Some(&ClusterError::Timeout(Duration::from_secs(10)))
        );
        assert!(cluster_error(&err).unwrap().is_retryable());

        // errors from the inner client pass through untouched
        let err = client.update_job_status(&new_job(1, 0)).await.unwrap_err();
        assert!(matches!(cluster_error(&err), Some(ClusterError::Conflict(_))));
    }

    #[test]
    fn test_error_classification() {
        let not_found: anyhow::Error = ClusterError::NotFound("p".to_string()).into();
        assert!(is_not_found(&not_found));
        assert!(!is_already_exists(&not_found));
        assert!(!ClusterError::Forbidden("denied".to_string()).is_retryable());
        assert!(!ClusterError::Invalid("bad".to_string()).is_retryable());

        let wrapped = anyhow::anyhow!("something else");
        assert!(cluster_error(&wrapped).is_none());
    }
}
