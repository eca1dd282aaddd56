//! Provisioning backends.
//!
//! A backend executes spawn/list/kill against one compute substrate. The
//! rest of the hatchery only sees the [`ProvisioningBackend`] trait:
//!
//! - `mock`: in-memory, scripted failures (tests, dry runs)
//! - `process`: local child processes
//! - `docker`: containers through the Docker Engine API
//! - `vsphere`: virtual machines cloned from a template on vCenter
//!
//! Each backend owns its session, established once by [`connect`]. A
//! failure there is fatal to the process; everything after that is
//! reported per call as a [`ProvisioningError`].

pub mod docker;
pub mod mock;
pub mod process;
pub mod vsphere;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hatchery_id::WorkerName;
use serde::Serialize;
use tracing::info;

use crate::config::{BackendConfig, Config};
use crate::error::ProvisioningError;
use crate::model::{JobId, WorkerModel};

pub use docker::DockerBackend;
pub use mock::MockBackend;
pub use process::ProcessBackend;
pub use vsphere::VSphereBackend;

/// Reference to a resource on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BackendHandle {
    /// Worker name the resource was created with.
    pub name: WorkerName,

    /// Backend-assigned identifier (container ID, VM moref, PID).
    pub id: String,
}

impl BackendHandle {
    pub fn new(name: WorkerName, id: impl Into<String>) -> Self {
        Self {
            name,
            id: id.into(),
        }
    }

    /// Handle for a resource whose backend ID is unknown. Backends resolve
    /// it by name, so cleanup still works after a spawn that never
    /// returned a handle.
    pub fn from_name(name: WorkerName) -> Self {
        let id = name.to_string();
        Self { name, id }
    }
}

/// Everything a backend needs to create one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: WorkerName,

    /// Name of the hatchery, used to tag resources.
    pub hatchery: String,

    pub model: WorkerModel,

    /// Claimed job, or none for a pool worker.
    pub job: Option<JobId>,

    /// URL the worker registers against.
    pub api_url: String,
}

impl WorkerSpec {
    /// Environment handed to the worker process.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.model.env.clone();
        env.insert("HATCHERY_NAME".to_string(), self.hatchery.clone());
        env.insert("HATCHERY_WORKER_NAME".to_string(), self.name.to_string());
        env.insert("HATCHERY_WORKER_MODEL".to_string(), self.model.name.clone());
        env.insert("HATCHERY_API_URL".to_string(), self.api_url.clone());
        if let Some(job) = &self.job {
            env.insert("HATCHERY_JOB_ID".to_string(), job.to_string());
        }
        env
    }
}

/// Capability contract implemented by every compute backend.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Create a worker. Safe to call concurrently. Never succeeds without
    /// leaving an addressable resource.
    async fn spawn(&self, spec: &WorkerSpec) -> Result<BackendHandle, ProvisioningError>;

    /// Resources this backend holds for this hatchery, and nothing else.
    async fn list(&self) -> Result<Vec<BackendHandle>, ProvisioningError>;

    /// Destroy a worker. Killing an absent resource is not an error.
    async fn kill(&self, handle: &BackendHandle) -> Result<(), ProvisioningError>;
}

/// Establish the configured backend session.
pub async fn connect(config: &Config) -> Result<Arc<dyn ProvisioningBackend>> {
    let backend: Arc<dyn ProvisioningBackend> = match &config.backend {
        BackendConfig::Mock => Arc::new(MockBackend::new()),
        BackendConfig::Process => Arc::new(ProcessBackend::new()),
        BackendConfig::Docker { url } => Arc::new(
            DockerBackend::connect(url, &config.name)
                .await
                .context("Unable to connect to the Docker engine")?,
        ),
        BackendConfig::VSphere(vsphere) => Arc::new(
            VSphereBackend::connect(vsphere, &config.name, &config.models)
                .await
                .context("Unable to initialize the vSphere session")?,
        ),
    };

    info!(backend = backend.name(), hatchery = %config.name, "Backend session established");
    Ok(backend)
}
