//! Container backend over the Docker Engine HTTP API.
//!
//! Containers carry a `hatchery=<name>` label; `list` filters on it so two
//! hatcheries sharing one engine never see each other's workers. Docker
//! accepts a container name wherever it accepts an ID, which is what makes
//! [`BackendHandle::from_name`] usable for cleanup.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use hatchery_id::WorkerName;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BackendHandle, ProvisioningBackend, WorkerSpec};
use crate::error::ProvisioningError;

const LABEL_HATCHERY: &str = "hatchery";
const LABEL_WORKER: &str = "hatchery.worker";
const LABEL_MODEL: &str = "hatchery.model";
const LABEL_JOB: &str = "hatchery.job";

/// Docker Engine backend.
pub struct DockerBackend {
    client: reqwest::Client,
    base_url: String,
    hatchery: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainer {
    image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cmd: Vec<String>,
    env: Vec<String>,
    labels: BTreeMap<String, String>,
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    memory: u64,
    nano_cpus: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    #[serde(default)]
    names: Vec<String>,
}

impl DockerBackend {
    /// Connect to the engine and verify it answers.
    pub async fn connect(base_url: &str, hatchery: &str) -> Result<Self, ProvisioningError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProvisioningError::invalid(format!("Failed to build HTTP client: {e}")))?;

        let backend = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            hatchery: hatchery.to_string(),
        };

        let response = backend
            .client
            .get(format!("{}/_ping", backend.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisioningError::from_status(status, &body));
        }

        Ok(backend)
    }

    fn create_body(&self, spec: &WorkerSpec) -> CreateContainer {
        let mut labels = BTreeMap::from([
            (LABEL_HATCHERY.to_string(), self.hatchery.clone()),
            (LABEL_WORKER.to_string(), spec.name.to_string()),
            (LABEL_MODEL.to_string(), spec.model.name.clone()),
        ]);
        if let Some(job) = &spec.job {
            labels.insert(LABEL_JOB.to_string(), job.to_string());
        }

        CreateContainer {
            image: spec.model.image.clone(),
            cmd: spec.model.command.clone(),
            env: spec
                .env()
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            labels,
            host_config: HostConfig {
                memory: spec.model.memory_mb * 1024 * 1024,
                nano_cpus: u64::from(spec.model.cpus) * 1_000_000_000,
            },
        }
    }

    async fn remove(&self, id: &str) -> Result<(), ProvisioningError> {
        let response = self
            .client
            .delete(format!("{}/containers/{}", self.base_url, id))
            .query(&[("force", "true"), ("v", "true")])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProvisioningError::from_status(status, &body))
    }
}

#[async_trait]
impl ProvisioningBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn spawn(&self, spec: &WorkerSpec) -> Result<BackendHandle, ProvisioningError> {
        let response = self
            .client
            .post(format!("{}/containers/create", self.base_url))
            .query(&[("name", spec.name.as_str())])
            .json(&self.create_body(spec))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisioningError::from_status(status, &body));
        }
        let created: CreateResponse = response.json().await?;

        let response = self
            .client
            .post(format!("{}/containers/{}/start", self.base_url, created.id))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if let Err(e) = self.remove(&created.id).await {
                warn!(worker = %spec.name, error = %e, "Failed to remove container that did not start");
            }
            return Err(ProvisioningError::from_status(status, &body));
        }

        info!(worker = %spec.name, container_id = %created.id, "Container started");
        Ok(BackendHandle::new(spec.name.clone(), created.id))
    }

    async fn list(&self) -> Result<Vec<BackendHandle>, ProvisioningError> {
        let filters = serde_json::json!({
            "label": [format!("{}={}", LABEL_HATCHERY, self.hatchery)]
        })
        .to_string();

        let response = self
            .client
            .get(format!("{}/containers/json", self.base_url))
            .query(&[("all", "true"), ("filters", filters.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisioningError::from_status(status, &body));
        }

        let containers: Vec<ContainerSummary> = response.json().await?;
        let handles = containers
            .into_iter()
            .filter_map(|c| {
                let raw = c.names.first()?.trim_start_matches('/').to_string();
                match WorkerName::parse(&raw) {
                    Ok(name) => Some(BackendHandle::new(name, c.id)),
                    Err(e) => {
                        warn!(container = %raw, error = %e, "Skipping container with foreign name");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        debug!(count = handles.len(), "Listed containers");
        Ok(handles)
    }

    async fn kill(&self, handle: &BackendHandle) -> Result<(), ProvisioningError> {
        self.remove(&handle.id).await?;
        info!(worker = %handle.name, container_id = %handle.id, "Container removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisioningErrorKind;
    use crate::model::{JobId, WorkerModel};
    use hatchery_id::WorkerId;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend(server: &MockServer) -> DockerBackend {
        Mock::given(method("GET"))
            .and(path("/_ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(server)
            .await;
        DockerBackend::connect(&server.uri(), "ci").await.unwrap()
    }

    fn spec() -> WorkerSpec {
        let mut model = WorkerModel::new("linux", "ghcr.io/acme/worker:1");
        model.cpus = 2;
        model.memory_mb = 512;
        WorkerSpec {
            name: WorkerName::generate("ci", "linux", WorkerId::new()),
            hatchery: "ci".to_string(),
            model,
            job: Some(JobId::new("7")),
            api_url: "http://hatchery:8086".to_string(),
        }
    }

    #[tokio::test]
    async fn test_spawn_creates_and_starts() {
        let server = MockServer::start().await;
        let backend = backend(&server).await;
        let spec = spec();

        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .and(query_param("name", spec.name.as_str()))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"Id": "abc123"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/containers/abc123/start"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let handle = backend.spawn(&spec).await.unwrap();
        assert_eq!(handle.id, "abc123");
        assert_eq!(handle.name, spec.name);
    }

    #[tokio::test]
    async fn test_create_body_labels_and_limits() {
        let server = MockServer::start().await;
        let backend = backend(&server).await;
        let body = serde_json::to_value(backend.create_body(&spec())).unwrap();

        assert_eq!(body["Labels"]["hatchery"], "ci");
        assert_eq!(body["Labels"]["hatchery.job"], "7");
        assert_eq!(body["HostConfig"]["Memory"], 512u64 * 1024 * 1024);
        assert_eq!(body["HostConfig"]["NanoCpus"], 2_000_000_000u64);
        assert!(body.get("Cmd").is_none());
    }

    #[tokio::test]
    async fn test_spawn_quota_error() {
        let server = MockServer::start().await;
        let backend = backend(&server).await;

        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = backend.spawn(&spec()).await.unwrap_err();
        assert_eq!(err.kind, ProvisioningErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_list_parses_names() {
        let server = MockServer::start().await;
        let backend = backend(&server).await;
        let name = WorkerName::generate("ci", "linux", WorkerId::new());

        Mock::given(method("GET"))
            .and(path("/containers/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Id": "c1", "Names": [format!("/{name}")]},
                {"Id": "c2", "Names": ["/Not_A_Worker"]},
            ])))
            .mount(&server)
            .await;

        let handles = backend.list().await.unwrap();
        assert_eq!(handles, vec![BackendHandle::new(name, "c1")]);
    }

    #[tokio::test]
    async fn test_kill_absent_is_ok() {
        let server = MockServer::start().await;
        let backend = backend(&server).await;

        Mock::given(method("DELETE"))
            .and(path("/containers/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let handle = BackendHandle::new(WorkerName::parse("ci-linux-x").unwrap(), "gone");
        backend.kill(&handle).await.unwrap();
    }
}
