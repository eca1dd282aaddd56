//! Virtual machine backend over the vSphere Automation REST API.
//!
//! Workers are clones of a template VM (the model's `image`). vCenter has no
//! label concept the REST API exposes cheaply, so the namespace is the worker
//! name itself: `list` keeps only VMs whose name was generated for this
//! hatchery and one of its models.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hatchery_id::WorkerName;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BackendHandle, ProvisioningBackend, WorkerSpec};
use crate::error::ProvisioningError;
use crate::model::WorkerModel;

const SESSION_HEADER: &str = "vmware-api-session-id";

/// Connection settings for vCenter.
#[derive(Clone, PartialEq, Eq)]
pub struct VSphereConfig {
    /// vCenter host, with or without scheme.
    pub endpoint: String,
    pub user: String,
    pub password: String,

    /// Datacenter name; empty selects the only datacenter.
    pub datacenter: Option<String>,

    /// Network name; empty selects the only network of the datacenter.
    pub network: Option<String>,
}

impl std::fmt::Debug for VSphereConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VSphereConfig")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("datacenter", &self.datacenter)
            .field("network", &self.network)
            .finish()
    }
}

impl VSphereConfig {
    fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        }
    }
}

/// vSphere backend.
pub struct VSphereBackend {
    client: reqwest::Client,
    base_url: String,
    session: String,
    hatchery: String,
    datacenter: String,
    network: String,

    /// Template VM id per model name.
    templates: HashMap<String, String>,
    models: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DatacenterSummary {
    datacenter: String,
}

#[derive(Debug, Deserialize)]
struct NetworkSummary {
    network: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct NicSummary {
    nic: String,
}

#[derive(Debug, Serialize)]
struct CloneSpec<'a> {
    name: &'a str,
    source: &'a str,
    power_on: bool,
    placement: Placement<'a>,
}

#[derive(Debug, Serialize)]
struct Placement<'a> {
    datacenter: &'a str,
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProvisioningError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(ProvisioningError::from_status(status, &body))
}

/// Pick the entry named by the operator, or the only entry when no name was
/// given.
fn pick_one<T>(what: &str, wanted: Option<&str>, mut found: Vec<T>) -> Result<T, ProvisioningError> {
    match (wanted, found.len()) {
        (_, 1) => Ok(found.remove(0)),
        (Some(name), 0) => Err(ProvisioningError::not_found(format!("{what} '{name}' not found"))),
        (None, 0) => Err(ProvisioningError::not_found(format!("no {what} available"))),
        (Some(name), n) => Err(ProvisioningError::invalid(format!(
            "{what} '{name}' is ambiguous ({n} matches)"
        ))),
        (None, n) => Err(ProvisioningError::invalid(format!(
            "{n} {what}s available, one must be configured"
        ))),
    }
}

impl VSphereBackend {
    /// Log in and resolve the datacenter, network and templates.
    pub async fn connect(
        config: &VSphereConfig,
        hatchery: &str,
        models: &[WorkerModel],
    ) -> Result<Self, ProvisioningError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProvisioningError::invalid(format!("Failed to build HTTP client: {e}")))?;
        let base_url = config.base_url();

        let response = client
            .post(format!("{base_url}/api/session"))
            .basic_auth(&config.user, Some(&config.password))
            .send()
            .await?;
        let session: String = check(response).await?.json().await?;

        let mut backend = Self {
            client,
            base_url,
            session,
            hatchery: hatchery.to_string(),
            datacenter: String::new(),
            network: String::new(),
            templates: HashMap::new(),
            models: models.iter().map(|m| m.name.clone()).collect(),
        };

        let datacenters: Vec<DatacenterSummary> = backend
            .get_json("/api/vcenter/datacenter", &name_filter(config.datacenter.as_deref()))
            .await?;
        backend.datacenter = pick_one("datacenter", config.datacenter.as_deref(), datacenters)?.datacenter;

        let mut query = name_filter(config.network.as_deref());
        query.push(("datacenters", backend.datacenter.clone()));
        let networks: Vec<NetworkSummary> = backend.get_json("/api/vcenter/network", &query).await?;
        let network = pick_one("network", config.network.as_deref(), networks)?;
        debug!(network = %network.network, kind = %network.kind, "Resolved network");
        backend.network = network.network;

        for model in models {
            let vms = backend.find_vm(&model.image).await?;
            let template = pick_one("template", Some(&model.image), vms)?;
            backend.templates.insert(model.name.clone(), template.vm);
        }

        info!(
            datacenter = %backend.datacenter,
            network = %backend.network,
            templates = backend.templates.len(),
            "vSphere session ready"
        );
        Ok(backend)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, &self.session)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProvisioningError> {
        let response = self.request(reqwest::Method::GET, path).query(query).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn find_vm(&self, name: &str) -> Result<Vec<VmSummary>, ProvisioningError> {
        self.get_json(
            "/api/vcenter/vm",
            &[
                ("names", name.to_string()),
                ("datacenters", self.datacenter.clone()),
            ],
        )
        .await
    }

    /// Attach the first NIC of a fresh clone to the configured network.
    async fn attach_network(&self, vm: &str) -> Result<(), ProvisioningError> {
        let nics: Vec<NicSummary> = self
            .get_json(&format!("/api/vcenter/vm/{vm}/hardware/ethernet"), &[])
            .await?;
        let Some(nic) = nics.first() else {
            return Err(ProvisioningError::invalid("template has no network adapter"));
        };

        let backing_type = if self.network.starts_with("dvportgroup-") {
            "DISTRIBUTED_PORTGROUP"
        } else {
            "STANDARD_PORTGROUP"
        };
        let body = serde_json::json!({
            "backing": { "type": backing_type, "network": self.network }
        });
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("/api/vcenter/vm/{vm}/hardware/ethernet/{}", nic.nic),
            )
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn power(&self, vm: &str, action: &str) -> Result<(), ProvisioningError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/api/vcenter/vm/{vm}/power"))
            .query(&[("action", action)])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn destroy(&self, vm: &str) -> Result<(), ProvisioningError> {
        // 400 means the VM is already powered off.
        match self.power(vm, "stop").await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if e.kind == crate::error::ProvisioningErrorKind::Invalid => {
                debug!(vm, error = %e, "Power off skipped");
            }
            Err(e) => return Err(e),
        }

        let response = self
            .request(reqwest::Method::DELETE, &format!("/api/vcenter/vm/{vm}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}

fn name_filter(name: Option<&str>) -> Vec<(&'static str, String)> {
    name.filter(|n| !n.is_empty())
        .map(|n| vec![("names", n.to_string())])
        .unwrap_or_default()
}

#[async_trait]
impl ProvisioningBackend for VSphereBackend {
    fn name(&self) -> &str {
        "vsphere"
    }

    async fn spawn(&self, spec: &WorkerSpec) -> Result<BackendHandle, ProvisioningError> {
        let Some(template) = self.templates.get(&spec.model.name) else {
            return Err(ProvisioningError::invalid(format!(
                "no template resolved for model '{}'",
                spec.model.name
            )));
        };

        let clone = CloneSpec {
            name: spec.name.as_str(),
            source: template,
            power_on: false,
            placement: Placement {
                datacenter: &self.datacenter,
            },
        };
        let response = self
            .request(reqwest::Method::POST, "/api/vcenter/vm")
            .query(&[("action", "clone")])
            .json(&clone)
            .send()
            .await?;
        let vm: String = check(response).await?.json().await?;

        let started = async {
            self.attach_network(&vm).await?;
            self.power(&vm, "start").await
        }
        .await;

        if let Err(e) = started {
            if let Err(cleanup) = self.destroy(&vm).await {
                warn!(worker = %spec.name, vm = %vm, error = %cleanup, "Failed to delete VM that did not start");
            }
            return Err(e);
        }

        info!(worker = %spec.name, vm = %vm, template = %template, "VM cloned and powered on");
        Ok(BackendHandle::new(spec.name.clone(), vm))
    }

    async fn list(&self) -> Result<Vec<BackendHandle>, ProvisioningError> {
        let vms: Vec<VmSummary> = self
            .get_json("/api/vcenter/vm", &[("datacenters", self.datacenter.clone())])
            .await?;

        let namespace = WorkerName::namespace(&self.hatchery);
        let handles = vms
            .into_iter()
            .filter(|vm| vm.name.starts_with(&namespace))
            .filter_map(|vm| {
                let name = WorkerName::parse(&vm.name).ok()?;
                self.models
                    .iter()
                    .any(|model| name.belongs_to(&self.hatchery, model))
                    .then(|| BackendHandle::new(name, vm.vm))
            })
            .collect::<Vec<_>>();

        debug!(count = handles.len(), "Listed VMs");
        Ok(handles)
    }

    async fn kill(&self, handle: &BackendHandle) -> Result<(), ProvisioningError> {
        let vm = if handle.id == handle.name.as_str() {
            match self.find_vm(handle.name.as_str()).await?.into_iter().next() {
                Some(found) => found.vm,
                None => {
                    debug!(worker = %handle.name, "VM already gone");
                    return Ok(());
                }
            }
        } else {
            handle.id.clone()
        };

        self.destroy(&vm).await?;
        info!(worker = %handle.name, vm = %vm, "VM destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisioningErrorKind;
    use hatchery_id::WorkerId;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> VSphereConfig {
        VSphereConfig {
            endpoint: server.uri(),
            user: "hatchery".to_string(),
            password: "s3cret".to_string(),
            datacenter: Some("dc1".to_string()),
            network: None,
        }
    }

    async fn mount_inventory(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(201).set_body_json("session-1"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vcenter/datacenter"))
            .and(query_param("names", "dc1"))
            .and(header(SESSION_HEADER, "session-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"datacenter": "datacenter-3", "name": "dc1"}
            ])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vcenter/network"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"network": "network-9", "name": "VM Network", "type": "STANDARD_PORTGROUP"}
            ])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vcenter/vm"))
            .and(query_param("names", "ubuntu-template"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"vm": "vm-10", "name": "ubuntu-template"}
            ])))
            .mount(server)
            .await;
    }

    fn models() -> Vec<WorkerModel> {
        vec![WorkerModel::new("ubuntu", "ubuntu-template")]
    }

    #[test]
    fn test_debug_hides_password() {
        let config = VSphereConfig {
            endpoint: "vcenter.local".to_string(),
            user: "u".to_string(),
            password: "hunter2".to_string(),
            datacenter: None,
            network: None,
        };
        assert!(!format!("{config:?}").contains("hunter2"));
        assert_eq!(config.base_url(), "https://vcenter.local");
    }

    #[test]
    fn test_pick_one() {
        assert_eq!(pick_one("network", None, vec![1]).unwrap(), 1);
        assert_eq!(
            pick_one::<u8>("network", Some("n"), vec![]).unwrap_err().kind,
            ProvisioningErrorKind::NotFound
        );
        assert_eq!(
            pick_one("network", None, vec![1, 2]).unwrap_err().kind,
            ProvisioningErrorKind::Invalid
        );
    }

    #[tokio::test]
    async fn test_connect_resolves_inventory() {
        let server = MockServer::start().await;
        mount_inventory(&server).await;

        let backend = VSphereBackend::connect(&config(&server), "ci", &models())
            .await
            .unwrap();
        assert_eq!(backend.datacenter, "datacenter-3");
        assert_eq!(backend.network, "network-9");
        assert_eq!(backend.templates["ubuntu"], "vm-10");
    }

    #[tokio::test]
    async fn test_connect_fails_on_missing_datacenter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(201).set_body_json("session-1"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vcenter/datacenter"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let err = VSphereBackend::connect(&config(&server), "ci", &models())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ProvisioningErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_connect_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = VSphereBackend::connect(&config(&server), "ci", &models())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ProvisioningErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_list_filters_namespace() {
        let server = MockServer::start().await;
        mount_inventory(&server).await;
        let backend = VSphereBackend::connect(&config(&server), "ci", &models())
            .await
            .unwrap();

        let ours = WorkerName::generate("ci", "ubuntu", WorkerId::new());
        let theirs = WorkerName::generate("other", "ubuntu", WorkerId::new());
        Mock::given(method("GET"))
            .and(path("/api/vcenter/vm"))
            .and(query_param("datacenters", "datacenter-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"vm": "vm-11", "name": ours.as_str()},
                {"vm": "vm-12", "name": theirs.as_str()},
                {"vm": "vm-10", "name": "ubuntu-template"},
            ])))
            .mount(&server)
            .await;

        let handles = backend.list().await.unwrap();
        assert_eq!(handles, vec![BackendHandle::new(ours, "vm-11")]);
    }

    #[tokio::test]
    async fn test_kill_by_name_when_absent() {
        let server = MockServer::start().await;
        mount_inventory(&server).await;
        let backend = VSphereBackend::connect(&config(&server), "ci", &models())
            .await
            .unwrap();

        let name = WorkerName::generate("ci", "ubuntu", WorkerId::new());
        Mock::given(method("GET"))
            .and(path("/api/vcenter/vm"))
            .and(query_param("names", name.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        backend.kill(&BackendHandle::from_name(name)).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_powers_off_then_deletes() {
        let server = MockServer::start().await;
        mount_inventory(&server).await;
        let backend = VSphereBackend::connect(&config(&server), "ci", &models())
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/api/vcenter/vm/vm-11/power"))
            .and(query_param("action", "stop"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/vcenter/vm/vm-11"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let name = WorkerName::generate("ci", "ubuntu", WorkerId::new());
        backend
            .kill(&BackendHandle::new(name, "vm-11"))
            .await
            .unwrap();
    }
}
