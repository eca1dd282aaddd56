//! Local process backend.
//!
//! Each worker is a child process of the hatchery. The namespace is simply
//! the set of children this process started, so `list` never sees anything
//! belonging to another hatchery.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use hatchery_id::WorkerName;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{BackendHandle, ProvisioningBackend, WorkerSpec};
use crate::error::ProvisioningError;

/// Backend that runs workers as local child processes.
pub struct ProcessBackend {
    children: Mutex<HashMap<WorkerName, Child>>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }

    fn build_command(spec: &WorkerSpec) -> Result<Command, ProvisioningError> {
        let mut argv = if spec.model.command.is_empty() {
            vec![spec.model.image.clone()]
        } else {
            spec.model.command.clone()
        }
        .into_iter();

        let program = argv
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ProvisioningError::invalid("model has no command or image"))?;

        let mut command = Command::new(program);
        command
            .args(argv)
            .envs(spec.env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Ok(command)
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_io(err: std::io::Error) -> ProvisioningError {
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            ProvisioningError::invalid(err.to_string())
        }
        _ => ProvisioningError::transient(err.to_string()),
    }
}

#[async_trait]
impl ProvisioningBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn spawn(&self, spec: &WorkerSpec) -> Result<BackendHandle, ProvisioningError> {
        let mut command = Self::build_command(spec)?;
        let child = command.spawn().map_err(classify_io)?;

        let Some(pid) = child.id() else {
            return Err(ProvisioningError::transient("worker process exited immediately"));
        };

        info!(worker = %spec.name, pid, "Worker process started");
        self.children.lock().insert(spec.name.clone(), child);
        Ok(BackendHandle::new(spec.name.clone(), pid.to_string()))
    }

    async fn list(&self) -> Result<Vec<BackendHandle>, ProvisioningError> {
        let mut children = self.children.lock();
        let mut live = Vec::with_capacity(children.len());

        children.retain(|name, child| match child.try_wait() {
            Ok(None) => {
                if let Some(pid) = child.id() {
                    live.push(BackendHandle::new(name.clone(), pid.to_string()));
                }
                true
            }
            Ok(Some(status)) => {
                debug!(worker = %name, %status, "Worker process exited");
                false
            }
            Err(e) => {
                warn!(worker = %name, error = %e, "Unable to poll worker process");
                true
            }
        });

        Ok(live)
    }

    async fn kill(&self, handle: &BackendHandle) -> Result<(), ProvisioningError> {
        let removed = self.children.lock().remove(&handle.name);
        let Some(mut child) = removed else {
            debug!(worker = %handle.name, "Worker process already gone");
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            // InvalidInput means the process already exited.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                self.children.lock().insert(handle.name.clone(), child);
                return Err(classify_io(e));
            }
        }

        let status = child.wait().await.map_err(classify_io)?;
        info!(worker = %handle.name, %status, "Worker process killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkerModel;
    use hatchery_id::WorkerId;

    fn spec(command: &[&str]) -> WorkerSpec {
        let mut model = WorkerModel::new("local", "");
        model.command = command.iter().map(|s| s.to_string()).collect();
        WorkerSpec {
            name: WorkerName::generate("test", "local", WorkerId::new()),
            hatchery: "test".to_string(),
            model,
            job: None,
            api_url: "http://127.0.0.1:8086".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_command_is_invalid() {
        let backend = ProcessBackend::new();
        let err = backend.spawn(&spec(&[])).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ProvisioningErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_missing_binary_is_invalid() {
        let backend = ProcessBackend::new();
        let err = backend
            .spawn(&spec(&["/nonexistent/hatchery-worker"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ProvisioningErrorKind::Invalid);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_list_kill() {
        let backend = ProcessBackend::new();
        let spec = spec(&["sleep", "30"]);

        let handle = backend.spawn(&spec).await.unwrap();
        let listed = backend.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, spec.name);

        backend.kill(&handle).await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());

        // Second kill is a no-op.
        backend.kill(&handle).await.unwrap();
    }
}
