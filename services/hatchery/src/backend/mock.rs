//! In-memory backend for tests and dry runs.
//!
//! Failures can be scripted per operation; each scripted error is returned
//! once, in order, before the backend goes back to succeeding.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hatchery_id::WorkerName;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{BackendHandle, ProvisioningBackend, WorkerSpec};
use crate::error::ProvisioningError;

/// Mock backend.
pub struct MockBackend {
    /// Counter for generating resource IDs.
    counter: AtomicU64,

    resources: Mutex<BTreeMap<WorkerName, BackendHandle>>,

    spawn_failures: Mutex<VecDeque<ProvisioningError>>,
    kill_failures: Mutex<VecDeque<ProvisioningError>>,
    list_failures: Mutex<VecDeque<ProvisioningError>>,

    /// Simulated latency of a spawn call.
    spawn_delay: Duration,

    spawn_calls: AtomicUsize,
    kill_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            resources: Mutex::new(BTreeMap::new()),
            spawn_failures: Mutex::new(VecDeque::new()),
            kill_failures: Mutex::new(VecDeque::new()),
            list_failures: Mutex::new(VecDeque::new()),
            spawn_delay: Duration::ZERO,
            spawn_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
        }
    }

    /// Make every spawn take `delay`.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    pub fn fail_next_spawn(&self, err: ProvisioningError) {
        self.spawn_failures.lock().push_back(err);
    }

    pub fn fail_next_kill(&self, err: ProvisioningError) {
        self.kill_failures.lock().push_back(err);
    }

    pub fn fail_next_list(&self, err: ProvisioningError) {
        self.list_failures.lock().push_back(err);
    }

    /// Plant a resource the hatchery does not know about.
    pub fn insert(&self, handle: BackendHandle) {
        self.resources.lock().insert(handle.name.clone(), handle);
    }

    /// Make a resource disappear behind the hatchery's back.
    pub fn remove(&self, name: &WorkerName) -> bool {
        self.resources.lock().remove(name).is_some()
    }

    pub fn contains(&self, name: &WorkerName) -> bool {
        self.resources.lock().contains_key(name)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn spawn_calls(&self) -> usize {
        self.spawn_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("mock-{:016x}", counter)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spawn(&self, spec: &WorkerSpec) -> Result<BackendHandle, ProvisioningError> {
        self.spawn_calls.fetch_add(1, Ordering::SeqCst);

        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }

        if let Some(err) = self.spawn_failures.lock().pop_front() {
            debug!(worker = %spec.name, error = %err, "[MOCK] Scripted spawn failure");
            return Err(err);
        }

        let handle = BackendHandle::new(spec.name.clone(), self.next_id());
        info!(
            worker = %spec.name,
            model = %spec.model.name,
            id = %handle.id,
            "[MOCK] Worker spawned"
        );
        self.insert(handle.clone());
        Ok(handle)
    }

    async fn list(&self) -> Result<Vec<BackendHandle>, ProvisioningError> {
        if let Some(err) = self.list_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self.resources.lock().values().cloned().collect())
    }

    async fn kill(&self, handle: &BackendHandle) -> Result<(), ProvisioningError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.kill_failures.lock().pop_front() {
            debug!(worker = %handle.name, error = %err, "[MOCK] Scripted kill failure");
            return Err(err);
        }

        let existed = self.remove(&handle.name);
        debug!(worker = %handle.name, existed, "[MOCK] Worker killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkerModel;
    use hatchery_id::WorkerId;

    fn test_spec() -> WorkerSpec {
        WorkerSpec {
            name: WorkerName::generate("test", "linux", WorkerId::new()),
            hatchery: "test".to_string(),
            model: WorkerModel::new("linux", "test:latest"),
            job: None,
            api_url: "http://localhost:8086".to_string(),
        }
    }

    #[tokio::test]
    async fn test_mock_spawn_and_list() {
        let backend = MockBackend::new();
        let spec = test_spec();

        let handle = backend.spawn(&spec).await.unwrap();
        assert_eq!(handle.name, spec.name);
        assert!(handle.id.starts_with("mock-"));

        let listed = backend.list().await.unwrap();
        assert_eq!(listed, vec![handle]);
    }

    #[tokio::test]
    async fn test_mock_kill_is_idempotent() {
        let backend = MockBackend::new();
        let handle = backend.spawn(&test_spec()).await.unwrap();

        backend.kill(&handle).await.unwrap();
        backend.kill(&handle).await.unwrap();
        assert_eq!(backend.resource_count(), 0);
        assert_eq!(backend.kill_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let backend = MockBackend::new();
        backend.fail_next_spawn(ProvisioningError::quota("no room"));

        let err = backend.spawn(&test_spec()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ProvisioningErrorKind::QuotaExceeded);
        assert_eq!(backend.resource_count(), 0);

        assert!(backend.spawn(&test_spec()).await.is_ok());
        assert_eq!(backend.spawn_calls(), 2);
    }
}
