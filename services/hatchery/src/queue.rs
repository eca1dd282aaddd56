//! Queue service boundary.
//!
//! The queue service owns the jobs. The hatchery reads pending jobs,
//! acknowledges a claim once it has reserved a worker for one, and hands the
//! claim back when the spawn fails. The service is the tie-breaker between
//! hatcheries racing for the same job: a `409 Conflict` on claim means
//! another one won.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hatchery_id::WorkerName;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::model::{JobFilter, JobId, JobRequest};

/// Queue service failure.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("queue service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("queue request timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue service unavailable: {0}")]
    Unavailable(String),
}

/// Answer to a claim acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acknowledged,

    /// Another hatchery holds the job.
    Conflict,
}

/// Operations the hatchery needs from the queue service.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Pending jobs some configured model could plausibly run.
    async fn fetch_pending_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRequest>, QueueError>;

    /// Book `job` for `worker`.
    async fn acknowledge_claim(
        &self,
        job: &JobId,
        worker: &WorkerName,
    ) -> Result<ClaimOutcome, QueueError>;

    /// Give a claim back so the job can be picked up again.
    async fn release_claim(&self, job: &JobId, worker: &WorkerName) -> Result<(), QueueError>;
}

// =============================================================================
// HTTP client
// =============================================================================

#[derive(Debug, Deserialize)]
struct PendingJobsResponse {
    #[serde(default)]
    jobs: Vec<JobRequest>,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    hatchery: &'a str,
    worker_name: &'a WorkerName,
}

/// Queue service client over HTTP.
pub struct HttpQueueClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    hatchery: String,
}

impl HttpQueueClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        hatchery: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            hatchery: hatchery.into(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn fail(response: reqwest::Response) -> QueueError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        QueueError::Status { status, body }
    }
}

#[async_trait]
impl QueueService for HttpQueueClient {
    async fn fetch_pending_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRequest>, QueueError> {
        let tags = filter.tags.iter().cloned().collect::<Vec<_>>().join(",");
        let response = self
            .request(reqwest::Method::GET, "/v1/queue/jobs")
            .query(&[("tags", tags.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }

        let body: PendingJobsResponse = response.json().await?;
        debug!(count = body.jobs.len(), "Fetched pending jobs");
        Ok(body.jobs)
    }

    async fn acknowledge_claim(
        &self,
        job: &JobId,
        worker: &WorkerName,
    ) -> Result<ClaimOutcome, QueueError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/v1/queue/jobs/{job}/claim"))
            .json(&ClaimRequest {
                hatchery: &self.hatchery,
                worker_name: worker,
            })
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(ClaimOutcome::Acknowledged),
            StatusCode::CONFLICT => Ok(ClaimOutcome::Conflict),
            _ => Err(Self::fail(response).await),
        }
    }

    async fn release_claim(&self, job: &JobId, worker: &WorkerName) -> Result<(), QueueError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/v1/queue/jobs/{job}/release"))
            .json(&ClaimRequest {
                hatchery: &self.hatchery,
                worker_name: worker,
            })
            .send()
            .await?;

        match response.status() {
            // Already released or never ours.
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(()),
            _ => Err(Self::fail(response).await),
        }
    }
}

// =============================================================================
// In-memory queue
// =============================================================================

#[derive(Debug, Clone)]
struct QueuedJob {
    request: JobRequest,
    claimed_by: Option<String>,
}

/// In-process queue for local runs and tests.
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<BTreeMap<JobId, QueuedJob>>,
    fetch_failures: Mutex<u32>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: JobRequest) {
        self.jobs.lock().insert(
            request.id.clone(),
            QueuedJob {
                request,
                claimed_by: None,
            },
        );
    }

    /// Remove a finished job.
    pub fn complete(&self, job: &JobId) -> bool {
        self.jobs.lock().remove(job).is_some()
    }

    /// Book a job for someone else.
    pub fn claim_as(&self, job: &JobId, owner: &str) {
        if let Some(queued) = self.jobs.lock().get_mut(job) {
            queued.claimed_by = Some(owner.to_string());
        }
    }

    pub fn claimed_by(&self, job: &JobId) -> Option<String> {
        self.jobs.lock().get(job).and_then(|q| q.claimed_by.clone())
    }

    /// Make the next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: u32) {
        *self.fetch_failures.lock() = count;
    }
}

#[async_trait]
impl QueueService for MemoryQueue {
    async fn fetch_pending_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRequest>, QueueError> {
        {
            let mut failures = self.fetch_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(QueueError::Unavailable("scripted failure".to_string()));
            }
        }

        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|q| q.request.requirements.tags.is_subset(&filter.tags))
            .map(|q| JobRequest {
                claimed_by: q.claimed_by.clone(),
                ..q.request.clone()
            })
            .collect())
    }

    async fn acknowledge_claim(
        &self,
        job: &JobId,
        worker: &WorkerName,
    ) -> Result<ClaimOutcome, QueueError> {
        let mut jobs = self.jobs.lock();
        let Some(queued) = jobs.get_mut(job) else {
            return Ok(ClaimOutcome::Conflict);
        };
        match &queued.claimed_by {
            Some(owner) if owner != worker.as_str() => Ok(ClaimOutcome::Conflict),
            _ => {
                queued.claimed_by = Some(worker.to_string());
                Ok(ClaimOutcome::Acknowledged)
            }
        }
    }

    async fn release_claim(&self, job: &JobId, worker: &WorkerName) -> Result<(), QueueError> {
        if let Some(queued) = self.jobs.lock().get_mut(job) {
            if queued.claimed_by.as_deref() == Some(worker.as_str()) {
                queued.claimed_by = None;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Poller
// =============================================================================

/// Keeps the latest view of pending jobs.
pub struct QueuePoller {
    queue: Arc<dyn QueueService>,
    filter: JobFilter,
    timeout: Duration,
    view: Vec<JobRequest>,
    last_success: Option<Instant>,
}

impl QueuePoller {
    pub fn new(queue: Arc<dyn QueueService>, filter: JobFilter, timeout: Duration) -> Self {
        Self {
            queue,
            filter,
            timeout,
            view: Vec::new(),
            last_success: None,
        }
    }

    /// Fetch a fresh view. On failure the previous view is kept and
    /// returned.
    pub async fn refresh(&mut self) -> &[JobRequest] {
        let fetched = match tokio::time::timeout(
            self.timeout,
            self.queue.fetch_pending_jobs(&self.filter),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(self.timeout)),
        };

        match fetched {
            Ok(jobs) => {
                self.view = jobs;
                self.last_success = Some(Instant::now());
            }
            Err(e) => {
                warn!(
                    component = "queue",
                    error = %e,
                    stale_jobs = self.view.len(),
                    "Failed to fetch pending jobs; keeping previous view"
                );
            }
        }
        &self.view
    }

    pub fn view(&self) -> &[JobRequest] {
        &self.view
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }
}
