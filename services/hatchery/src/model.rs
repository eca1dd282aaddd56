//! Jobs, worker models and capability matching.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to a job by the queue service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a job needs from the worker that runs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequirements {
    /// Explicit worker model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Capability tags the model must carry.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpus: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory_mb: Option<u64>,
}

/// A pending unit of work owned by the queue service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: JobId,

    #[serde(default)]
    pub requirements: JobRequirements,

    /// Execution group the job was queued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    pub queued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,

    /// Set when some hatchery has already booked the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
}

/// Template for the workers this hatchery can spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerModel {
    pub name: String,

    /// Image, template or binary reference, interpreted by the backend.
    pub image: String,

    #[serde(default = "default_os")]
    pub os: String,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default = "default_cpus")]
    pub cpus: u32,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// Bootstrap command run inside the worker.
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Warm workers to keep around in pool mode.
    #[serde(default)]
    pub provision: u32,
}

fn default_os() -> String {
    "linux".to_string()
}

fn default_cpus() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    1024
}

impl WorkerModel {
    /// Minimal model, mostly useful in tests.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            os: default_os(),
            tags: BTreeSet::new(),
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            command: Vec::new(),
            env: BTreeMap::new(),
            provision: 0,
        }
    }

    /// Configured tags plus the model's own name.
    pub fn effective_tags(&self) -> BTreeSet<String> {
        let mut tags = self.tags.clone();
        tags.insert(self.name.clone());
        tags
    }

    /// Returns true if a worker of this model can run a job with `req`.
    pub fn satisfies(&self, req: &JobRequirements) -> bool {
        if req.model.as_deref().is_some_and(|m| m != self.name) {
            return false;
        }
        if req.os.as_deref().is_some_and(|os| os != self.os) {
            return false;
        }
        if req.image.as_deref().is_some_and(|image| image != self.image) {
            return false;
        }
        if req.min_cpus.is_some_and(|cpus| cpus > self.cpus) {
            return false;
        }
        if req.min_memory_mb.is_some_and(|mb| mb > self.memory_mb) {
            return false;
        }
        req.tags
            .iter()
            .all(|tag| *tag == self.name || self.tags.contains(tag))
    }
}

/// First model, in configuration order, that satisfies the requirements.
pub fn select_model<'a>(
    models: &'a [WorkerModel],
    requirements: &JobRequirements,
) -> Option<&'a WorkerModel> {
    models.iter().find(|model| model.satisfies(requirements))
}

/// Filter sent to the queue service so it only returns jobs some model
/// could plausibly run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobFilter {
    pub tags: BTreeSet<String>,
}

impl JobFilter {
    pub fn for_models(models: &[WorkerModel]) -> Self {
        Self {
            tags: models.iter().flat_map(WorkerModel::effective_tags).collect(),
        }
    }
}

/// Whether workers serve one job or stay around for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Spawn per job, kill after the job.
    #[default]
    JobScoped,

    /// Reuse workers; finished workers go idle until the idle timeout.
    Pool,
}

impl std::str::FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "job" | "job_scoped" | "job-scoped" => Ok(Self::JobScoped),
            "pool" => Ok(Self::Pool),
            other => Err(format!("unknown worker mode '{other}' (expected 'job' or 'pool')")),
        }
    }
}
