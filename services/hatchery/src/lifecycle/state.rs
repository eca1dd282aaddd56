//! Worker states and the records the census holds.

use std::time::Duration;

use hatchery_id::WorkerName;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::BackendHandle;
use crate::model::JobId;

/// Lifecycle state of a worker.
///
/// ```text
/// Starting ──► Registered ──► Busy ──► Idle ──► Killing ──► Killed
///    │              │           │        │
///    ▼              └───────────┴────────┴──► Errored
/// SpawnFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Reserved and being spawned; waiting for the worker to register.
    Starting,
    Registered,
    Busy,
    Idle,
    Killing,
    Killed,
    SpawnFailed,
    Errored,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Registered => "registered",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Killing => "killing",
            Self::Killed => "killed",
            Self::SpawnFailed => "spawn_failed",
            Self::Errored => "errored",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Killed | Self::SpawnFailed | Self::Errored)
    }

    /// States in which the worker is expected to heartbeat.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Registered | Self::Busy | Self::Idle)
    }

    /// Returns true if the transition is part of the state machine.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Registered | SpawnFailed | Errored)
                | (Registered, Busy | Idle | Killing | Errored)
                | (Busy, Idle | Killing | Errored)
                | (Idle, Busy | Killing | Errored)
                | (Killing, Killed)
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a worker reports in its heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// No job running.
    Waiting,

    /// Running a job.
    Building,
}

/// Pending best-effort deletion of the backend resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    /// Failed kill calls so far.
    pub attempts: u32,

    /// Earliest time the next kill may be dispatched.
    pub not_before: Instant,

    /// A kill call is currently running.
    pub in_flight: bool,
}

impl Teardown {
    pub(crate) fn now(now: Instant) -> Self {
        Self {
            attempts: 0,
            not_before: now,
            in_flight: false,
        }
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        !self.in_flight && now >= self.not_before
    }
}

/// Bookkeeping for one worker. Only the lifecycle manager mutates it.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub name: WorkerName,
    pub model: String,

    /// Claimed job, or none for a warm pool worker.
    pub job: Option<JobId>,

    pub handle: Option<BackendHandle>,
    pub state: WorkerState,
    pub created_at: Instant,
    pub state_since: Instant,
    pub last_heartbeat: Instant,
    pub spawn_attempts: u32,

    /// From this instant on, a backend listing that lacks the resource
    /// means it is really gone.
    pub settled_at: Option<Instant>,

    /// The record was created from an unknown backend resource.
    pub adopted: bool,

    pub teardown: Option<Teardown>,

    pub(crate) token_hash: Option<String>,
}

impl WorkerRecord {
    pub(crate) fn starting(
        name: WorkerName,
        model: &str,
        job: Option<JobId>,
        now: Instant,
    ) -> Self {
        Self {
            name,
            model: model.to_string(),
            job,
            handle: None,
            state: WorkerState::Starting,
            created_at: now,
            state_since: now,
            last_heartbeat: now,
            spawn_attempts: 1,
            settled_at: None,
            adopted: false,
            teardown: None,
            token_hash: None,
        }
    }

    pub(crate) fn orphan(handle: BackendHandle, now: Instant) -> Self {
        Self {
            name: handle.name.clone(),
            model: String::new(),
            job: None,
            handle: Some(handle),
            state: WorkerState::Errored,
            created_at: now,
            state_since: now,
            last_heartbeat: now,
            spawn_attempts: 0,
            settled_at: Some(now),
            adopted: true,
            teardown: Some(Teardown::now(now)),
            token_hash: None,
        }
    }

    /// Job this record holds as claim. Terminal records hold none.
    pub fn claim(&self) -> Option<&JobId> {
        if self.state.is_terminal() {
            None
        } else {
            self.job.as_ref()
        }
    }

    /// A job-less worker that is, or will soon be, free to pick up work.
    pub fn is_available(&self) -> bool {
        self.job.is_none()
            && matches!(
                self.state,
                WorkerState::Starting | WorkerState::Registered | WorkerState::Idle
            )
    }

    /// Handle to kill, rebuilt from the name when the spawn never
    /// returned one.
    pub fn kill_handle(&self) -> BackendHandle {
        self.handle
            .clone()
            .unwrap_or_else(|| BackendHandle::from_name(self.name.clone()))
    }

    pub fn view(&self, now: Instant) -> WorkerView {
        WorkerView {
            name: self.name.clone(),
            model: self.model.clone(),
            job: self.job.clone(),
            state: self.state,
            backend_id: self.handle.as_ref().map(|h| h.id.clone()),
            age_secs: secs(now, self.created_at),
            heartbeat_age_secs: secs(now, self.last_heartbeat),
            spawn_attempts: self.spawn_attempts,
            kill_attempts: self.teardown.as_ref().map_or(0, |t| t.attempts),
            adopted: self.adopted,
        }
    }
}

fn secs(now: Instant, since: Instant) -> u64 {
    now.saturating_duration_since(since).as_secs()
}

/// Read-only projection of a record, safe to hand out of the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerView {
    pub name: WorkerName,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobId>,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub age_secs: u64,
    pub heartbeat_age_secs: u64,
    pub spawn_attempts: u32,
    pub kill_attempts: u32,
    pub adopted: bool,
}

/// Timeouts the manager enforces on every reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub registration: Duration,
    pub heartbeat: Duration,
    pub idle: Duration,
}
