//! Hatchery: turns queued CI jobs into ephemeral workers.
//!
//! A hatchery watches a job queue, spawns one worker per eligible job on a
//! compute backend, tracks each worker from spawn through registration and
//! heartbeats to teardown, and reconciles its census against what the
//! backend actually runs.
//!
//! ## Modules
//!
//! - `decision`: which pending jobs get a worker this tick
//! - `lifecycle`: the worker census and its state machine
//! - `governor`: capacity, in-flight and failure backoff limits
//! - `backend`: provisioning backends (mock, process, docker, vsphere)
//! - `queue`: the job queue boundary and poller
//! - `control_loop`: the tick driver tying them together
//! - `api`: worker registration and heartbeat endpoints

pub mod api;
pub mod backend;
pub mod config;
pub mod control_loop;
pub mod decision;
pub mod error;
pub mod governor;
pub mod lifecycle;
pub mod model;
pub mod queue;

pub use backend::{BackendHandle, ProvisioningBackend, WorkerSpec};
pub use config::{Config, Limits};
pub use control_loop::{MainControlLoop, TickSummary};
pub use decision::{Decision, SpawnDecisionEngine, SpawnIntent};
pub use error::{ProvisioningError, ProvisioningErrorKind};
pub use governor::ConcurrencyGovernor;
pub use lifecycle::{WorkerLifecycleManager, WorkerState};
pub use model::{JobId, JobRequest, WorkerMode, WorkerModel};
pub use queue::{QueuePoller, QueueService};
