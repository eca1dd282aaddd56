//! Spawn decisions.
//!
//! Each tick the engine walks the pending jobs oldest first and, for every
//! job it can serve, reserves a `Starting` record and takes an in-flight
//! permit before returning. The spawn itself happens later, outside any
//! lock; the reservation is what keeps two ticks, or two concurrent
//! callers, from spawning for the same job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hatchery_id::WorkerName;
use hatchery_reconcile::{BackoffPolicy, RetryTracker, RetryVerdict};
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::governor::{Admission, ConcurrencyGovernor, DenyReason};
use crate::lifecycle::{ReserveError, WorkerLifecycleManager};
use crate::model::{select_model, JobId, JobRequest, WorkerMode, WorkerModel};

/// Delay before the first retry of a job whose spawn failed.
pub const JOB_RETRY_BASE: Duration = Duration::from_secs(15);

/// Longest delay between retries of one job.
pub const JOB_RETRY_MAX: Duration = Duration::from_secs(600);

/// Jobs not seen failing for this long are forgotten.
const JOB_RETRY_MEMORY: Duration = Duration::from_secs(3600);

/// Why a pending job produced no intent this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another hatchery already booked it.
    ClaimedElsewhere,

    /// A local worker holds the claim.
    AlreadyClaimed,

    /// A previous spawn failed and the retry delay has not elapsed.
    RetryDelay,

    NoCompatibleModel,

    /// An idle pool worker of the right model will pick it up.
    IdleWorkerAvailable,

    Denied(DenyReason),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClaimedElsewhere => f.write_str("claimed by another hatchery"),
            Self::AlreadyClaimed => f.write_str("already claimed locally"),
            Self::RetryDelay => f.write_str("waiting for retry delay"),
            Self::NoCompatibleModel => f.write_str("no compatible model"),
            Self::IdleWorkerAvailable => f.write_str("idle worker available"),
            Self::Denied(reason) => write!(f, "denied: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub job: JobId,
    pub reason: SkipReason,
}

/// An admitted spawn. The census already holds its `Starting` record.
#[derive(Debug)]
pub struct SpawnIntent {
    pub worker_name: WorkerName,
    pub model: WorkerModel,

    /// The job to claim, or none for a warm pool worker.
    pub job: Option<JobRequest>,

    /// In-flight slot, held until the spawn call returns.
    pub permit: OwnedSemaphorePermit,
}

impl SpawnIntent {
    pub fn job_id(&self) -> Option<&JobId> {
        self.job.as_ref().map(|j| &j.id)
    }
}

#[derive(Debug, Default)]
pub struct Decision {
    pub intents: Vec<SpawnIntent>,
    pub skipped: Vec<Skipped>,
}

/// Matches pending jobs to worker models under the governor's bounds.
pub struct SpawnDecisionEngine {
    models: Vec<WorkerModel>,
    mode: WorkerMode,
    manager: Arc<WorkerLifecycleManager>,
    governor: Arc<ConcurrencyGovernor>,
    retries: Mutex<RetryTracker<JobId>>,
}

impl SpawnDecisionEngine {
    pub fn new(
        models: Vec<WorkerModel>,
        mode: WorkerMode,
        manager: Arc<WorkerLifecycleManager>,
        governor: Arc<ConcurrencyGovernor>,
    ) -> Self {
        Self {
            models,
            mode,
            manager,
            governor,
            retries: Mutex::new(RetryTracker::new(
                BackoffPolicy::new(JOB_RETRY_BASE, JOB_RETRY_MAX),
                u32::MAX,
            )),
        }
    }

    pub fn models(&self) -> &[WorkerModel] {
        &self.models
    }

    /// Produce this tick's spawn intents.
    pub fn decide(&self, pending: &[JobRequest], now: Instant) -> Decision {
        let mut decision = Decision::default();
        let std_now = now.into_std();

        let mut jobs: Vec<&JobRequest> = pending.iter().collect();
        jobs.sort_by(|a, b| (a.queued_at, &a.id).cmp(&(b.queued_at, &b.id)));

        let mut available: HashMap<&str, usize> = match self.mode {
            WorkerMode::Pool => self
                .models
                .iter()
                .map(|m| (m.name.as_str(), self.manager.idle_for_model(&m.name)))
                .collect(),
            WorkerMode::JobScoped => HashMap::new(),
        };

        {
            let mut retries = self.retries.lock();
            retries.prune(std_now, JOB_RETRY_MEMORY);

            for job in jobs {
                let skip = |reason| Skipped {
                    job: job.id.clone(),
                    reason,
                };

                if self.manager.holds_claim(&job.id) {
                    decision.skipped.push(skip(SkipReason::AlreadyClaimed));
                    continue;
                }
                if job.claimed_by.is_some() {
                    decision.skipped.push(skip(SkipReason::ClaimedElsewhere));
                    continue;
                }
                if !retries.is_ready(&job.id, std_now) {
                    decision.skipped.push(skip(SkipReason::RetryDelay));
                    continue;
                }
                let Some(model) = select_model(&self.models, &job.requirements) else {
                    decision.skipped.push(skip(SkipReason::NoCompatibleModel));
                    continue;
                };
                if let Some(idle) = available.get_mut(model.name.as_str()).filter(|n| **n > 0) {
                    *idle -= 1;
                    decision.skipped.push(skip(SkipReason::IdleWorkerAvailable));
                    continue;
                }

                match self.admit(model, Some(job), now) {
                    Ok(intent) => decision.intents.push(intent),
                    Err(reason) => decision.skipped.push(skip(reason)),
                }
            }
        }

        if self.mode == WorkerMode::Pool {
            self.provision_warm(&available, now, &mut decision);
        }

        for skipped in &decision.skipped {
            debug!(job_id = %skipped.job, reason = %skipped.reason, "Job skipped");
        }
        for intent in &decision.intents {
            info!(
                worker = %intent.worker_name,
                model = %intent.model.name,
                job_id = ?intent.job_id(),
                "Spawn admitted"
            );
        }
        decision
    }

    /// Top up each model's warm pool to its `provision` target.
    fn provision_warm(
        &self,
        available: &HashMap<&str, usize>,
        now: Instant,
        decision: &mut Decision,
    ) {
        for model in self.models.iter().filter(|m| m.provision > 0) {
            let have = available.get(model.name.as_str()).copied().unwrap_or(0);
            let missing = (model.provision as usize).saturating_sub(have);

            for _ in 0..missing {
                match self.admit(model, None, now) {
                    Ok(intent) => decision.intents.push(intent),
                    Err(reason) => {
                        debug!(model = %model.name, reason = %reason, "Warm worker not admitted");
                        return;
                    }
                }
            }
        }
    }

    fn admit(
        &self,
        model: &WorkerModel,
        job: Option<&JobRequest>,
        now: Instant,
    ) -> Result<SpawnIntent, SkipReason> {
        if let Admission::Denied(reason) = self.governor.admit(1, self.manager.live_count(), now) {
            return Err(SkipReason::Denied(reason));
        }
        let Some(permit) = self.governor.try_acquire_spawn() else {
            return Err(SkipReason::Denied(DenyReason::InFlight {
                max: self.governor.status(now).max_concurrent_spawns,
            }));
        };

        let worker_name = self
            .manager
            .reserve(&model.name, job.map(|j| &j.id), now)
            .map_err(|e| match e {
                ReserveError::AlreadyClaimed(_) => SkipReason::AlreadyClaimed,
                ReserveError::Capacity { live, max } => {
                    SkipReason::Denied(DenyReason::Capacity { live, max })
                }
            })?;

        Ok(SpawnIntent {
            worker_name,
            model: model.clone(),
            job: job.cloned(),
            permit,
        })
    }

    /// A spawn for `job` failed; delay its next attempt.
    pub fn record_spawn_failure(&self, job: &JobId, now: Instant) -> RetryVerdict {
        self.retries.lock().record_failure(job, now.into_std())
    }

    /// A spawn for `job` succeeded; forget its failures.
    pub fn record_spawn_success(&self, job: &JobId) {
        self.retries.lock().clear(job);
    }
}
