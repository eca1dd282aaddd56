//! Worker lifecycle manager.
//!
//! The manager owns the census: every worker this hatchery spawned or
//! adopted, keyed by worker name. All mutation goes through the methods
//! below, each of which takes the write lock once, applies its transition
//! and releases it before returning. Nothing here awaits.

use std::collections::{HashMap, HashSet};

use hatchery_id::{WorkerId, WorkerName};
use hatchery_reconcile::{diff_inventory, BackoffPolicy, RetryVerdict};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::state::{Teardown, Timeouts, WorkerRecord, WorkerState, WorkerStatus, WorkerView};
use super::token::{generate_worker_token, hash_token};
use crate::backend::BackendHandle;
use crate::config::Limits;
use crate::model::{JobId, WorkerMode};

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReserveError {
    #[error("job {0} is already claimed by a local worker")]
    AlreadyClaimed(JobId),

    #[error("capacity exhausted ({live}/{max} workers)")]
    Capacity { live: usize, max: usize },
}

/// Rejected lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerName),

    #[error("worker {name} cannot do that while {state}")]
    InvalidState { name: WorkerName, state: WorkerState },

    #[error("worker {name} is no longer active ({state})")]
    Gone { name: WorkerName, state: WorkerState },

    #[error("worker {name} was not spawned for job {actual:?}")]
    ClaimMismatch {
        name: WorkerName,
        expected: Option<JobId>,
        actual: Option<JobId>,
    },

    #[error("worker {name} was spawned as model {expected}, not {actual}")]
    ModelMismatch {
        name: WorkerName,
        expected: String,
        actual: String,
    },

    #[error("invalid worker token")]
    Unauthorized,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Bearer token for later heartbeats. Returned exactly once.
    pub token: String,
    pub state: WorkerState,
}

/// A backend listing and the instant the list call was started.
#[derive(Debug, Clone)]
pub struct Listing {
    pub handles: Vec<BackendHandle>,
    pub listed_at: Instant,
}

/// What one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Resources to kill now. Each is marked in flight until
    /// [`WorkerLifecycleManager::kill_confirmed`] or
    /// [`WorkerLifecycleManager::kill_failed`] is called.
    pub kills: Vec<BackendHandle>,

    /// Unknown backend resources taken into the census.
    pub adopted: Vec<WorkerName>,

    /// Records whose resource disappeared without being killed.
    pub vanished: Vec<WorkerName>,

    /// Records moved to a terminal state or to `Killing` by a timeout.
    pub timed_out: Vec<WorkerName>,

    /// Records removed because the listing confirmed their resource gone.
    pub removed: Vec<WorkerName>,

    /// Jobs whose worker never registered. The claim is stale and the job
    /// should be retried after its delay.
    pub abandoned: Vec<(WorkerName, JobId)>,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        self.kills.is_empty()
            && self.adopted.is_empty()
            && self.vanished.is_empty()
            && self.timed_out.is_empty()
            && self.removed.is_empty()
            && self.abandoned.is_empty()
    }
}

/// Owner of the worker census.
pub struct WorkerLifecycleManager {
    hatchery: String,
    mode: WorkerMode,
    max_workers: usize,
    timeouts: Timeouts,
    max_kill_attempts: u32,
    kill_backoff: BackoffPolicy,

    census: RwLock<HashMap<WorkerName, WorkerRecord>>,

    /// Resources given up on after `max_kill_attempts`. Never adopted
    /// again while the backend still lists them. Locked after `census`.
    leaked: Mutex<HashSet<WorkerName>>,
}

impl WorkerLifecycleManager {
    pub fn new(hatchery: impl Into<String>, mode: WorkerMode, limits: &Limits) -> Self {
        Self {
            hatchery: hatchery.into(),
            mode,
            max_workers: limits.max_workers,
            timeouts: Timeouts {
                registration: limits.registration_timeout,
                heartbeat: limits.heartbeat_timeout,
                idle: limits.idle_timeout,
            },
            max_kill_attempts: limits.max_kill_attempts.max(1),
            kill_backoff: BackoffPolicy::new(limits.backoff_base, limits.backoff_max),
            census: RwLock::new(HashMap::new()),
            leaked: Mutex::new(HashSet::new()),
        }
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    // -------------------------------------------------------------------------
    // Spawn path
    // -------------------------------------------------------------------------

    /// Insert a `Starting` record for a new worker.
    ///
    /// The claim and capacity checks happen under the same write lock as
    /// the insert, so two callers can never both win the same job or the
    /// last slot.
    pub fn reserve(
        &self,
        model: &str,
        job: Option<&JobId>,
        now: Instant,
    ) -> Result<WorkerName, ReserveError> {
        let mut census = self.census.write();

        if let Some(job) = job {
            if census.values().any(|r| r.claim() == Some(job)) {
                return Err(ReserveError::AlreadyClaimed(job.clone()));
            }
        }

        let live = live(&census);
        if live >= self.max_workers {
            return Err(ReserveError::Capacity {
                live,
                max: self.max_workers,
            });
        }

        let name = WorkerName::generate(&self.hatchery, model, WorkerId::new());
        debug!(worker = %name, model, job_id = ?job, "Reserved worker");
        census.insert(
            name.clone(),
            WorkerRecord::starting(name.clone(), model, job.cloned(), now),
        );
        Ok(name)
    }

    /// Record the handle returned by a successful spawn.
    ///
    /// Fails if the record is gone, in which case the caller owns the
    /// resource and must kill it.
    pub fn attach_handle(
        &self,
        name: &WorkerName,
        handle: BackendHandle,
        now: Instant,
    ) -> Result<(), LifecycleError> {
        let mut census = self.census.write();
        let record = census
            .get_mut(name)
            .ok_or_else(|| LifecycleError::UnknownWorker(name.clone()))?;

        record.handle = Some(handle);
        record.settled_at = Some(now);
        Ok(())
    }

    /// Drop a reservation whose claim was lost to another hatchery.
    pub fn release(&self, name: &WorkerName) -> bool {
        let mut census = self.census.write();
        match census.get(name) {
            Some(record) if record.state == WorkerState::Starting && record.handle.is_none() => {
                census.remove(name);
                debug!(worker = %name, "Released reservation");
                true
            }
            _ => false,
        }
    }

    /// The spawn call failed; schedule cleanup of whatever it left behind.
    pub fn mark_spawn_failed(&self, name: &WorkerName, reason: &str, now: Instant) -> bool {
        let mut census = self.census.write();
        let Some(record) = census.get_mut(name) else {
            return false;
        };
        let moved = transition(record, WorkerState::SpawnFailed, now, reason);
        if moved {
            record.settled_at = Some(now);
        }
        moved
    }

    // -------------------------------------------------------------------------
    // Worker callbacks
    // -------------------------------------------------------------------------

    /// A spawned worker called back.
    pub fn register(
        &self,
        name: &WorkerName,
        job: Option<&JobId>,
        model: &str,
        now: Instant,
    ) -> Result<Registration, LifecycleError> {
        let mut census = self.census.write();
        let record = census
            .get_mut(name)
            .ok_or_else(|| LifecycleError::UnknownWorker(name.clone()))?;

        if record.state.is_terminal() {
            return Err(LifecycleError::Gone {
                name: name.clone(),
                state: record.state,
            });
        }
        if record.state != WorkerState::Starting {
            return Err(LifecycleError::InvalidState {
                name: name.clone(),
                state: record.state,
            });
        }
        if record.job.as_ref() != job {
            return Err(LifecycleError::ClaimMismatch {
                name: name.clone(),
                expected: record.job.clone(),
                actual: job.cloned(),
            });
        }
        if record.model != model {
            return Err(LifecycleError::ModelMismatch {
                name: name.clone(),
                expected: record.model.clone(),
                actual: model.to_string(),
            });
        }

        let token = generate_worker_token();
        record.token_hash = Some(hash_token(&token));
        record.last_heartbeat = now;
        transition(record, WorkerState::Registered, now, "registered");

        info!(worker = %name, job_id = ?record.job, model, "Worker registered");
        Ok(Registration {
            token,
            state: record.state,
        })
    }

    /// A registered worker reported its status.
    pub fn heartbeat(
        &self,
        name: &WorkerName,
        token: &str,
        status: WorkerStatus,
        now: Instant,
    ) -> Result<WorkerState, LifecycleError> {
        let mut census = self.census.write();
        let record = census
            .get_mut(name)
            .ok_or_else(|| LifecycleError::UnknownWorker(name.clone()))?;

        if record.token_hash.as_deref() != Some(hash_token(token).as_str()) {
            return Err(LifecycleError::Unauthorized);
        }
        if !record.state.is_running() {
            return Err(LifecycleError::Gone {
                name: name.clone(),
                state: record.state,
            });
        }

        record.last_heartbeat = now;

        let next = match (record.state, status) {
            (WorkerState::Registered | WorkerState::Idle, WorkerStatus::Building) => {
                Some(WorkerState::Busy)
            }
            (WorkerState::Busy, WorkerStatus::Waiting) => match self.mode {
                WorkerMode::Pool => Some(WorkerState::Idle),
                WorkerMode::JobScoped => Some(WorkerState::Killing),
            },
            (WorkerState::Registered, WorkerStatus::Waiting)
                if self.mode == WorkerMode::Pool && record.job.is_none() =>
            {
                Some(WorkerState::Idle)
            }
            _ => None,
        };

        if let Some(next) = next {
            if next == WorkerState::Idle {
                record.job = None;
            }
            transition(record, next, now, "heartbeat");
        }
        Ok(record.state)
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Apply timeouts, cross-check the census against a backend listing and
    /// collect the kills that are due.
    ///
    /// `listing` is `None` when the list call failed; timeouts and kill
    /// dispatch still run.
    pub fn reconcile(&self, listing: Option<&Listing>, now: Instant) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut census = self.census.write();

        for record in census.values_mut() {
            if let Some(reason) = self.expired(record, now) {
                let next = match record.state {
                    WorkerState::Starting => WorkerState::SpawnFailed,
                    WorkerState::Idle | WorkerState::Registered if reason == "idle timeout" => {
                        WorkerState::Killing
                    }
                    _ => WorkerState::Errored,
                };
                if transition(record, next, now, reason) {
                    if record.settled_at.is_none() {
                        record.settled_at = Some(now);
                    }
                    if next == WorkerState::SpawnFailed {
                        if let Some(job) = &record.job {
                            report.abandoned.push((record.name.clone(), job.clone()));
                        }
                    }
                    report.timed_out.push(record.name.clone());
                }
            }
        }

        if let Some(listing) = listing {
            self.cross_check(&mut census, listing, now, &mut report);
        }

        for record in census.values_mut() {
            if let Some(teardown) = record.teardown.as_mut() {
                if teardown.is_due(now) {
                    teardown.in_flight = true;
                    report.kills.push(record.kill_handle());
                }
            }
        }

        report.kills.sort_by(|a, b| a.name.cmp(&b.name));
        report
    }

    fn expired(&self, record: &WorkerRecord, now: Instant) -> Option<&'static str> {
        let since = |t: Instant| now.saturating_duration_since(t);
        match record.state {
            WorkerState::Starting if since(record.created_at) > self.timeouts.registration => {
                Some("registration timeout")
            }
            state if state.is_running() && since(record.last_heartbeat) > self.timeouts.heartbeat => {
                Some("heartbeat timeout")
            }
            WorkerState::Idle if since(record.state_since) > self.timeouts.idle => {
                Some("idle timeout")
            }
            WorkerState::Registered
                if self.mode == WorkerMode::Pool
                    && record.job.is_none()
                    && since(record.state_since) > self.timeouts.idle =>
            {
                Some("idle timeout")
            }
            _ => None,
        }
    }

    fn cross_check(
        &self,
        census: &mut HashMap<WorkerName, WorkerRecord>,
        listing: &Listing,
        now: Instant,
        report: &mut ReconcileReport,
    ) {
        let observed: HashMap<&WorkerName, &BackendHandle> =
            listing.handles.iter().map(|h| (&h.name, h)).collect();
        let diff = diff_inventory(census.keys().cloned(), observed.keys().map(|n| (*n).clone()));

        let mut leaked = self.leaked.lock();
        leaked.retain(|name| observed.contains_key(name));

        for name in diff.orphans {
            let Some(handle) = observed.get(&name) else {
                continue;
            };
            if leaked.contains(&name) {
                continue;
            }
            warn!(
                component = "lifecycle",
                kind = "orphan_resource",
                worker = %name,
                backend_id = %handle.id,
                "Adopting unknown backend resource for cleanup"
            );
            census.insert(name.clone(), WorkerRecord::orphan((*handle).clone(), now));
            report.adopted.push(name);
        }

        for name in diff.missing {
            let Some(record) = census.get_mut(&name) else {
                continue;
            };
            // Only trust the listing for resources that should already be
            // visible when it was taken.
            if !record.settled_at.is_some_and(|t| t < listing.listed_at) {
                continue;
            }

            match record.state {
                WorkerState::Killing => {
                    transition(record, WorkerState::Killed, now, "resource gone");
                    report.removed.push(name.clone());
                }
                state if state.is_terminal() => {
                    debug!(worker = %name, state = %state, "Backend resource confirmed gone");
                    report.removed.push(name.clone());
                }
                _ => {
                    transition(record, WorkerState::Errored, now, "backend resource vanished");
                    report.vanished.push(name.clone());
                }
            }
            census.remove(&name);
        }
    }

    /// The backend confirmed the resource is gone.
    pub fn kill_confirmed(&self, name: &WorkerName, now: Instant) -> bool {
        let mut census = self.census.write();
        let Some(record) = census.get_mut(name) else {
            return false;
        };

        match record.state {
            WorkerState::Killing => {
                transition(record, WorkerState::Killed, now, "kill confirmed");
            }
            state if state.is_terminal() => {
                debug!(worker = %name, state = %state, "Kill confirmed");
            }
            state => {
                warn!(worker = %name, state = %state, "Kill confirmation for a live worker ignored");
                return false;
            }
        }
        census.remove(name);
        true
    }

    /// A kill call failed. Schedules a retry, or gives up once the attempt
    /// budget is spent and forgets the record.
    pub fn kill_failed(&self, name: &WorkerName, reason: &str, now: Instant) -> Option<RetryVerdict> {
        let mut census = self.census.write();
        let record = census.get_mut(name)?;
        let teardown = record.teardown.as_mut()?;

        teardown.in_flight = false;
        teardown.attempts += 1;

        if teardown.attempts >= self.max_kill_attempts {
            let attempts = teardown.attempts;
            error!(
                component = "lifecycle",
                kind = "leaked_resource",
                worker = %name,
                backend_id = ?record.handle.as_ref().map(|h| &h.id),
                job_id = ?record.job,
                attempts,
                reason,
                "Giving up on killing worker; resource leaked"
            );
            census.remove(name);
            self.leaked.lock().insert(name.clone());
            return Some(RetryVerdict::Exhausted { attempts });
        }

        let delay = self.kill_backoff.delay(teardown.attempts - 1);
        teardown.not_before = now + delay;
        debug!(worker = %name, attempts = teardown.attempts, ?delay, reason, "Kill failed, will retry");
        Some(RetryVerdict::RetryAfter(delay))
    }

    /// Move every idle worker to `Killing`. Used on shutdown.
    pub fn drain_idle(&self, now: Instant) -> usize {
        let mut census = self.census.write();
        census
            .values_mut()
            .filter(|r| {
                r.state == WorkerState::Idle
                    || (r.state == WorkerState::Registered && r.job.is_none())
            })
            .map(|r| transition(r, WorkerState::Killing, now, "shutdown"))
            .filter(|moved| *moved)
            .count()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Resources abandoned after exhausting their kill attempts that the
    /// backend still reports.
    pub fn leaked_count(&self) -> usize {
        self.leaked.lock().len()
    }

    /// Number of records in a non-terminal state.
    pub fn live_count(&self) -> usize {
        live(&self.census.read())
    }

    /// Number of records, terminal ones awaiting cleanup included.
    pub fn len(&self) -> usize {
        self.census.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.census.read().is_empty()
    }

    pub fn holds_claim(&self, job: &JobId) -> bool {
        self.census.read().values().any(|r| r.claim() == Some(job))
    }

    /// Job-less workers of `model` that can take the next job.
    pub fn idle_for_model(&self, model: &str) -> usize {
        self.census
            .read()
            .values()
            .filter(|r| r.model == model && r.is_available())
            .count()
    }

    pub fn state_of(&self, name: &WorkerName) -> Option<WorkerState> {
        self.census.read().get(name).map(|r| r.state)
    }

    pub fn get(&self, name: &WorkerName, now: Instant) -> Option<WorkerView> {
        self.census.read().get(name).map(|r| r.view(now))
    }

    /// Consistent copy of the census, sorted by name.
    pub fn snapshot(&self, now: Instant) -> Vec<WorkerView> {
        let mut views: Vec<_> = self.census.read().values().map(|r| r.view(now)).collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }
}

fn live(census: &HashMap<WorkerName, WorkerRecord>) -> usize {
    census.values().filter(|r| !r.state.is_terminal()).count()
}

/// Apply a state change if the state machine allows it. Terminal states are
/// logged here, which is the only place a record can enter one.
fn transition(record: &mut WorkerRecord, next: WorkerState, now: Instant, reason: &str) -> bool {
    let from = record.state;
    if !from.can_transition_to(next) {
        debug!(worker = %record.name, from = %from, to = %next, reason, "Transition rejected");
        return false;
    }

    record.state = next;
    record.state_since = now;

    match next {
        WorkerState::SpawnFailed | WorkerState::Errored => warn!(
            component = "lifecycle",
            kind = next.as_str(),
            worker = %record.name,
            job_id = ?record.job,
            model = %record.model,
            from = %from,
            reason,
            "Worker failed"
        ),
        WorkerState::Killed => info!(
            component = "lifecycle",
            kind = next.as_str(),
            worker = %record.name,
            job_id = ?record.job,
            model = %record.model,
            "Worker killed"
        ),
        _ => debug!(worker = %record.name, from = %from, to = %next, reason, "Worker state changed"),
    }

    if matches!(
        next,
        WorkerState::Killing | WorkerState::SpawnFailed | WorkerState::Errored
    ) && record.teardown.is_none()
    {
        record.teardown = Some(Teardown::now(now));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(max_workers: usize) -> Limits {
        Limits {
            max_workers,
            registration_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            max_kill_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            ..Limits::default()
        }
    }

    fn manager(max_workers: usize) -> WorkerLifecycleManager {
        WorkerLifecycleManager::new("ci", WorkerMode::JobScoped, &limits(max_workers))
    }

    fn handle(name: &WorkerName) -> BackendHandle {
        BackendHandle::new(name.clone(), format!("id-{name}"))
    }

    #[test]
    fn test_reserve_enforces_claim_and_capacity() {
        let m = manager(2);
        let now = Instant::now();
        let job = JobId::new("1");

        m.reserve("linux", Some(&job), now).unwrap();
        assert_eq!(
            m.reserve("linux", Some(&job), now),
            Err(ReserveError::AlreadyClaimed(job.clone()))
        );

        m.reserve("linux", Some(&JobId::new("2")), now).unwrap();
        assert_eq!(
            m.reserve("linux", Some(&JobId::new("3")), now),
            Err(ReserveError::Capacity { live: 2, max: 2 })
        );
        assert!(m.holds_claim(&job));
    }

    #[test]
    fn test_release_frees_capacity() {
        let m = manager(1);
        let now = Instant::now();
        let name = m.reserve("linux", Some(&JobId::new("1")), now).unwrap();

        assert!(m.release(&name));
        assert!(m.is_empty());
        assert!(m.reserve("linux", Some(&JobId::new("1")), now).is_ok());
    }

    #[test]
    fn test_register_and_heartbeat_job_scoped() {
        let m = manager(1);
        let now = Instant::now();
        let job = JobId::new("1");
        let name = m.reserve("linux", Some(&job), now).unwrap();

        let reg = m.register(&name, Some(&job), "linux", now).unwrap();
        assert_eq!(reg.state, WorkerState::Registered);

        assert_eq!(
            m.heartbeat(&name, "wrong", WorkerStatus::Building, now),
            Err(LifecycleError::Unauthorized)
        );
        assert_eq!(
            m.heartbeat(&name, &reg.token, WorkerStatus::Building, now),
            Ok(WorkerState::Busy)
        );
        assert_eq!(
            m.heartbeat(&name, &reg.token, WorkerStatus::Waiting, now),
            Ok(WorkerState::Killing)
        );
        assert!(matches!(
            m.heartbeat(&name, &reg.token, WorkerStatus::Waiting, now),
            Err(LifecycleError::Gone { .. })
        ));
    }

    #[test]
    fn test_register_rejects_mismatch() {
        let m = manager(1);
        let now = Instant::now();
        let name = m.reserve("linux", Some(&JobId::new("1")), now).unwrap();

        assert!(matches!(
            m.register(&name, Some(&JobId::new("2")), "linux", now),
            Err(LifecycleError::ClaimMismatch { .. })
        ));
        assert!(matches!(
            m.register(&name, Some(&JobId::new("1")), "windows", now),
            Err(LifecycleError::ModelMismatch { .. })
        ));

        m.register(&name, Some(&JobId::new("1")), "linux", now).unwrap();
        assert!(matches!(
            m.register(&name, Some(&JobId::new("1")), "linux", now),
            Err(LifecycleError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_pool_worker_goes_idle_then_times_out() {
        let m = WorkerLifecycleManager::new("ci", WorkerMode::Pool, &limits(2));
        let start = Instant::now();
        let job = JobId::new("1");
        let name = m.reserve("linux", Some(&job), start).unwrap();
        let reg = m.register(&name, Some(&job), "linux", start).unwrap();

        m.heartbeat(&name, &reg.token, WorkerStatus::Building, start).unwrap();
        assert_eq!(
            m.heartbeat(&name, &reg.token, WorkerStatus::Waiting, start),
            Ok(WorkerState::Idle)
        );
        assert!(!m.holds_claim(&job));
        assert_eq!(m.idle_for_model("linux"), 1);

        // Keep heartbeating so only the idle timeout applies.
        let later = start + Duration::from_secs(121);
        m.heartbeat(&name, &reg.token, WorkerStatus::Waiting, later).unwrap();
        let report = m.reconcile(None, later);
        assert_eq!(report.timed_out, vec![name.clone()]);
        assert_eq!(report.kills.len(), 1);
        assert_eq!(m.state_of(&name), Some(WorkerState::Killing));
    }

    #[test]
    fn test_registration_timeout_kills_and_removes() {
        let m = manager(1);
        let start = Instant::now();
        let name = m.reserve("linux", Some(&JobId::new("1")), start).unwrap();
        m.attach_handle(&name, handle(&name), start).unwrap();

        assert!(m.reconcile(None, start + Duration::from_secs(30)).is_quiet());

        let report = m.reconcile(None, start + Duration::from_secs(61));
        assert_eq!(report.timed_out, vec![name.clone()]);
        assert_eq!(report.kills, vec![handle(&name)]);
        assert_eq!(report.abandoned, vec![(name.clone(), JobId::new("1"))]);
        assert_eq!(m.state_of(&name), Some(WorkerState::SpawnFailed));
        assert_eq!(m.live_count(), 0);

        // In flight: not dispatched twice.
        assert!(m.reconcile(None, start + Duration::from_secs(62)).kills.is_empty());

        assert!(m.kill_confirmed(&name, start + Duration::from_secs(62)));
        assert!(m.is_empty());
    }

    #[test]
    fn test_heartbeat_silence_errors_worker() {
        let m = manager(1);
        let start = Instant::now();
        let job = JobId::new("1");
        let name = m.reserve("linux", Some(&job), start).unwrap();
        m.register(&name, Some(&job), "linux", start).unwrap();

        let report = m.reconcile(None, start + Duration::from_secs(31));
        assert_eq!(report.timed_out, vec![name.clone()]);
        assert_eq!(m.state_of(&name), Some(WorkerState::Errored));
        assert!(!m.holds_claim(&job));
    }

    #[test]
    fn test_orphans_are_adopted_and_killed() {
        let m = manager(1);
        let now = Instant::now();
        let orphans: Vec<_> = (0..3)
            .map(|_| {
                let name = WorkerName::generate("ci", "linux", WorkerId::new());
                handle(&name)
            })
            .collect();

        let listing = Listing {
            handles: orphans.clone(),
            listed_at: now,
        };
        let report = m.reconcile(Some(&listing), now);

        assert_eq!(report.adopted.len(), 3);
        assert_eq!(report.kills.len(), 3);
        for orphan in &orphans {
            assert_eq!(m.state_of(&orphan.name), Some(WorkerState::Errored));
        }
        // Adopted orphans do not eat capacity.
        assert_eq!(m.live_count(), 0);
    }

    #[test]
    fn test_vanished_resource_is_errored_and_removed() {
        let m = manager(2);
        let start = Instant::now();
        let job = JobId::new("1");
        let name = m.reserve("linux", Some(&job), start).unwrap();
        m.attach_handle(&name, handle(&name), start).unwrap();

        // Spawn still in flight for this one: must not be treated as vanished.
        let pending = m.reserve("linux", Some(&JobId::new("2")), start).unwrap();

        let listing = Listing {
            handles: vec![],
            listed_at: start + Duration::from_secs(1),
        };
        let report = m.reconcile(Some(&listing), start + Duration::from_secs(2));

        assert_eq!(report.vanished, vec![name.clone()]);
        assert_eq!(m.state_of(&name), None);
        assert_eq!(m.state_of(&pending), Some(WorkerState::Starting));
    }

    #[test]
    fn test_listing_taken_before_spawn_returned_is_ignored() {
        let m = manager(1);
        let start = Instant::now();
        let name = m.reserve("linux", None, start).unwrap();

        let listing = Listing {
            handles: vec![],
            listed_at: start + Duration::from_secs(1),
        };
        m.attach_handle(&name, handle(&name), start + Duration::from_secs(2)).unwrap();

        let report = m.reconcile(Some(&listing), start + Duration::from_secs(3));
        assert!(report.vanished.is_empty());
        assert_eq!(m.state_of(&name), Some(WorkerState::Starting));
    }

    #[test]
    fn test_kill_failures_back_off_then_leak() {
        let m = manager(1);
        let start = Instant::now();
        let name = m.reserve("linux", None, start).unwrap();
        m.mark_spawn_failed(&name, "boom", start);

        let report = m.reconcile(None, start);
        assert_eq!(report.kills.len(), 1);

        assert_eq!(
            m.kill_failed(&name, "503", start),
            Some(RetryVerdict::RetryAfter(Duration::from_secs(1)))
        );
        assert!(m.reconcile(None, start).kills.is_empty());
        assert_eq!(m.reconcile(None, start + Duration::from_secs(1)).kills.len(), 1);

        assert_eq!(
            m.kill_failed(&name, "503", start + Duration::from_secs(1)),
            Some(RetryVerdict::RetryAfter(Duration::from_secs(2)))
        );
        m.reconcile(None, start + Duration::from_secs(3));
        assert_eq!(
            m.kill_failed(&name, "503", start + Duration::from_secs(3)),
            Some(RetryVerdict::Exhausted { attempts: 3 })
        );
        assert!(m.is_empty());
    }

    #[test]
    fn test_leaked_resource_is_not_readopted() {
        let m = manager(1);
        let start = Instant::now();
        let name = WorkerName::generate("ci", "linux", WorkerId::new());
        let listing = |at: Instant, handles: Vec<BackendHandle>| Listing {
            handles,
            listed_at: at,
        };

        let report = m.reconcile(Some(&listing(start, vec![handle(&name)])), start);
        assert_eq!(report.adopted, vec![name.clone()]);

        let mut now = start;
        let mut verdict = None;
        for _ in 0..3 {
            verdict = m.kill_failed(&name, "503", now);
            now += Duration::from_secs(8);
            m.reconcile(None, now);
        }
        assert_eq!(verdict, Some(RetryVerdict::Exhausted { attempts: 3 }));
        assert!(m.is_empty());
        assert_eq!(m.leaked_count(), 1);

        // Still listed: left alone.
        let report = m.reconcile(Some(&listing(now, vec![handle(&name)])), now);
        assert!(report.adopted.is_empty());
        assert!(report.kills.is_empty());
        assert!(m.is_empty());

        // Gone from the backend: the tombstone goes too.
        let report = m.reconcile(Some(&listing(now, vec![])), now);
        assert!(report.is_quiet());
        assert_eq!(m.leaked_count(), 0);
    }

    #[test]
    fn test_kill_confirmed_is_idempotent() {
        let m = manager(1);
        let now = Instant::now();
        let name = m.reserve("linux", None, now).unwrap();
        m.mark_spawn_failed(&name, "boom", now);

        assert!(m.kill_confirmed(&name, now));
        assert!(!m.kill_confirmed(&name, now));
        assert_eq!(m.state_of(&name), None);
    }

    #[test]
    fn test_terminal_transition_happens_once() {
        let m = manager(1);
        let now = Instant::now();
        let name = m.reserve("linux", None, now).unwrap();

        assert!(m.mark_spawn_failed(&name, "boom", now));
        assert!(!m.mark_spawn_failed(&name, "boom", now));
        assert!(matches!(
            m.register(&name, None, "linux", now),
            Err(LifecycleError::Gone { .. })
        ));
    }

    #[test]
    fn test_drain_idle() {
        let m = WorkerLifecycleManager::new("ci", WorkerMode::Pool, &limits(2));
        let now = Instant::now();
        let warm = m.reserve("linux", None, now).unwrap();
        m.register(&warm, None, "linux", now).unwrap();
        let starting = m.reserve("linux", None, now).unwrap();

        assert_eq!(m.drain_idle(now), 1);
        assert_eq!(m.state_of(&warm), Some(WorkerState::Killing));
        assert_eq!(m.state_of(&starting), Some(WorkerState::Starting));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        #[derive(Debug, Clone)]
        enum Op {
            Reserve(u8),
            Register(usize),
            Fail(usize),
            Confirm(usize),
            Advance(u64),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..6).prop_map(Op::Reserve),
                (0usize..8).prop_map(Op::Register),
                (0usize..8).prop_map(Op::Fail),
                (0usize..8).prop_map(Op::Confirm),
                (0u64..90).prop_map(Op::Advance),
            ]
        }

        proptest! {
            #[test]
            fn prop_no_double_claim_and_capacity(ops in prop::collection::vec(op(), 1..60)) {
                let m = manager(3);
                let mut now = Instant::now();
                let mut names: Vec<WorkerName> = Vec::new();

                for op in ops {
                    match op {
                        Op::Reserve(job) => {
                            if let Ok(name) = m.reserve("linux", Some(&JobId::new(job.to_string())), now) {
                                names.push(name);
                            }
                        }
                        Op::Register(i) => {
                            if let Some(name) = names.get(i) {
                                if let Some(view) = m.get(name, now) {
                                    let _ = m.register(name, view.job.as_ref(), "linux", now);
                                }
                            }
                        }
                        Op::Fail(i) => {
                            if let Some(name) = names.get(i) {
                                m.mark_spawn_failed(name, "boom", now);
                            }
                        }
                        Op::Confirm(i) => {
                            if let Some(name) = names.get(i) {
                                m.kill_confirmed(name, now);
                            }
                        }
                        Op::Advance(secs) => {
                            now += Duration::from_secs(secs);
                            m.reconcile(None, now);
                        }
                    }

                    let snapshot = m.snapshot(now);
                    let live: Vec<_> = snapshot.iter().filter(|v| !v.state.is_terminal()).collect();
                    prop_assert!(live.len() <= 3);

                    let mut claims = HashSet::new();
                    for view in &live {
                        if let Some(job) = &view.job {
                            prop_assert!(claims.insert(job.clone()), "job {} claimed twice", job);
                        }
                    }
                }
            }
        }
    }
}
