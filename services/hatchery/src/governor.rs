//! Admission control for spawns.
//!
//! The governor enforces three bounds:
//!
//! - live workers: at most `max_workers` non-terminal records
//! - in-flight spawns: at most `max_concurrent_spawns` permits handed out
//! - failure backoff: after `failure_threshold` consecutive failures of one
//!   kind inside the sliding window, admissions pause for
//!   `backoff.delay(k - threshold)`
//!
//! An `Auth` failure halts admissions until the process is restarted with
//! working credentials.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use hatchery_reconcile::BackoffPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Limits;
use crate::error::{ProvisioningError, ProvisioningErrorKind};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied(DenyReason),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Why the governor refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// The backend rejected our credentials.
    Halted,

    /// Backing off after repeated failures.
    Backoff { remaining: Duration },

    /// Live worker ceiling reached.
    Capacity { live: usize, max: usize },

    /// In-flight spawn ceiling reached.
    InFlight { max: usize },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Halted => write!(f, "backend halted"),
            Self::Backoff { remaining } => write!(f, "backing off for {remaining:?}"),
            Self::Capacity { live, max } => write!(f, "capacity exceeded ({live}/{max})"),
            Self::InFlight { max } => write!(f, "{max} spawns already in flight"),
        }
    }
}

#[derive(Debug, Default)]
struct FailureState {
    /// Kind of the current failure streak and when each failure happened.
    streak_kind: Option<ProvisioningErrorKind>,
    streak: VecDeque<Instant>,

    blocked_until: Option<Instant>,
    halted: Option<String>,
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GovernorStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    pub backoff_remaining_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ProvisioningErrorKind>,
    pub consecutive_failures: usize,
    pub spawns_in_flight: usize,
    pub max_concurrent_spawns: usize,
    pub max_workers: usize,
}

/// Concurrency and rate governor.
pub struct ConcurrencyGovernor {
    max_workers: usize,
    max_concurrent_spawns: usize,
    spawn_slots: Arc<Semaphore>,
    threshold: u32,
    window: Duration,
    backoff: BackoffPolicy,
    state: Mutex<FailureState>,
}

impl ConcurrencyGovernor {
    pub fn new(limits: &Limits) -> Self {
        Self {
            max_workers: limits.max_workers,
            max_concurrent_spawns: limits.max_concurrent_spawns,
            spawn_slots: Arc::new(Semaphore::new(limits.max_concurrent_spawns)),
            threshold: limits.failure_threshold.max(1),
            window: limits.failure_window,
            backoff: BackoffPolicy::new(limits.backoff_base, limits.backoff_max),
            state: Mutex::new(FailureState::default()),
        }
    }

    /// Decide whether `requested` more workers may be spawned while `live`
    /// workers exist.
    pub fn admit(&self, requested: usize, live: usize, now: Instant) -> Admission {
        {
            let state = self.state.lock();
            if state.halted.is_some() {
                return Admission::Denied(DenyReason::Halted);
            }
            if let Some(until) = state.blocked_until.filter(|until| *until > now) {
                return Admission::Denied(DenyReason::Backoff {
                    remaining: until - now,
                });
            }
        }

        if live + requested > self.max_workers {
            return Admission::Denied(DenyReason::Capacity {
                live,
                max: self.max_workers,
            });
        }
        if self.spawn_slots.available_permits() < requested {
            return Admission::Denied(DenyReason::InFlight {
                max: self.max_concurrent_spawns,
            });
        }
        Admission::Granted
    }

    /// Boolean form of [`ConcurrencyGovernor::admit`].
    pub fn is_allowed(&self, requested: usize, live: usize, now: Instant) -> bool {
        self.admit(requested, live, now).is_granted()
    }

    /// Take one in-flight spawn slot. Dropping the permit frees it.
    pub fn try_acquire_spawn(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.spawn_slots).try_acquire_owned().ok()
    }

    /// Count a failed provisioning call.
    pub fn record_failure(&self, err: &ProvisioningError, now: Instant) {
        let mut state = self.state.lock();

        if err.kind.is_fatal() {
            if state.halted.is_none() {
                error!(
                    component = "governor",
                    kind = %err.kind,
                    error = %err.message,
                    "Backend rejected credentials; admissions halted until restart"
                );
            }
            state.halted = Some(err.to_string());
            return;
        }
        if !err.kind.counts_toward_backoff() {
            return;
        }

        if state.streak_kind != Some(err.kind) {
            state.streak_kind = Some(err.kind);
            state.streak.clear();
        }
        state.streak.push_back(now);
        while state
            .streak
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > self.window)
        {
            state.streak.pop_front();
        }

        let consecutive = state.streak.len() as u32;
        if consecutive >= self.threshold {
            let delay = self.backoff.delay(consecutive - self.threshold);
            state.blocked_until = Some(now + delay);
            warn!(
                component = "governor",
                kind = %err.kind,
                consecutive,
                ?delay,
                "Repeated provisioning failures; pausing admissions"
            );
        }
    }

    /// Count a successful provisioning call. Clears any backoff.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.blocked_until.is_some() || !state.streak.is_empty() {
            info!(component = "governor", "Provisioning recovered");
        }
        state.streak.clear();
        state.streak_kind = None;
        state.blocked_until = None;
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halted.is_some()
    }

    pub fn status(&self, now: Instant) -> GovernorStatus {
        let state = self.state.lock();
        GovernorStatus {
            halted: state.halted.clone(),
            backoff_remaining_secs: state
                .blocked_until
                .map_or(0, |until| until.saturating_duration_since(now).as_secs()),
            failure_kind: state.streak_kind,
            consecutive_failures: state.streak.len(),
            spawns_in_flight: self.max_concurrent_spawns - self.spawn_slots.available_permits(),
            max_concurrent_spawns: self.max_concurrent_spawns,
            max_workers: self.max_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> ConcurrencyGovernor {
        ConcurrencyGovernor::new(&Limits {
            max_workers: 4,
            max_concurrent_spawns: 2,
            failure_threshold: 3,
            failure_window: Duration::from_secs(300),
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(60),
            ..Limits::default()
        })
    }

    #[test]
    fn test_capacity_and_in_flight() {
        let g = governor();
        let now = Instant::now();

        assert!(g.is_allowed(1, 3, now));
        assert_eq!(
            g.admit(1, 4, now),
            Admission::Denied(DenyReason::Capacity { live: 4, max: 4 })
        );

        let a = g.try_acquire_spawn().unwrap();
        let _b = g.try_acquire_spawn().unwrap();
        assert!(g.try_acquire_spawn().is_none());
        assert_eq!(
            g.admit(1, 0, now),
            Admission::Denied(DenyReason::InFlight { max: 2 })
        );

        drop(a);
        assert!(g.is_allowed(1, 0, now));
        assert_eq!(g.status(now).spawns_in_flight, 1);
    }

    #[test]
    fn test_quota_backoff_window() {
        let g = governor();
        let now = Instant::now();
        let quota = ProvisioningError::quota("no room");

        g.record_failure(&quota, now);
        g.record_failure(&quota, now);
        assert!(g.is_allowed(1, 0, now));

        g.record_failure(&quota, now);
        assert!(!g.is_allowed(1, 0, now));
        assert!(!g.is_allowed(1, 0, now + Duration::from_secs(9)));
        assert!(g.is_allowed(1, 0, now + Duration::from_secs(10)));
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let g = governor();
        let now = Instant::now();
        let err = ProvisioningError::transient("503");

        let mut last = Duration::ZERO;
        for k in 1..=10 {
            g.record_failure(&err, now);
            let remaining = match g.admit(1, 0, now) {
                Admission::Denied(DenyReason::Backoff { remaining }) => remaining,
                Admission::Granted => Duration::ZERO,
                other => panic!("unexpected admission {other:?} at k={k}"),
            };
            assert!(remaining >= last, "k={k}: {remaining:?} < {last:?}");
            assert!(remaining <= Duration::from_secs(60));
            last = remaining;
        }
        assert_eq!(last, Duration::from_secs(60));

        g.record_success();
        assert!(g.is_allowed(1, 0, now));
        assert_eq!(g.status(now).consecutive_failures, 0);
    }

    #[test]
    fn test_streak_resets_on_kind_change_and_window() {
        let g = governor();
        let now = Instant::now();

        g.record_failure(&ProvisioningError::quota("q"), now);
        g.record_failure(&ProvisioningError::quota("q"), now);
        g.record_failure(&ProvisioningError::transient("t"), now);
        assert!(g.is_allowed(1, 0, now));

        // Old failures slide out of the window.
        let g = governor();
        g.record_failure(&ProvisioningError::quota("q"), now);
        g.record_failure(&ProvisioningError::quota("q"), now);
        let later = now + Duration::from_secs(301);
        g.record_failure(&ProvisioningError::quota("q"), later);
        assert!(g.is_allowed(1, 0, later));
    }

    #[test]
    fn test_ignored_kinds() {
        let g = governor();
        let now = Instant::now();
        for _ in 0..5 {
            g.record_failure(&ProvisioningError::invalid("bad image"), now);
            g.record_failure(&ProvisioningError::not_found("gone"), now);
        }
        assert!(g.is_allowed(1, 0, now));
    }

    #[test]
    fn test_auth_halts_permanently() {
        let g = governor();
        let now = Instant::now();

        g.record_failure(&ProvisioningError::auth("401"), now);
        assert_eq!(g.admit(1, 0, now), Admission::Denied(DenyReason::Halted));

        g.record_success();
        assert!(g.is_halted());
        assert!(g.status(now).halted.is_some());
    }
}
