//! Reconciliation primitives.
//!
//! Helpers for loops that converge what a process believes exists (its
//! census) with what a remote system reports (its inventory). Key concepts:
//!
//! - **Inventory diff**: set difference between the census and a listing.
//! - **Backoff**: exponential, capped delays between attempts.
//! - **Retry tracking**: per-key attempt counters with a not-before time.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs and clock readings
//!   (jitter is opt-in)
//! - Backoff delays are non-decreasing in the attempt number
//! - Callers pass the clock in; nothing here reads the time on its own

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rand::Rng;

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first attempt.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0). Zero keeps delays deterministic.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Creates a deterministic policy.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Returns the policy with jitter enabled.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for the given attempt number (0-based).
    ///
    /// Without jitter the result is `min(base * 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.max);

        if self.jitter <= 0.0 {
            return delay;
        }

        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

// =============================================================================
// Retry tracking
// =============================================================================

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Try again once the delay has elapsed.
    RetryAfter(Duration),

    /// The attempt budget is spent.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
struct RetryEntry {
    attempts: u32,
    last_failure: Instant,
    not_before: Instant,
}

/// Per-key retry tracker with exponential delays.
#[derive(Debug, Clone)]
pub struct RetryTracker<K: Ord> {
    policy: BackoffPolicy,

    /// Failures tolerated before a key is reported exhausted.
    max_attempts: u32,

    entries: BTreeMap<K, RetryEntry>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    /// Create a new retry tracker.
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            entries: BTreeMap::new(),
        }
    }

    /// Record a failure for a key.
    pub fn record_failure(&mut self, key: &K, now: Instant) -> RetryVerdict {
        let entry = self.entries.entry(key.clone()).or_insert(RetryEntry {
            attempts: 0,
            last_failure: now,
            not_before: now,
        });

        entry.attempts += 1;
        entry.last_failure = now;

        if entry.attempts >= self.max_attempts {
            entry.not_before = now;
            return RetryVerdict::Exhausted {
                attempts: entry.attempts,
            };
        }

        let delay = self.policy.delay(entry.attempts - 1);
        entry.not_before = now + delay;
        RetryVerdict::RetryAfter(delay)
    }

    /// Returns true if the key may be attempted at `now`.
    pub fn is_ready(&self, key: &K, now: Instant) -> bool {
        self.entries
            .get(key)
            .map_or(true, |entry| now >= entry.not_before)
    }

    /// Number of failures recorded for the key.
    pub fn attempts(&self, key: &K) -> u32 {
        self.entries.get(key).map_or(0, |entry| entry.attempts)
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop keys whose last failure is older than `window`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_failure) <= window);
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Inventory diff
// =============================================================================

/// Set difference between a census and an observed inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryDiff<K> {
    /// Observed but not in the census.
    pub orphans: Vec<K>,

    /// In the census but not observed.
    pub missing: Vec<K>,

    /// Present on both sides.
    pub matched: Vec<K>,
}

impl<K> InventoryDiff<K> {
    /// Returns true if census and inventory agree.
    pub fn is_converged(&self) -> bool {
        self.orphans.is_empty() && self.missing.is_empty()
    }
}

/// Compare census keys against observed keys. Output vectors are sorted.
pub fn diff_inventory<K, C, O>(census: C, observed: O) -> InventoryDiff<K>
where
    K: Ord + Clone,
    C: IntoIterator<Item = K>,
    O: IntoIterator<Item = K>,
{
    let census: BTreeSet<K> = census.into_iter().collect();
    let observed: BTreeSet<K> = observed.into_iter().collect();

    InventoryDiff {
        orphans: observed.difference(&census).cloned().collect(),
        missing: census.difference(&observed).cloned().collect(),
        matched: census.intersection(&observed).cloned().collect(),
    }
}

/// Default control loop tick.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default kill attempts before a resource is reported as leaked.
pub const DEFAULT_MAX_KILL_ATTEMPTS: u32 = 5;

/// Default sliding window for counting failures.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);
