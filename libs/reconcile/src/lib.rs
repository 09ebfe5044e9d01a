//! Reconciliation loop primitives shared by the fleet and instance loops.
//!
//! - [`Action`]: what the scheduler should do after a reconcile returns
//! - [`PendingLedger`]: in-flight creates/deletes not yet visible in the
//!   read cache
//! - [`PendingSet`]: per-object guard against duplicate creation
//! - [`BackoffPolicy`] and [`RetryTracker`]: error retry timing
//!
//! # Invariants
//!
//! - A reconcile never blocks waiting for the cache; it returns an
//!   [`Action`] and is redelivered later
//! - Counts are not trusted while a fleet has unconfirmed operations

mod ledger;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;

pub use ledger::{PendingKind, PendingLedger, PendingSet};

/// Outcome of a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Nothing more to do until the next change or resync.
    #[default]
    Done,

    /// Redeliver the same key right away.
    Requeue,

    /// Redeliver the same key after a delay.
    RequeueAfter(Duration),
}

impl Action {
    pub fn requeue_after(delay: Duration) -> Self {
        Action::RequeueAfter(delay)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Action::Done)
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff for failed reconciles.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given attempt number, starting at 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Consecutive failure counts per object key.
///
/// A key's count restarts when its first recorded failure is older than the
/// window, so an object that failed long ago does not start at a high delay.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    window: Duration,

    /// key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure and return the attempt number to back off for
    /// (0 for the first failure).
    pub fn record_failure(&mut self, key: &str) -> u32 {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        let attempt = *count;
        *count = count.saturating_add(1);
        attempt
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map_or(0, |(count, _)| *count)
    }

    /// Forget a key after a successful reconcile.
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default number of concurrent reconciles per controller.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Delay before re-observing a fleet whose max overshoot could not be
/// removed in one pass.
pub const MAX_OVERSHOOT_REQUEUE: Duration = Duration::from_secs(5);

/// Default periodic resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default window after which a key's failure count starts over.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);
