//! Fleet telemetry: instance lifecycle counters and per-fleet state gauges.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use gamefleet_api::ObjectKey;

/// Lifecycle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    Created,
    /// Deleted to shrink the pool.
    Deleted,
    Crashed,
    SessionEnded,
}

/// Instance counts by state for one fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetGauges {
    pub initializing: u32,
    pub standing_by: u32,
    pub active: u32,
}

pub trait Telemetry: Send + Sync {
    fn increment(&self, fleet: &ObjectKey, counter: Counter);

    fn set_gauges(&self, fleet: &ObjectKey, gauges: FleetGauges);
}

/// In-process counters, readable for logs and tests.
#[derive(Debug, Default)]
pub struct CountingTelemetry {
    inner: Mutex<Counts>,
}

#[derive(Debug, Default)]
struct Counts {
    counters: BTreeMap<(ObjectKey, Counter), u64>,
    gauges: BTreeMap<ObjectKey, FleetGauges>,
}

impl CountingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, fleet: &ObjectKey, counter: Counter) -> u64 {
        self.lock()
            .counters
            .get(&(fleet.clone(), counter))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter over every fleet.
    pub fn total(&self, counter: Counter) -> u64 {
        self.lock()
            .counters
            .iter()
            .filter(|((_, c), _)| *c == counter)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn gauges(&self, fleet: &ObjectKey) -> Option<FleetGauges> {
        self.lock().gauges.get(fleet).copied()
    }

    fn lock(&self) -> MutexGuard<'_, Counts> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Telemetry for CountingTelemetry {
    fn increment(&self, fleet: &ObjectKey, counter: Counter) {
        *self
            .lock()
            .counters
            .entry((fleet.clone(), counter))
            .or_insert(0) += 1;
    }

    fn set_gauges(&self, fleet: &ObjectKey, gauges: FleetGauges) {
        self.lock().gauges.insert(fleet.clone(), gauges);
    }
}
