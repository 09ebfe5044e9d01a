//! Host port registry.
//!
//! Every exposed game port is bound to a host port on whichever node the pod
//! lands on, so two live instances must never hold the same host port. The
//! registry hands out ports from a fixed half-open range `[min, max)` and
//! takes them back when instances are torn down.
//!
//! # Invariants
//!
//! - A port is assigned to at most one holder at a time
//! - Every assigned port lies in `[min, max)`
//! - Only the holder of a port can release it
//! - Allocation and release are atomic with respect to each other
//!
//! Allocation is round-robin from a cursor, so a just-released port is not
//! handed out again immediately. Callers must not rely on any ordering.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

/// Default lower bound of the host port range (inclusive).
pub const DEFAULT_MIN_PORT: u16 = 10000;

/// Default upper bound of the host port range (exclusive).
pub const DEFAULT_MAX_PORT: u16 = 50000;

/// Port registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Every port in the range is assigned.
    #[error("port range [{min}, {max}) exhausted")]
    Exhausted { min: u16, max: u16 },

    /// The range is empty or inverted.
    #[error("invalid port range [{min}, {max})")]
    InvalidRange { min: u16, max: u16 },
}

impl PortError {
    /// Exhaustion clears up once other instances release their ports.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortError::Exhausted { .. })
    }
}

#[derive(Debug)]
struct PortTable {
    /// Holder of each port, indexed by `port - min`.
    holders: Vec<Option<String>>,

    /// Slot to start the next search from.
    cursor: usize,

    in_use: usize,
}

impl PortTable {
    fn take_next(&mut self, holder: &str) -> Option<usize> {
        let len = self.holders.len();
        if self.in_use == len {
            return None;
        }

        for step in 0..len {
            let slot = (self.cursor + step) % len;
            if self.holders[slot].is_none() {
                self.holders[slot] = Some(holder.to_string());
                self.in_use += 1;
                self.cursor = (slot + 1) % len;
                return Some(slot);
            }
        }
        None
    }

    /// Free `slot` if `holder` holds it.
    fn free(&mut self, slot: usize, holder: &str) -> bool {
        if self.holders[slot].as_deref() == Some(holder) {
            self.holders[slot] = None;
            self.in_use -= 1;
            true
        } else {
            false
        }
    }
}

/// Bounded pool of host ports, shared by reference across reconcilers.
///
/// Each assigned port remembers its holder, an opaque string such as the
/// `namespace/name` key of the instance that owns it.
#[derive(Debug)]
pub struct PortRegistry {
    min: u16,
    max: u16,
    table: Mutex<PortTable>,
}

impl PortRegistry {
    /// Create a registry over `[min, max)` with no ports assigned.
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        if min >= max {
            return Err(PortError::InvalidRange { min, max });
        }

        let len = usize::from(max - min);
        Ok(Self {
            min,
            max,
            table: Mutex::new(PortTable {
                holders: vec![None; len],
                cursor: 0,
                in_use: 0,
            }),
        })
    }

    /// Create a registry with ports already held by live instances.
    ///
    /// Used on startup so a restarted operator does not hand out ports that
    /// are still bound. Ports outside the range are skipped, and a port
    /// claimed twice stays with its first holder.
    pub fn with_assigned<S>(
        min: u16,
        max: u16,
        held: impl IntoIterator<Item = (S, u16)>,
    ) -> Result<Self, PortError>
    where
        S: Into<String>,
    {
        let registry = Self::new(min, max)?;
        {
            let mut table = registry.lock();
            for (holder, port) in held {
                let holder = holder.into();
                let Some(slot) = registry.slot(port) else {
                    warn!(port, min, max, holder = %holder, "Ignoring assigned port outside registry range");
                    continue;
                };
                match &table.holders[slot] {
                    Some(first) if *first != holder => {
                        warn!(port, holder = %holder, first = %first, "Port claimed by two holders");
                    }
                    Some(_) => {}
                    None => {
                        table.holders[slot] = Some(holder);
                        table.in_use += 1;
                    }
                }
            }
            debug!(in_use = table.in_use, "Seeded port registry");
        }
        Ok(registry)
    }

    /// Take one free port for `holder`.
    pub fn allocate(&self, holder: &str) -> Result<u16, PortError> {
        let mut table = self.lock();
        match table.take_next(holder) {
            Some(slot) => Ok(self.port(slot)),
            None => Err(self.exhausted()),
        }
    }

    /// Take `count` free ports for `holder`, all or nothing.
    pub fn allocate_many(&self, holder: &str, count: usize) -> Result<Vec<u16>, PortError> {
        let mut table = self.lock();
        if table.holders.len() - table.in_use < count {
            return Err(self.exhausted());
        }

        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            // Capacity was checked under the same lock.
            let Some(slot) = table.take_next(holder) else {
                for port in &ports {
                    if let Some(slot) = self.slot(*port) {
                        table.free(slot, holder);
                    }
                }
                return Err(self.exhausted());
            };
            ports.push(self.port(slot));
        }
        Ok(ports)
    }

    /// Return `holder`'s ports to the pool, returning how many were freed.
    ///
    /// Ports that are free, out of range or held by someone else are left
    /// alone, so teardown may safely run more than once even after the
    /// ports have been handed to a new holder.
    pub fn release(&self, holder: &str, ports: &[u16]) -> usize {
        let mut table = self.lock();
        let mut released = 0usize;
        for &port in ports {
            if let Some(slot) = self.slot(port) {
                if table.free(slot, holder) {
                    released += 1;
                }
            }
        }
        debug!(
            holder,
            requested = ports.len(),
            released,
            in_use = table.in_use,
            "Released ports"
        );
        released
    }

    /// Whether `port` is currently assigned.
    pub fn is_assigned(&self, port: u16) -> bool {
        self.holder(port).is_some()
    }

    /// Current holder of `port`.
    pub fn holder(&self, port: u16) -> Option<String> {
        let slot = self.slot(port)?;
        self.lock().holders[slot].clone()
    }

    /// Total number of ports in the range.
    pub fn capacity(&self) -> usize {
        usize::from(self.max - self.min)
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.in_use()
    }

    fn slot(&self, port: u16) -> Option<usize> {
        (self.min..self.max)
            .contains(&port)
            .then(|| usize::from(port - self.min))
    }

    fn port(&self, slot: usize) -> u16 {
        // Slots are bounded by `max - min`, which fits in u16.
        self.min + slot as u16
    }

    fn exhausted(&self) -> PortError {
        PortError::Exhausted {
            min: self.min,
            max: self.max,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortTable> {
        // Every mutation completes before the guard drops.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
