//! Object events: short human-readable notes attached to a fleet or instance.
//!
//! - `TracingRecorder` writes events to the log
//! - `RecordingRecorder` keeps them in memory for assertions

use std::sync::{Mutex, PoisonError};

use gamefleet_api::{ObjectKey, Resource};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// An event about one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: &'static str,
    pub object: ObjectKey,
    pub event_type: EventType,
    pub reason: &'static str,
    pub message: String,
}

impl Event {
    pub fn normal<R: Resource>(object: &R, reason: &'static str, message: String) -> Self {
        Self {
            kind: R::KIND,
            object: object.key(),
            event_type: EventType::Normal,
            reason,
            message,
        }
    }

    pub fn warning<R: Resource>(object: &R, reason: &'static str, message: String) -> Self {
        Self {
            event_type: EventType::Warning,
            ..Self::normal(object, reason, message)
        }
    }
}

/// Event reasons.
pub mod reasons {
    pub const UNHEALTHY_FLEET: &str = "UnhealthyFleet";
    pub const CRASHED: &str = "Crashed";
    pub const EXITED: &str = "Exited";
    pub const DELETED: &str = "InstanceDeleted";
    pub const SCALE_DOWN_INCOMPLETE: &str = "ScaleDownIncomplete";
    pub const MAX_EXCEEDED: &str = "MaxExceeded";
    pub const CREATING: &str = "Creating";
    pub const POD_CREATED: &str = "Created";
    pub const PROCESS_EXITED: &str = "ProcessExited";
    pub const EVICTION_UPDATED: &str = "EvictionUpdated";
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                kind = event.kind,
                object = %event.object,
                reason = event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                kind = event.kind,
                object = %event.object,
                reason = event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingRecorder {
    events: Mutex<Vec<Event>>,
}

impl RecordingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }
}

impl EventRecorder for RecordingRecorder {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
