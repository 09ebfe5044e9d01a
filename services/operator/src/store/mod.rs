//! Object store interfaces.
//!
//! Reconcilers depend on one narrow trait per resource kind, carrying only
//! the operations they use:
//!
//! - `FleetApi`: read fleets, write fleet status
//! - `InstanceApi`: read, create, update, delete instances
//! - `PodApi`: read, create, update pods
//! - `NodeApi`: read nodes
//!
//! Reads come from an eventually consistent cache. A write may not be
//! visible to the next read, so callers must not assume read-your-writes.
//! Updates carry the resource version they were read at and fail with
//! [`StoreError::Conflict`] if the object has moved on.

mod memory;

use async_trait::async_trait;
use gamefleet_api::{Fleet, Instance, Node, ObjectKey, Pod};
use thiserror::Error;

pub use memory::MemoryStore;

/// Store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// The object changed since it was read.
    #[error("conflict writing {kind} {key}: object has been modified")]
    Conflict { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn conflict(kind: &'static str, key: impl ToString) -> Self {
        StoreError::Conflict {
            kind,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Conflicts and internal failures go away on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Internal(_))
    }
}

/// Resource kinds that produce change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Fleet,
    Instance,
    Pod,
    Node,
}

/// A change published to the read cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: ResourceKind,
    pub key: ObjectKey,

    /// Controlling owner in the same namespace, if any.
    pub owner: Option<ObjectKey>,
}

#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn get_fleet(&self, key: &ObjectKey) -> Result<Fleet, StoreError>;

    async fn list_fleets(&self) -> Result<Vec<Fleet>, StoreError>;

    /// Replace the status of a fleet; spec and metadata are left as stored.
    async fn update_fleet_status(&self, fleet: &Fleet) -> Result<Fleet, StoreError>;
}

#[async_trait]
pub trait InstanceApi: Send + Sync {
    async fn get_instance(&self, key: &ObjectKey) -> Result<Instance, StoreError>;

    /// Instances whose controlling owner is the named fleet, in cache order.
    async fn list_instances_for_fleet(
        &self,
        namespace: &str,
        fleet: &str,
    ) -> Result<Vec<Instance>, StoreError>;

    async fn create_instance(&self, instance: &Instance) -> Result<Instance, StoreError>;

    /// Replace metadata and spec; status is left as stored.
    async fn update_instance(&self, instance: &Instance) -> Result<Instance, StoreError>;

    /// Replace status; metadata and spec are left as stored.
    async fn update_instance_status(&self, instance: &Instance) -> Result<Instance, StoreError>;

    /// Request deletion. Instances holding finalizers are only marked
    /// terminating until the last finalizer is removed.
    async fn delete_instance(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PodApi: Send + Sync {
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, StoreError>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;
}
