//! Instance reconciler.
//!
//! Drives one instance through its lifecycle:
//! - Releases its host ports before letting a deleted instance go
//! - Creates its pod exactly once
//! - Records Crashed or GameCompleted when the game process exits
//! - Keeps the pod's eviction annotation in step with the instance state
//! - Publishes the node address and port mappings once the pod is placed
//!
//! The StandingBy and Active transitions are written by the in-pod sidecar,
//! never here.

use std::sync::Arc;

use async_trait::async_trait;
use gamefleet_api::names::{INSTANCE_FINALIZER, SAFE_TO_EVICT_ANNOTATION, SIDECAR_CONTAINER_NAME};
use gamefleet_api::{format_port_mappings, Instance, InstanceState, ObjectKey, Pod, Resource};
use gamefleet_ports::PortRegistry;
use gamefleet_reconcile::{Action, PendingSet};
use tracing::{debug, info, instrument, warn};

use crate::address::NodeAddressResolver;
use crate::controller::Reconciler;
use crate::error::ReconcileError;
use crate::events::{reasons, Event, EventRecorder};
use crate::pod::{build_pod, PodTemplateConfig};
use crate::store::{InstanceApi, PodApi, StoreError};

/// Exit code of the first terminated game container, ignoring the sidecar.
pub fn game_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .container_statuses
        .iter()
        .filter(|s| s.name != SIDECAR_CONTAINER_NAME && !s.ready)
        .find_map(|s| s.terminated.as_ref().map(|t| t.exit_code))
}

/// Value of the eviction annotation for an instance in `state`.
pub fn safe_to_evict(state: Option<InstanceState>) -> &'static str {
    if state == Some(InstanceState::Active) {
        "false"
    } else {
        "true"
    }
}

/// Map a write result to an action: conflicts retry, a vanished object ends
/// the pass.
fn write_outcome<T>(result: Result<T, StoreError>) -> Result<Action, ReconcileError> {
    match result {
        Ok(_) => Ok(Action::Done),
        Err(e) if e.is_conflict() => {
            debug!(error = %e, "Write conflict, requeueing");
            Ok(Action::Requeue)
        }
        Err(e) if e.is_not_found() => Ok(Action::Done),
        Err(e) => Err(e.into()),
    }
}

pub struct InstanceReconciler {
    instances: Arc<dyn InstanceApi>,
    pods: Arc<dyn PodApi>,
    ports: Arc<PortRegistry>,
    resolver: Arc<dyn NodeAddressResolver>,
    pod_config: PodTemplateConfig,

    /// Instances whose pod was created but is not yet in the cache.
    pods_under_creation: Arc<PendingSet>,

    recorder: Arc<dyn EventRecorder>,
}

impl InstanceReconciler {
    pub fn new(
        instances: Arc<dyn InstanceApi>,
        pods: Arc<dyn PodApi>,
        ports: Arc<PortRegistry>,
        resolver: Arc<dyn NodeAddressResolver>,
        pod_config: PodTemplateConfig,
        pods_under_creation: Arc<PendingSet>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            instances,
            pods,
            ports,
            resolver,
            pod_config,
            pods_under_creation,
            recorder,
        }
    }

    /// Run one reconcile pass for the instance at `key`.
    #[instrument(skip(self), fields(instance = %key))]
    pub async fn reconcile_instance(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let mut instance = match self.instances.get_instance(key).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                debug!("Instance not found, skipping");
                self.pods_under_creation.remove(&key.to_string());
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if instance.metadata.is_terminating() {
            return self.finalize(instance).await;
        }

        if instance.metadata.add_finalizer(INSTANCE_FINALIZER) {
            debug!("Adding finalizer");
            return write_outcome(self.instances.update_instance(&instance).await);
        }

        let pending_key = key.to_string();
        let pod = match self.pods.get_pod(key).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => return self.create_pod(&instance, &pending_key).await,
            Err(e) => return Err(e.into()),
        };

        if self.pods_under_creation.remove(&pending_key) {
            debug!("Pod creation visible in cache");
        }

        if let Some(exit_code) = game_exit_code(&pod) {
            return self.record_exit(instance, exit_code).await;
        }

        self.update_eviction_annotation(&instance, &pod).await;

        let has_address = instance
            .status
            .public_ip
            .as_deref()
            .is_some_and(|ip| !ip.is_empty());
        if has_address {
            return Ok(Action::Done);
        }

        let Some(node_name) = pod.node_name() else {
            debug!("Pod not yet placed on a node");
            return Ok(Action::Done);
        };

        let public_ip = self.resolver.public_address(node_name).await?;
        instance.status.public_ip = Some(public_ip);
        instance.status.ports = Instance::port_mappings(&pod.spec);

        info!(
            node = %node_name,
            public_ip = instance.status.public_ip.as_deref().unwrap_or_default(),
            ports = %format_port_mappings(&instance.status.ports),
            "Publishing instance address"
        );
        write_outcome(self.instances.update_instance_status(&instance).await)
    }

    /// Release ports, then drop the finalizer so the instance can go.
    async fn finalize(&self, mut instance: Instance) -> Result<Action, ReconcileError> {
        self.pods_under_creation.remove(&instance.key().to_string());

        if !instance.metadata.has_finalizer(INSTANCE_FINALIZER) {
            return Ok(Action::Done);
        }

        let ports = instance.host_ports();
        let released = self.ports.release(&instance.key().to_string(), &ports);
        info!(ports = ?ports, released, "Released instance ports");

        instance.metadata.remove_finalizer(INSTANCE_FINALIZER);
        write_outcome(self.instances.update_instance(&instance).await)
    }

    async fn create_pod(&self, instance: &Instance, pending_key: &str) -> Result<Action, ReconcileError> {
        if self.pods_under_creation.contains(pending_key) {
            debug!("Pod creation not yet visible in cache");
            return Ok(Action::Done);
        }

        let pod = build_pod(instance, &self.pod_config);
        match self.pods.create_pod(&pod).await {
            Ok(_) => {
                info!(pod = %pod.key(), "Created pod");
                self.recorder.record(Event::normal(
                    instance,
                    reasons::POD_CREATED,
                    format!("Created new pod {} for instance {}", pod.name(), instance.name()),
                ));
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(pod = %pod.key(), "Pod already exists");
            }
            Err(e) => return Err(e.into()),
        }

        self.pods_under_creation.insert(pending_key);
        Ok(Action::Done)
    }

    async fn record_exit(&self, mut instance: Instance, exit_code: i32) -> Result<Action, ReconcileError> {
        let state = if exit_code == 0 {
            InstanceState::GameCompleted
        } else {
            InstanceState::Crashed
        };

        if instance.state() == Some(state) {
            return Ok(Action::Done);
        }

        info!(exit_code, state = %state, "Game process exited");
        self.recorder.record(Event::normal(
            &instance,
            reasons::PROCESS_EXITED,
            format!("Game server process exited with code {exit_code}"),
        ));

        instance.status.state = Some(state);
        write_outcome(self.instances.update_instance_status(&instance).await)
    }

    /// Best effort: a failed update is logged and retried on the next pass.
    async fn update_eviction_annotation(&self, instance: &Instance, pod: &Pod) {
        let value = safe_to_evict(instance.state());
        let current = pod.metadata.annotations.get(SAFE_TO_EVICT_ANNOTATION);
        if current.map(String::as_str) == Some(value) {
            return;
        }

        let mut pod = pod.clone();
        pod.metadata
            .annotations
            .insert(SAFE_TO_EVICT_ANNOTATION.to_string(), value.to_string());

        match self.pods.update_pod(&pod).await {
            Ok(_) => {
                debug!(safe_to_evict = value, "Updated eviction annotation");
                self.recorder.record(Event::normal(
                    instance,
                    reasons::EVICTION_UPDATED,
                    format!(
                        "Instance {} state is {}, safe-to-evict={value}",
                        instance.name(),
                        instance.state().map_or("Initializing", |s| s.as_str())
                    ),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Failed to update eviction annotation");
            }
        }
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    fn name(&self) -> &str {
        "instance"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_instance(key).await
    }
}
