//! Fleet reconciler.
//!
//! Drives the instance population of one fleet toward its desired pool.
//! Each pass runs these steps in order, any of which may end the pass:
//!
//! 1. Skip unhealthy fleets entirely
//! 2. Wait until issued deletions are visible in the cache
//! 3. Wait until issued creations are visible in the cache
//! 4. Tally instances by state, deleting crashed and completed ones
//! 5. Skip scaling while any instance has not reported a state yet
//! 6. Delete surplus standing-by instances
//! 7. Delete instances above the max cap, or retry shortly if that is not
//!    possible without touching active ones
//! 8. Create instances to refill the standing-by pool, never above max
//! 9. Write status counts and health if anything changed
//!
//! Active instances are never deleted to shrink the pool. Crashes are
//! counted once their instance is deleted and stay pending in the reconciler
//! until a status write records them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use gamefleet_api::names::{LABEL_BUILD_ID, LABEL_BUILD_NAME};
use gamefleet_api::{
    is_port_exposed, Fleet, FleetHealth, Instance, InstanceSpec, InstanceState, ObjectKey,
    ObjectMeta, Resource,
};
use gamefleet_ports::{PortError, PortRegistry};
use gamefleet_reconcile::{Action, PendingLedger, MAX_OVERSHOOT_REQUEUE};
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::controller::Reconciler;
use crate::error::ReconcileError;
use crate::events::{reasons, Event, EventRecorder};
use crate::store::{FleetApi, InstanceApi, StoreError};
use crate::telemetry::{Counter, FleetGauges, Telemetry};

/// Length of the random suffix in generated instance names.
pub const NAME_SUFFIX_LEN: usize = 5;

/// `<prefix>-<5 random lowercase letters>`.
pub fn generate_name(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect();
    format!("{prefix}-{suffix}")
}

/// Build a new instance for `fleet`, with a host port from `ports` for every
/// exposed container port.
///
/// Ports are taken all at once under the instance's `namespace/name` key, so
/// a failure leaves the registry untouched. The caller must release them if
/// the instance is never created.
pub fn new_instance_for_fleet(fleet: &Fleet, ports: &PortRegistry) -> Result<Instance, PortError> {
    let mut metadata = ObjectMeta::new(
        fleet.metadata.namespace.clone(),
        generate_name(fleet.name()),
    );
    metadata.owner_references.push(fleet.controller_ref());
    metadata
        .labels
        .insert(LABEL_BUILD_ID.to_string(), fleet.spec.build_id.clone());
    metadata
        .labels
        .insert(LABEL_BUILD_NAME.to_string(), fleet.name().to_string());

    let exposed = &fleet.spec.ports_to_expose;
    let mut template = fleet.spec.template.clone();

    let needed = template
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().filter(|p| is_port_exposed(exposed, &c.name, &p.name)))
        .count();
    let mut host_ports = ports
        .allocate_many(&metadata.key().to_string(), needed)?
        .into_iter();

    for container in &mut template.containers {
        for port in &mut container.ports {
            if is_port_exposed(exposed, &container.name, &port.name) {
                port.host_port = host_ports.next();
            }
        }
    }

    Ok(Instance {
        metadata,
        spec: InstanceSpec {
            template,
            build_id: fleet.spec.build_id.clone(),
            title_id: fleet.spec.title_id.clone(),
            ports_to_expose: fleet.spec.ports_to_expose.clone(),
            build_metadata: fleet.spec.build_metadata.clone(),
        },
        ..Default::default()
    })
}

/// Instance counts observed in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    initializing: u32,
    standing_by: u32,
    active: u32,
    crashed: u32,
}

pub struct FleetReconciler {
    fleets: Arc<dyn FleetApi>,
    instances: Arc<dyn InstanceApi>,
    ports: Arc<PortRegistry>,
    creations: PendingLedger,
    deletions: PendingLedger,

    /// Crashes per fleet whose instance is deleted but which no status
    /// write has recorded yet.
    unrecorded_crashes: Mutex<HashMap<String, u32>>,

    recorder: Arc<dyn EventRecorder>,
    telemetry: Arc<dyn Telemetry>,
}

impl FleetReconciler {
    pub fn new(
        fleets: Arc<dyn FleetApi>,
        instances: Arc<dyn InstanceApi>,
        ports: Arc<PortRegistry>,
        recorder: Arc<dyn EventRecorder>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            fleets,
            instances,
            ports,
            creations: PendingLedger::creations(),
            deletions: PendingLedger::deletions(),
            unrecorded_crashes: Mutex::new(HashMap::new()),
            recorder,
            telemetry,
        }
    }

    /// Instances created but not yet seen in the cache.
    pub fn creations(&self) -> &PendingLedger {
        &self.creations
    }

    /// Instances deleted but still seen in the cache.
    pub fn deletions(&self) -> &PendingLedger {
        &self.deletions
    }

    /// Crashes observed for the fleet and not yet written to its status.
    pub fn unrecorded_crashes(&self, fleet: &str) -> u32 {
        self.crashes().get(fleet).copied().unwrap_or(0)
    }

    /// Run one reconcile pass for the fleet at `key`.
    #[instrument(skip(self), fields(fleet = %key))]
    pub async fn reconcile_fleet(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let fleet = match self.fleets.get_fleet(key).await {
            Ok(fleet) => fleet,
            Err(e) if e.is_not_found() => {
                debug!("Fleet not found, skipping");
                let ledger_key = key.to_string();
                self.creations.forget(&ledger_key);
                self.deletions.forget(&ledger_key);
                self.crashes().remove(&ledger_key);
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if fleet.is_unhealthy() {
            info!("Fleet is unhealthy, not scaling");
            self.recorder.record(Event::warning(
                &fleet,
                reasons::UNHEALTHY_FLEET,
                "Fleet is unhealthy, do nothing".to_string(),
            ));
            return Ok(Action::Done);
        }

        let ledger_key = key.to_string();
        let probe = |name: String| self.instance_exists(&key.namespace, name);

        if !self.deletions.resolve(&ledger_key, probe).await? {
            debug!("Deletions not yet visible in cache");
            return Ok(Action::Done);
        }
        if !self.creations.resolve(&ledger_key, probe).await? {
            debug!("Creations not yet visible in cache");
            return Ok(Action::Done);
        }

        let instances = self
            .instances
            .list_instances_for_fleet(&key.namespace, &key.name)
            .await?;

        let mut tally = Tally::default();
        for instance in instances.iter().filter(|i| !i.metadata.is_terminating()) {
            match instance.state() {
                None | Some(InstanceState::Initializing) => tally.initializing += 1,
                Some(InstanceState::StandingBy) => tally.standing_by += 1,
                Some(InstanceState::Active) => tally.active += 1,
                Some(InstanceState::Crashed) => {
                    self.delete_instance(&ledger_key, instance).await?;
                    tally.crashed += 1;
                    *self.crashes().entry(ledger_key.clone()).or_default() += 1;
                    self.telemetry.increment(key, Counter::Crashed);
                    self.recorder.record(Event::warning(
                        &fleet,
                        reasons::CRASHED,
                        format!("Instance {} crashed", instance.name()),
                    ));
                }
                Some(InstanceState::GameCompleted) => {
                    self.delete_instance(&ledger_key, instance).await?;
                    self.telemetry.increment(key, Counter::SessionEnded);
                    self.recorder.record(Event::normal(
                        &fleet,
                        reasons::EXITED,
                        format!("Instance {} session completed", instance.name()),
                    ));
                }
                Some(InstanceState::Terminating) => {}
            }
        }

        debug!(
            initializing = tally.initializing,
            standing_by = tally.standing_by,
            active = tally.active,
            crashed = tally.crashed,
            "Tallied instances"
        );

        if tally.initializing > 0 {
            return self.update_status(&fleet, &ledger_key, tally).await;
        }

        let desired = fleet.spec.standing_by;
        let max = fleet.spec.max;
        let mut standing_by = tally.standing_by;

        // Shared between both scale-down steps so no instance is picked twice.
        let mut candidates = instances
            .iter()
            .filter(|i| !i.metadata.is_terminating() && i.is_scale_down_candidate());

        if standing_by > desired {
            let surplus = standing_by - desired;
            let deleted = self.scale_down(&fleet, &ledger_key, &mut candidates, surplus).await?;
            standing_by -= deleted;

            if deleted < surplus {
                info!(surplus, deleted, "No standing-by instances left to delete");
                self.recorder.record(Event::normal(
                    &fleet,
                    reasons::SCALE_DOWN_INCOMPLETE,
                    format!("Tried to delete {surplus} instances but deleted only {deleted}"),
                ));
            }
        }

        if standing_by + tally.active > max {
            let surplus = standing_by + tally.active - max;
            let deleted = self.scale_down(&fleet, &ledger_key, &mut candidates, surplus).await?;
            standing_by -= deleted;

            if deleted < surplus {
                warn!(surplus, deleted, max, "Above max with no standing-by instances left to delete");
                self.recorder.record(Event::warning(
                    &fleet,
                    reasons::MAX_EXCEEDED,
                    format!("Tried to delete {surplus} instances but deleted only {deleted}, will requeue"),
                ));
                self.update_status(&fleet, &ledger_key, tally).await?;
                return Ok(Action::requeue_after(MAX_OVERSHOOT_REQUEUE));
            }
        }

        let to_create = desired
            .saturating_sub(standing_by)
            .min(max.saturating_sub(standing_by + tally.active));
        let created = self.scale_up(&fleet, &ledger_key, to_create).await;

        // Status goes out even when creation failed, so crashes are not lost.
        let action = self.update_status(&fleet, &ledger_key, tally).await?;
        created?;
        Ok(action)
    }

    /// Delete up to `count` instances from `candidates`, in order.
    async fn scale_down<'a>(
        &self,
        fleet: &Fleet,
        ledger_key: &str,
        candidates: &mut impl Iterator<Item = &'a Instance>,
        count: u32,
    ) -> Result<u32, ReconcileError> {
        let mut deleted = 0;
        while deleted < count {
            let Some(instance) = candidates.next() else {
                break;
            };
            self.delete_instance(ledger_key, instance).await?;
            deleted += 1;

            self.telemetry.increment(&fleet.key(), Counter::Deleted);
            self.recorder.record(Event::normal(
                fleet,
                reasons::DELETED,
                format!("Instance {} deleted", instance.name()),
            ));
        }
        Ok(deleted)
    }

    async fn scale_up(
        &self,
        fleet: &Fleet,
        ledger_key: &str,
        count: u32,
    ) -> Result<(), ReconcileError> {
        for _ in 0..count {
            let instance = new_instance_for_fleet(fleet, &self.ports)?;

            if let Err(e) = self.instances.create_instance(&instance).await {
                self.ports
                    .release(&instance.key().to_string(), &instance.host_ports());
                return Err(e.into());
            }
            self.creations.record(ledger_key, instance.name());

            info!(instance = %instance.key(), "Created instance");
            self.telemetry.increment(&fleet.key(), Counter::Created);
            self.recorder.record(Event::normal(
                fleet,
                reasons::CREATING,
                format!("Creating instance {}", instance.name()),
            ));
        }
        Ok(())
    }

    /// Delete an instance and record it as pending deletion. An instance
    /// that is already gone counts as deleted.
    async fn delete_instance(&self, ledger_key: &str, instance: &Instance) -> Result<(), ReconcileError> {
        match self.instances.delete_instance(&instance.key()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(instance = %instance.key(), "Instance already deleted");
            }
            Err(e) => return Err(e.into()),
        }
        self.deletions.record(ledger_key, instance.name());
        Ok(())
    }

    async fn instance_exists(&self, namespace: &str, name: String) -> Result<bool, StoreError> {
        match self.instances.get_instance(&ObjectKey::new(namespace, name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn crashes(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.unrecorded_crashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Write observed counts and health, only when something changed.
    ///
    /// Unrecorded crashes are folded into the count and cleared only once
    /// the write succeeds.
    async fn update_status(
        &self,
        fleet: &Fleet,
        ledger_key: &str,
        tally: Tally,
    ) -> Result<Action, ReconcileError> {
        let current = &fleet.status;
        let ready_desired = format!("{}/{}", tally.standing_by, fleet.spec.standing_by);
        let crashes = self.unrecorded_crashes(ledger_key);

        let changed = current.current_initializing != tally.initializing
            || current.current_standing_by != tally.standing_by
            || current.current_active != tally.active
            || current.current_standing_by_ready_desired != ready_desired
            || crashes > 0;

        if changed {
            let mut updated = fleet.clone();
            let status = &mut updated.status;
            status.current_initializing = tally.initializing;
            status.current_standing_by = tally.standing_by;
            status.current_active = tally.active;
            status.crashes_count = status.crashes_count.saturating_add(crashes);
            status.current_standing_by_ready_desired = ready_desired;
            if status.crashes_count >= fleet.spec.crashes_to_mark_unhealthy {
                status.health = FleetHealth::Unhealthy;
            }

            if status.health == FleetHealth::Unhealthy {
                warn!(
                    crashes = status.crashes_count,
                    threshold = fleet.spec.crashes_to_mark_unhealthy,
                    "Fleet marked unhealthy"
                );
            }

            match self.fleets.update_fleet_status(&updated).await {
                Ok(_) => self.record_crashes(ledger_key, crashes),
                Err(e) if e.is_conflict() => {
                    debug!(unrecorded_crashes = crashes, "Fleet status conflict, requeueing");
                    return Ok(Action::Requeue);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.telemetry.set_gauges(
            &fleet.key(),
            FleetGauges {
                initializing: tally.initializing,
                standing_by: tally.standing_by,
                active: tally.active,
            },
        );
        Ok(Action::Done)
    }

    /// Drop `count` crashes that are now part of the fleet status.
    fn record_crashes(&self, ledger_key: &str, count: u32) {
        let mut crashes = self.crashes();
        if let Some(pending) = crashes.get_mut(ledger_key) {
            *pending = pending.saturating_sub(count);
            if *pending == 0 {
                crashes.remove(ledger_key);
            }
        }
    }
}

#[async_trait]
impl Reconciler for FleetReconciler {
    fn name(&self) -> &str {
        "fleet"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_fleet(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use gamefleet_api::{Container, ContainerPort, PodSpec, PortToExpose};

    fn fleet() -> Fleet {
        let mut metadata = ObjectMeta::new("games", "fleet-a");
        metadata.uid = "fleet-uid".to_string();
        Fleet {
            metadata,
            spec: gamefleet_api::FleetSpec {
                build_id: "build-1".to_string(),
                standing_by: 2,
                max: 4,
                crashes_to_mark_unhealthy: 3,
                template: PodSpec {
                    containers: vec![Container {
                        name: "game".to_string(),
                        image: "game:v1".to_string(),
                        ports: vec![
                            ContainerPort {
                                name: "gameport".to_string(),
                                container_port: 7777,
                                ..Default::default()
                            },
                            ContainerPort {
                                name: "query".to_string(),
                                container_port: 7778,
                                ..Default::default()
                            },
                            ContainerPort {
                                name: "debug".to_string(),
                                container_port: 9000,
                                ..Default::default()
                            },
                        ],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ports_to_expose: vec![
                    PortToExpose {
                        container_name: "game".to_string(),
                        port_name: "gameport".to_string(),
                    },
                    PortToExpose {
                        container_name: "game".to_string(),
                        port_name: "query".to_string(),
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_name() {
        let name = generate_name("fleet-a");
        let suffix = name.strip_prefix("fleet-a-").unwrap();
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn test_new_instance_for_fleet() {
        let ports = PortRegistry::new(20000, 20010).unwrap();
        let instance = new_instance_for_fleet(&fleet(), &ports).unwrap();

        assert!(instance.name().starts_with("fleet-a-"));
        assert_eq!(instance.metadata.namespace, "games");
        assert_eq!(instance.metadata.controller_name_of_kind("Fleet"), Some("fleet-a"));
        assert_eq!(instance.metadata.labels[LABEL_BUILD_ID], "build-1");
        assert_eq!(instance.metadata.labels[LABEL_BUILD_NAME], "fleet-a");
        assert_eq!(instance.state(), None);

        let container_ports = &instance.spec.template.containers[0].ports;
        assert!(container_ports[0].host_port.is_some());
        assert!(container_ports[1].host_port.is_some());
        assert_eq!(container_ports[2].host_port, None);

        let held = instance.host_ports();
        assert_eq!(held.len(), 2);
        let holder = instance.key().to_string();
        assert!(held.iter().all(|p| ports.holder(*p).as_deref() == Some(holder.as_str())));
        assert_eq!(ports.in_use(), 2);
    }

    #[test]
    fn test_new_instance_exhaustion_takes_nothing() {
        let ports = PortRegistry::new(20000, 20003).unwrap();
        new_instance_for_fleet(&fleet(), &ports).unwrap();

        let err = new_instance_for_fleet(&fleet(), &ports).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ports.in_use(), 2);
    }
}
