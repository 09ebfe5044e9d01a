//! Shared fixtures for the operator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gamefleet_api::{
    Container, ContainerPort, Fleet, FleetSpec, Instance, InstanceState, ObjectKey, ObjectMeta,
    PodSpec, PortToExpose, Resource,
};
use gamefleet_operator::address::StoreAddressResolver;
use gamefleet_operator::events::RecordingRecorder;
use gamefleet_operator::fleet::new_instance_for_fleet;
use gamefleet_operator::pod::PodTemplateConfig;
use gamefleet_operator::store::InstanceApi;
use gamefleet_operator::telemetry::CountingTelemetry;
use gamefleet_operator::{FleetReconciler, InstanceReconciler, MemoryStore};
use gamefleet_ports::PortRegistry;
use gamefleet_reconcile::PendingSet;

pub const NAMESPACE: &str = "games";
pub const FLEET: &str = "arena";

pub fn fleet_key() -> ObjectKey {
    ObjectKey::new(NAMESPACE, FLEET)
}

/// A fleet whose game container exposes two of its three ports.
pub fn fleet(standing_by: u32, max: u32, crashes_to_mark_unhealthy: u32) -> Fleet {
    Fleet {
        metadata: ObjectMeta::new(NAMESPACE, FLEET),
        spec: FleetSpec {
            build_id: "build-1".to_string(),
            title_id: "title-1".to_string(),
            standing_by,
            max,
            crashes_to_mark_unhealthy,
            template: PodSpec {
                containers: vec![Container {
                    name: "game".to_string(),
                    image: "game:v1".to_string(),
                    ports: vec![
                        port("gameport", 7777),
                        port("query", 7778),
                        port("metrics", 9100),
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            },
            ports_to_expose: vec![exposed("gameport"), exposed("query")],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn port(name: &str, container_port: u16) -> ContainerPort {
    ContainerPort {
        name: name.to_string(),
        container_port,
        ..Default::default()
    }
}

fn exposed(port_name: &str) -> PortToExpose {
    PortToExpose {
        container_name: "game".to_string(),
        port_name: port_name.to_string(),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ports: Arc<PortRegistry>,
    pub recorder: Arc<RecordingRecorder>,
    pub telemetry: Arc<CountingTelemetry>,
    pub fleets: FleetReconciler,
    pub instances: InstanceReconciler,
}

impl Harness {
    pub fn new(store: MemoryStore) -> Self {
        Self::with_ports(store, 20000, 20100)
    }

    pub fn with_ports(store: MemoryStore, min_port: u16, max_port: u16) -> Self {
        let store = Arc::new(store);
        let ports = Arc::new(PortRegistry::new(min_port, max_port).unwrap());
        let recorder = Arc::new(RecordingRecorder::new());
        let telemetry = Arc::new(CountingTelemetry::new());

        let fleets = FleetReconciler::new(
            store.clone(),
            store.clone(),
            ports.clone(),
            recorder.clone(),
            telemetry.clone(),
        );
        let instances = InstanceReconciler::new(
            store.clone(),
            store.clone(),
            ports.clone(),
            Arc::new(StoreAddressResolver::new(store.clone())),
            PodTemplateConfig::new("sidecar:v1", "init:v1"),
            Arc::new(PendingSet::new()),
            recorder.clone(),
        );

        Self {
            store,
            ports,
            recorder,
            telemetry,
            fleets,
            instances,
        }
    }

    pub fn apply_fleet(&self, fleet: Fleet) -> Fleet {
        let fleet = self.store.apply_fleet(fleet);
        self.store.sync();
        fleet
    }

    /// Create an instance of `fleet` directly, holding ports from the
    /// registry, and move it to `state`.
    pub async fn add_instance(&self, fleet: &Fleet, state: Option<InstanceState>) -> Instance {
        let instance = new_instance_for_fleet(fleet, &self.ports).unwrap();
        let created = self.store.create_instance(&instance).await.unwrap();
        match state {
            Some(state) => self.store.set_instance_state(&created.key(), state).unwrap(),
            None => created,
        }
    }

    pub fn instances_in(&self, state: Option<InstanceState>) -> Vec<Instance> {
        self.store
            .instances()
            .into_iter()
            .filter(|i| i.state() == state)
            .collect()
    }

    pub fn fleet(&self) -> Fleet {
        self.store.fleet(&fleet_key()).unwrap()
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
