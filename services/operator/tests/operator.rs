//! End-to-end: the operator's controllers keep a fleet's standing-by pool
//! warm while a simulated sidecar moves instances through their states.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{eventually, fleet, fleet_key};
use gamefleet_api::names::INSTANCE_FINALIZER;
use gamefleet_api::{InstanceState, Resource};
use gamefleet_operator::events::RecordingRecorder;
use gamefleet_operator::telemetry::{Counter, CountingTelemetry};
use gamefleet_operator::{Config, MemoryStore, Operator};
use tokio::sync::watch;

fn config() -> Config {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("GAMEFLEET_SIDECAR_IMAGE", "sidecar:v1"),
        ("GAMEFLEET_INIT_CONTAINER_IMAGE", "init:v1"),
        ("GAMEFLEET_MIN_PORT", "20000"),
        ("GAMEFLEET_MAX_PORT", "20100"),
        ("GAMEFLEET_CONCURRENCY", "2"),
    ]);
    Config::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap()
}

/// Report StandingBy for every instance whose pod exists, as the sidecar
/// would once the game server is up.
fn sidecar_ready(store: &MemoryStore) {
    for instance in store.instances() {
        if instance.state().is_none() && store.pod(&instance.key()).is_some() {
            let _ = store.set_instance_state(&instance.key(), InstanceState::StandingBy);
        }
    }
}

fn count_in(store: &MemoryStore, state: InstanceState) -> usize {
    store
        .instances()
        .iter()
        .filter(|i| i.state() == Some(state))
        .count()
}

#[tokio::test]
async fn test_operator_keeps_pool_warm() {
    let store = Arc::new(MemoryStore::new());
    store.apply_fleet(fleet(2, 4, 10));

    let telemetry = Arc::new(CountingTelemetry::new());
    let operator = Arc::new(
        Operator::new(
            &config(),
            store.clone(),
            Arc::new(RecordingRecorder::new()),
            telemetry.clone(),
        )
        .unwrap(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn({
        let operator = Arc::clone(&operator);
        async move { operator.run(shutdown_rx).await }
    });

    assert!(
        eventually(|| {
            sidecar_ready(&store);
            store.fleet(&fleet_key()).unwrap().status.current_standing_by == 2
        })
        .await
    );
    assert_eq!(store.instances().len(), 2);
    assert!(store
        .instances()
        .iter()
        .all(|i| i.metadata.has_finalizer(INSTANCE_FINALIZER)));
    assert_eq!(operator.ports().in_use(), 4);

    // A player takes one server: the pool is refilled.
    let taken = store.instances()[0].key();
    store
        .set_instance_state(&taken, InstanceState::Active)
        .unwrap();

    assert!(
        eventually(|| {
            sidecar_ready(&store);
            let status = store.fleet(&fleet_key()).unwrap().status;
            status.current_standing_by == 2 && status.current_active == 1
        })
        .await
    );
    assert_eq!(store.instances().len(), 3);

    // The session ends: the instance is removed and its ports returned.
    store
        .set_instance_state(&taken, InstanceState::GameCompleted)
        .unwrap();

    assert!(
        eventually(|| {
            sidecar_ready(&store);
            store.instance(&taken).is_none()
                && count_in(&store, InstanceState::StandingBy) == 2
                && store.instances().len() == 2
        })
        .await
    );
    assert!(eventually(|| operator.ports().in_use() == 4).await);
    assert_eq!(telemetry.total(Counter::SessionEnded), 1);
    assert_eq!(telemetry.total(Counter::Created), 3);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn test_existing_instances_hold_their_ports() {
    let store = Arc::new(MemoryStore::new());
    let applied = store.apply_fleet(fleet(1, 4, 10));

    let seed = gamefleet_ports::PortRegistry::new(20000, 20100).unwrap();
    let existing = gamefleet_operator::fleet::new_instance_for_fleet(&applied, &seed).unwrap();
    gamefleet_operator::store::InstanceApi::create_instance(store.as_ref(), &existing)
        .await
        .unwrap();

    let operator = Operator::new(
        &config(),
        store.clone(),
        Arc::new(RecordingRecorder::new()),
        Arc::new(CountingTelemetry::new()),
    )
    .unwrap();

    let held = existing.host_ports();
    assert_eq!(operator.ports().in_use(), held.len());
    assert!(held.iter().all(|p| operator.ports().is_assigned(*p)));
}

#[tokio::test]
async fn test_store_events_are_routed() {
    let store = Arc::new(MemoryStore::new());
    let operator = Operator::new(
        &config(),
        store.clone(),
        Arc::new(RecordingRecorder::new()),
        Arc::new(CountingTelemetry::new()),
    )
    .unwrap();
    let mut events = store.subscribe();

    let applied = store.apply_fleet(fleet(1, 4, 10));
    operator.route(&events.recv().await.unwrap());
    assert_eq!(operator.fleet_queue().len(), 1);
    assert!(operator.instance_queue().is_empty());

    let seed = gamefleet_ports::PortRegistry::new(20000, 20100).unwrap();
    let instance = gamefleet_operator::fleet::new_instance_for_fleet(&applied, &seed).unwrap();
    gamefleet_operator::store::InstanceApi::create_instance(store.as_ref(), &instance)
        .await
        .unwrap();
    operator.route(&events.recv().await.unwrap());

    // The fleet key was already queued, so it is not added twice.
    assert_eq!(operator.fleet_queue().len(), 1);
    assert_eq!(operator.instance_queue().len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_operator() {
    let store = Arc::new(MemoryStore::new());
    let operator = Operator::new(
        &config(),
        store,
        Arc::new(RecordingRecorder::new()),
        Arc::new(CountingTelemetry::new()),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { operator.run(shutdown_rx).await });

    tokio::task::yield_now().await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
}
