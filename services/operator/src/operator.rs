//! Operator wiring: controllers, store event routing and periodic resync.
//!
//! - Fleet changes enqueue the fleet
//! - Instance changes enqueue the instance and its owning fleet
//! - Pod changes enqueue the owning instance
//! - Every resync interval, every fleet and its instances are enqueued

use std::sync::Arc;
use std::time::Duration;

use gamefleet_api::{ObjectKey, Resource};
use gamefleet_ports::{PortError, PortRegistry};
use gamefleet_reconcile::PendingSet;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::address::StoreAddressResolver;
use crate::config::Config;
use crate::controller::{Controller, WorkQueue};
use crate::events::EventRecorder;
use crate::fleet::FleetReconciler;
use crate::instance::InstanceReconciler;
use crate::store::{FleetApi, InstanceApi, MemoryStore, ResourceKind, StoreError, StoreEvent};
use crate::telemetry::Telemetry;

pub struct Operator {
    store: Arc<MemoryStore>,
    ports: Arc<PortRegistry>,
    fleets: Arc<Controller<FleetReconciler>>,
    instances: Arc<Controller<InstanceReconciler>>,
    concurrency: usize,
    resync_interval: Duration,
}

impl Operator {
    /// Wire reconcilers to `store`.
    ///
    /// Host ports held by instances already in the store are marked taken
    /// before anything runs.
    pub fn new(
        config: &Config,
        store: Arc<MemoryStore>,
        recorder: Arc<dyn EventRecorder>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, PortError> {
        let held: Vec<(String, u16)> = store
            .instances()
            .iter()
            .flat_map(|instance| {
                let holder = instance.key().to_string();
                instance
                    .host_ports()
                    .into_iter()
                    .map(move |port| (holder.clone(), port))
            })
            .collect();
        let ports = Arc::new(PortRegistry::with_assigned(
            config.min_port,
            config.max_port,
            held,
        )?);
        info!(
            min_port = config.min_port,
            max_port = config.max_port,
            in_use = ports.in_use(),
            "Port registry ready"
        );

        let fleet_reconciler = FleetReconciler::new(
            store.clone(),
            store.clone(),
            Arc::clone(&ports),
            Arc::clone(&recorder),
            telemetry,
        );
        let instance_reconciler = InstanceReconciler::new(
            store.clone(),
            store.clone(),
            Arc::clone(&ports),
            Arc::new(StoreAddressResolver::new(store.clone())),
            config.pod_template.clone(),
            Arc::new(PendingSet::new()),
            recorder,
        );

        Ok(Self {
            store,
            ports,
            fleets: Arc::new(Controller::new(Arc::new(fleet_reconciler))),
            instances: Arc::new(Controller::new(Arc::new(instance_reconciler))),
            concurrency: config.concurrency,
            resync_interval: config.resync_interval,
        })
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    pub fn fleet_queue(&self) -> Arc<WorkQueue> {
        self.fleets.queue()
    }

    pub fn instance_queue(&self) -> Arc<WorkQueue> {
        self.instances.queue()
    }

    /// Enqueue the keys affected by a store change.
    pub fn route(&self, event: &StoreEvent) {
        match event.kind {
            ResourceKind::Fleet => self.fleets.queue().add(event.key.clone()),
            ResourceKind::Instance => {
                self.instances.queue().add(event.key.clone());
                if let Some(fleet) = &event.owner {
                    self.fleets.queue().add(fleet.clone());
                }
            }
            ResourceKind::Pod => {
                if let Some(instance) = &event.owner {
                    self.instances.queue().add(instance.clone());
                }
            }
            ResourceKind::Node => {}
        }
    }

    /// Enqueue every fleet and every instance they own.
    pub async fn resync(&self) -> Result<(), StoreError> {
        let fleets = self.store.list_fleets().await?;
        let mut instance_count = 0usize;

        for fleet in &fleets {
            self.fleets.queue().add(fleet.key());

            let key: ObjectKey = fleet.key();
            for instance in self
                .store
                .list_instances_for_fleet(&key.namespace, &key.name)
                .await?
            {
                self.instances.queue().add(instance.key());
                instance_count += 1;
            }
        }

        debug!(fleets = fleets.len(), instances = instance_count, "Resync queued");
        Ok(())
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.subscribe();

        let fleet_handle = tokio::spawn(
            Arc::clone(&self.fleets).run(self.concurrency, shutdown.clone()),
        );
        let instance_handle = tokio::spawn(
            Arc::clone(&self.instances).run(self.concurrency, shutdown.clone()),
        );

        let mut resync = tokio::time::interval(self.resync_interval);
        info!(
            resync_interval_secs = self.resync_interval.as_secs(),
            "Operator running"
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.route(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Store events dropped, resyncing");
                        if let Err(e) = self.resync().await {
                            error!(error = %e, "Resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Store event stream closed");
                        break;
                    }
                },
                _ = resync.tick() => {
                    if let Err(e) = self.resync().await {
                        error!(error = %e, "Resync failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Operator shutting down");
                        break;
                    }
                }
            }
        }

        self.fleets.queue().shutdown();
        self.instances.queue().shutdown();
        for (name, handle) in [("fleet", fleet_handle), ("instance", instance_handle)] {
            if let Err(e) = handle.await {
                error!(controller = name, error = %e, "Controller task failed");
            }
        }
    }
}
