//! In-memory object store.
//!
//! Holds the authoritative objects and a separately published read cache.
//! Writes land in the authoritative maps and queue a change; publishing a
//! change copies the object (or its absence) into the cache and broadcasts a
//! [`StoreEvent`]. With auto-sync on, every write is published immediately.
//! With it off, the cache only moves on [`MemoryStore::sync`], which is how
//! tests reproduce a cache lagging behind issued writes.
//!
//! Deletion follows the owner-reference model: an object with finalizers is
//! only marked terminating, and removing an object removes everything it
//! controls.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use gamefleet_api::{
    Fleet, Instance, InstanceState, Node, ObjectKey, Pod, PodStatus, Resource,
};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{FleetApi, InstanceApi, NodeApi, PodApi, ResourceKind, StoreError, StoreEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default, Clone)]
struct Objects {
    fleets: BTreeMap<ObjectKey, Fleet>,
    instances: BTreeMap<ObjectKey, Instance>,
    pods: BTreeMap<ObjectKey, Pod>,
    nodes: BTreeMap<ObjectKey, Node>,
}

#[derive(Debug, Default)]
struct State {
    live: Objects,
    cache: Objects,
    auto_sync: bool,
    next_version: u64,
    unpublished: Vec<StoreEvent>,
    injected: VecDeque<StoreError>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn record(&mut self, kind: ResourceKind, key: ObjectKey, owner: Option<ObjectKey>) {
        self.unpublished.push(StoreEvent { kind, key, owner });
    }

    fn record_instance(&mut self, instance: &Instance) {
        let owner = owner_key::<Fleet>(instance);
        self.record(ResourceKind::Instance, instance.key(), owner);
    }

    fn record_pod(&mut self, pod: &Pod) {
        let owner = owner_key::<Instance>(pod);
        self.record(ResourceKind::Pod, pod.key(), owner);
    }

    /// Delete with finalizer semantics.
    fn delete_instance(&mut self, key: &ObjectKey) {
        let version = self.bump();
        let Some(instance) = self.live.instances.get_mut(key) else {
            return;
        };

        if instance.metadata.finalizers.is_empty() {
            self.remove_instance(key);
            return;
        }

        if instance.metadata.deletion_timestamp.is_none() {
            instance.metadata.deletion_timestamp = Some(Utc::now());
            instance.metadata.resource_version = version;
            let instance = instance.clone();
            self.record_instance(&instance);
        }
    }

    /// Remove an instance and the pods it controls.
    fn remove_instance(&mut self, key: &ObjectKey) {
        let Some(instance) = self.live.instances.remove(key) else {
            return;
        };
        self.record_instance(&instance);

        let owned: Vec<ObjectKey> = self
            .live
            .pods
            .values()
            .filter(|pod| is_controlled_by(*pod, &instance))
            .map(Resource::key)
            .collect();
        for pod_key in owned {
            if let Some(pod) = self.live.pods.remove(&pod_key) {
                self.record_pod(&pod);
            }
        }
        debug!(instance = %key, "Removed instance");
    }

    fn mirror(&mut self, event: &StoreEvent) {
        match event.kind {
            ResourceKind::Fleet => mirror(&self.live.fleets, &mut self.cache.fleets, &event.key),
            ResourceKind::Instance => {
                mirror(&self.live.instances, &mut self.cache.instances, &event.key)
            }
            ResourceKind::Pod => mirror(&self.live.pods, &mut self.cache.pods, &event.key),
            ResourceKind::Node => mirror(&self.live.nodes, &mut self.cache.nodes, &event.key),
        }
    }
}

fn mirror<V: Clone>(
    live: &BTreeMap<ObjectKey, V>,
    cache: &mut BTreeMap<ObjectKey, V>,
    key: &ObjectKey,
) {
    match live.get(key) {
        Some(object) => {
            cache.insert(key.clone(), object.clone());
        }
        None => {
            cache.remove(key);
        }
    }
}

fn owner_key<O: Resource>(object: &impl Resource) -> Option<ObjectKey> {
    let meta = object.meta();
    meta.controller_name_of_kind(O::KIND)
        .map(|name| ObjectKey::new(meta.namespace.clone(), name))
}

fn is_controlled_by<O: Resource>(object: &impl Resource, owner: &O) -> bool {
    object.meta().namespace == owner.meta().namespace
        && object.meta().controller_name_of_kind(O::KIND) == Some(owner.name())
}

fn stamp_new<R: Resource>(object: &mut R, version: u64) {
    let meta = object.meta_mut();
    meta.uid = Uuid::new_v4().to_string();
    meta.resource_version = version;
    meta.creation_timestamp = Some(Utc::now());
    meta.deletion_timestamp = None;
}

fn check_version<R: Resource>(stored: &R, incoming: &R) -> Result<(), StoreError> {
    if stored.meta().resource_version != incoming.meta().resource_version {
        return Err(StoreError::conflict(R::KIND, stored.key()));
    }
    Ok(())
}

/// Carry over the fields a client update may not change.
fn keep_server_fields<R: Resource>(stored: &R, updated: &mut R, version: u64) {
    let (stored, meta) = (stored.meta(), updated.meta_mut());
    meta.uid = stored.uid.clone();
    meta.creation_timestamp = stored.creation_timestamp;
    meta.deletion_timestamp = stored.deletion_timestamp;
    meta.resource_version = version;
}

/// Store backed by process memory; the fake platform for tests and the
/// backing store of the standalone binary.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store whose cache follows every write immediately.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State {
                auto_sync: true,
                ..State::default()
            }),
            events,
        }
    }

    /// A store whose cache only moves on [`MemoryStore::sync`].
    pub fn lagging() -> Self {
        let store = Self::new();
        store.set_auto_sync(false);
        store
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        let mut state = self.lock();
        state.auto_sync = enabled;
        if enabled {
            self.publish(&mut state);
        }
    }

    /// Publish every pending change to the read cache.
    pub fn sync(&self) {
        let mut state = self.lock();
        self.publish(&mut state);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Make the next client write fail with `err`.
    pub fn fail_next_write(&self, err: StoreError) {
        self.lock().injected.push_back(err);
    }

    /// Create or replace a fleet, as an administrator would.
    pub fn apply_fleet(&self, mut fleet: Fleet) -> Fleet {
        self.admin(|state| {
            let key = fleet.key();
            let version = state.bump();
            match state.live.fleets.get(&key) {
                Some(stored) => keep_server_fields(stored, &mut fleet, version),
                None => stamp_new(&mut fleet, version),
            }
            state.live.fleets.insert(key.clone(), fleet.clone());
            state.record(ResourceKind::Fleet, key, None);
            fleet
        })
    }

    /// Remove a fleet; its instances are deleted in turn.
    pub fn delete_fleet(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.admin(|state| {
            let fleet = state
                .live
                .fleets
                .remove(key)
                .ok_or_else(|| StoreError::not_found(Fleet::KIND, key))?;
            state.record(ResourceKind::Fleet, key.clone(), None);

            let owned: Vec<ObjectKey> = state
                .live
                .instances
                .values()
                .filter(|instance| is_controlled_by(*instance, &fleet))
                .map(Resource::key)
                .collect();
            for instance_key in owned {
                state.delete_instance(&instance_key);
            }
            Ok(())
        })
    }

    pub fn apply_node(&self, mut node: Node) -> Node {
        self.admin(|state| {
            let key = node.key();
            let version = state.bump();
            stamp_new(&mut node, version);
            state.live.nodes.insert(key.clone(), node.clone());
            state.record(ResourceKind::Node, key, None);
            node
        })
    }

    /// Write an instance state the way the in-pod sidecar does.
    pub fn set_instance_state(
        &self,
        key: &ObjectKey,
        instance_state: InstanceState,
    ) -> Result<Instance, StoreError> {
        self.admin(|state| {
            let version = state.bump();
            let instance = state
                .live
                .instances
                .get_mut(key)
                .ok_or_else(|| StoreError::not_found(Instance::KIND, key))?;
            instance.status.state = Some(instance_state);
            instance.metadata.resource_version = version;
            let instance = instance.clone();
            state.record_instance(&instance);
            Ok(instance)
        })
    }

    /// Place a pod on a node, as the scheduler would.
    pub fn bind_pod(&self, key: &ObjectKey, node_name: &str) -> Result<Pod, StoreError> {
        self.modify_pod(key, |pod| pod.spec.node_name = Some(node_name.to_string()))
    }

    /// Replace a pod's runtime status, as the node would.
    pub fn set_pod_status(&self, key: &ObjectKey, status: PodStatus) -> Result<Pod, StoreError> {
        self.modify_pod(key, |pod| pod.status = status)
    }

    /// Authoritative copy of an instance, ignoring cache lag.
    pub fn instance(&self, key: &ObjectKey) -> Option<Instance> {
        self.lock().live.instances.get(key).cloned()
    }

    /// Authoritative copies of every instance.
    pub fn instances(&self) -> Vec<Instance> {
        self.lock().live.instances.values().cloned().collect()
    }

    pub fn fleet(&self, key: &ObjectKey) -> Option<Fleet> {
        self.lock().live.fleets.get(key).cloned()
    }

    pub fn pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.lock().live.pods.get(key).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.lock().live.pods.values().cloned().collect()
    }

    fn modify_pod(
        &self,
        key: &ObjectKey,
        change: impl FnOnce(&mut Pod),
    ) -> Result<Pod, StoreError> {
        self.admin(|state| {
            let version = state.bump();
            let pod = state
                .live
                .pods
                .get_mut(key)
                .ok_or_else(|| StoreError::not_found(Pod::KIND, key))?;
            change(pod);
            pod.metadata.resource_version = version;
            let pod = pod.clone();
            state.record_pod(&pod);
            Ok(pod)
        })
    }

    /// Client write: honours injected failures.
    fn write<T>(&self, op: impl FnOnce(&mut State) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut state = self.lock();
        if let Some(err) = state.injected.pop_front() {
            return Err(err);
        }
        let result = op(&mut state);
        if state.auto_sync {
            self.publish(&mut state);
        }
        result
    }

    /// Platform-side write: never fails by injection.
    fn admin<T>(&self, op: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.lock();
        let result = op(&mut state);
        if state.auto_sync {
            self.publish(&mut state);
        }
        result
    }

    fn read<T>(&self, op: impl FnOnce(&Objects) -> T) -> T {
        op(&self.lock().cache)
    }

    fn publish(&self, state: &mut State) {
        let events = std::mem::take(&mut state.unpublished);
        for event in events {
            state.mirror(&event);
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FleetApi for MemoryStore {
    async fn get_fleet(&self, key: &ObjectKey) -> Result<Fleet, StoreError> {
        self.read(|cache| cache.fleets.get(key).cloned())
            .ok_or_else(|| StoreError::not_found(Fleet::KIND, key))
    }

    async fn list_fleets(&self) -> Result<Vec<Fleet>, StoreError> {
        Ok(self.read(|cache| cache.fleets.values().cloned().collect()))
    }

    async fn update_fleet_status(&self, fleet: &Fleet) -> Result<Fleet, StoreError> {
        self.write(|state| {
            let key = fleet.key();
            let version = state.bump();
            let stored = state
                .live
                .fleets
                .get_mut(&key)
                .ok_or_else(|| StoreError::not_found(Fleet::KIND, &key))?;
            check_version(stored, fleet)?;

            stored.status = fleet.status.clone();
            stored.metadata.resource_version = version;
            let updated = stored.clone();
            state.record(ResourceKind::Fleet, key, None);
            Ok(updated)
        })
    }
}

#[async_trait]
impl InstanceApi for MemoryStore {
    async fn get_instance(&self, key: &ObjectKey) -> Result<Instance, StoreError> {
        self.read(|cache| cache.instances.get(key).cloned())
            .ok_or_else(|| StoreError::not_found(Instance::KIND, key))
    }

    async fn list_instances_for_fleet(
        &self,
        namespace: &str,
        fleet: &str,
    ) -> Result<Vec<Instance>, StoreError> {
        Ok(self.read(|cache| {
            cache
                .instances
                .values()
                .filter(|i| {
                    i.metadata.namespace == namespace
                        && i.metadata.controller_name_of_kind(Fleet::KIND) == Some(fleet)
                })
                .cloned()
                .collect()
        }))
    }

    async fn create_instance(&self, instance: &Instance) -> Result<Instance, StoreError> {
        self.write(|state| {
            let key = instance.key();
            if state.live.instances.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: Instance::KIND,
                    key: key.to_string(),
                });
            }

            let mut created = instance.clone();
            let version = state.bump();
            stamp_new(&mut created, version);
            state.live.instances.insert(key, created.clone());
            state.record_instance(&created);
            Ok(created)
        })
    }

    async fn update_instance(&self, instance: &Instance) -> Result<Instance, StoreError> {
        self.write(|state| {
            let key = instance.key();
            let version = state.bump();
            let stored = state
                .live
                .instances
                .get_mut(&key)
                .ok_or_else(|| StoreError::not_found(Instance::KIND, &key))?;
            check_version(stored, instance)?;

            let mut updated = instance.clone();
            keep_server_fields(stored, &mut updated, version);
            updated.status = stored.status.clone();
            *stored = updated.clone();
            state.record_instance(&updated);

            if updated.metadata.is_terminating() && updated.metadata.finalizers.is_empty() {
                state.remove_instance(&key);
            }
            Ok(updated)
        })
    }

    async fn update_instance_status(&self, instance: &Instance) -> Result<Instance, StoreError> {
        self.write(|state| {
            let key = instance.key();
            let version = state.bump();
            let stored = state
                .live
                .instances
                .get_mut(&key)
                .ok_or_else(|| StoreError::not_found(Instance::KIND, &key))?;
            check_version(stored, instance)?;

            stored.status = instance.status.clone();
            stored.metadata.resource_version = version;
            let updated = stored.clone();
            state.record_instance(&updated);
            Ok(updated)
        })
    }

    async fn delete_instance(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.write(|state| {
            if !state.live.instances.contains_key(key) {
                return Err(StoreError::not_found(Instance::KIND, key));
            }
            state.delete_instance(key);
            Ok(())
        })
    }
}

#[async_trait]
impl PodApi for MemoryStore {
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, StoreError> {
        self.read(|cache| cache.pods.get(key).cloned())
            .ok_or_else(|| StoreError::not_found(Pod::KIND, key))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.write(|state| {
            let key = pod.key();
            if state.live.pods.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: Pod::KIND,
                    key: key.to_string(),
                });
            }

            let mut created = pod.clone();
            let version = state.bump();
            stamp_new(&mut created, version);
            state.live.pods.insert(key, created.clone());
            state.record_pod(&created);
            Ok(created)
        })
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.write(|state| {
            let key = pod.key();
            let version = state.bump();
            let stored = state
                .live
                .pods
                .get_mut(&key)
                .ok_or_else(|| StoreError::not_found(Pod::KIND, &key))?;
            check_version(stored, pod)?;

            let mut updated = pod.clone();
            keep_server_fields(stored, &mut updated, version);
            updated.status = stored.status.clone();
            *stored = updated.clone();
            state.record_pod(&updated);
            Ok(updated)
        })
    }
}

#[async_trait]
impl NodeApi for MemoryStore {
    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        let key = ObjectKey::new("", name);
        self.read(|cache| cache.nodes.get(&key).cloned())
            .ok_or_else(|| StoreError::not_found(Node::KIND, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use gamefleet_api::{names, ObjectMeta};

    fn fleet(name: &str) -> Fleet {
        Fleet {
            metadata: ObjectMeta::new("games", name),
            ..Default::default()
        }
    }

    fn instance_of(fleet: &Fleet, name: &str) -> Instance {
        let mut metadata = ObjectMeta::new("games", name);
        metadata.owner_references.push(fleet.controller_ref());
        Instance {
            metadata,
            ..Default::default()
        }
    }

    fn pod_of(instance: &Instance) -> Pod {
        let mut metadata = ObjectMeta::new("games", instance.name());
        metadata.owner_references.push(instance.controller_ref());
        Pod {
            metadata,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = MemoryStore::new();
        let fleet = store.apply_fleet(fleet("fleet-a"));

        let created = store
            .create_instance(&instance_of(&fleet, "fleet-a-aaaaa"))
            .await
            .unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert!(created.metadata.resource_version > fleet.metadata.resource_version);
        assert!(created.metadata.creation_timestamp.is_some());

        let err = store.create_instance(&created).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let fleet = store.apply_fleet(fleet("fleet-a"));

        let mut first = fleet.clone();
        first.status.current_active = 1;
        store.update_fleet_status(&first).await.unwrap();

        let mut second = fleet;
        second.status.current_active = 2;
        let err = store.update_fleet_status(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_lagging_cache() {
        let store = MemoryStore::lagging();
        let fleet = store.apply_fleet(fleet("fleet-a"));
        let key = fleet.key();

        assert!(store.get_fleet(&key).await.unwrap_err().is_not_found());
        store.sync();
        assert_eq!(store.get_fleet(&key).await.unwrap().metadata.uid, fleet.metadata.uid);

        store
            .create_instance(&instance_of(&fleet, "fleet-a-aaaaa"))
            .await
            .unwrap();
        assert!(store
            .list_instances_for_fleet("games", "fleet-a")
            .await
            .unwrap()
            .is_empty());

        store.sync();
        assert_eq!(
            store
                .list_instances_for_fleet("games", "fleet-a")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let store = MemoryStore::new();
        let a = store.apply_fleet(fleet("fleet-a"));
        let b = store.apply_fleet(fleet("fleet-b"));

        store.create_instance(&instance_of(&a, "fleet-a-aaaaa")).await.unwrap();
        store.create_instance(&instance_of(&b, "fleet-b-aaaaa")).await.unwrap();

        let listed = store.list_instances_for_fleet("games", "fleet-a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "fleet-a-aaaaa");
        assert!(store
            .list_instances_for_fleet("other", "fleet-a")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizer_and_cascades() {
        let store = MemoryStore::new();
        let fleet = store.apply_fleet(fleet("fleet-a"));

        let mut instance = instance_of(&fleet, "fleet-a-aaaaa");
        instance.metadata.add_finalizer(names::INSTANCE_FINALIZER);
        let instance = store.create_instance(&instance).await.unwrap();
        store.create_pod(&pod_of(&instance)).await.unwrap();

        store.delete_instance(&instance.key()).await.unwrap();
        let mut terminating = store.get_instance(&instance.key()).await.unwrap();
        assert!(terminating.metadata.is_terminating());
        assert!(store.pod(&instance.key()).is_some());

        terminating.metadata.remove_finalizer(names::INSTANCE_FINALIZER);
        store.update_instance(&terminating).await.unwrap();

        assert!(store.get_instance(&instance.key()).await.unwrap_err().is_not_found());
        assert!(store.get_pod(&instance.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_fleet_cascades_to_instances() {
        let store = MemoryStore::new();
        let fleet = store.apply_fleet(fleet("fleet-a"));
        let instance = store
            .create_instance(&instance_of(&fleet, "fleet-a-aaaaa"))
            .await
            .unwrap();

        store.delete_fleet(&fleet.key()).unwrap();
        assert!(store.instance(&instance.key()).is_none());
        assert!(store.delete_fleet(&fleet.key()).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_status_keeps_spec() {
        let store = MemoryStore::new();
        let fleet = store.apply_fleet(fleet("fleet-a"));
        let mut instance = instance_of(&fleet, "fleet-a-aaaaa");
        instance.spec.build_id = "build-1".to_string();
        let mut instance = store.create_instance(&instance).await.unwrap();

        instance.spec.build_id = "changed".to_string();
        instance.status.public_ip = Some("203.0.113.7".to_string());
        let updated = store.update_instance_status(&instance).await.unwrap();

        assert_eq!(updated.spec.build_id, "build-1");
        assert_eq!(updated.status.public_ip.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_events_carry_owner() {
        let store = MemoryStore::lagging();
        let mut events = store.subscribe();
        let fleet = store.apply_fleet(fleet("fleet-a"));
        let instance = store
            .create_instance(&instance_of(&fleet, "fleet-a-aaaaa"))
            .await
            .unwrap();

        assert!(events.try_recv().is_err());
        store.sync();

        let first = events.try_recv().unwrap();
        assert_eq!(first.kind, ResourceKind::Fleet);

        let second = events.try_recv().unwrap();
        assert_eq!(second.kind, ResourceKind::Instance);
        assert_eq!(second.key, instance.key());
        assert_eq!(second.owner, Some(fleet.key()));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        let fleet = store.apply_fleet(fleet("fleet-a"));

        store.fail_next_write(StoreError::Internal("etcd unavailable".to_string()));
        let err = store
            .create_instance(&instance_of(&fleet, "fleet-a-aaaaa"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        store
            .create_instance(&instance_of(&fleet, "fleet-a-aaaaa"))
            .await
            .unwrap();
    }
}
