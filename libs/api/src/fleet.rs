//! Fleets: the desired pool of game servers for one build.

use serde::{Deserialize, Serialize};

use crate::meta::{impl_resource, ObjectMeta};
use crate::pod::PodSpec;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fleet {
    pub metadata: ObjectMeta,
    pub spec: FleetSpec,
    #[serde(default)]
    pub status: FleetStatus,
}

impl_resource!(Fleet, "Fleet");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    #[serde(default)]
    pub build_id: String,

    #[serde(default)]
    pub title_id: String,

    /// Number of ready-to-play instances to keep warm.
    pub standing_by: u32,

    /// Upper bound on standingBy + active instances.
    pub max: u32,

    /// Cumulative crash count at which the fleet is marked unhealthy.
    pub crashes_to_mark_unhealthy: u32,

    pub template: PodSpec,

    #[serde(default)]
    pub ports_to_expose: Vec<PortToExpose>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_metadata: Vec<BuildMetadataItem>,
}

/// A container port that gets a host port from the port registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortToExpose {
    pub container_name: String,
    pub port_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadataItem {
    pub key: String,
    pub value: String,
}

/// Whether `container_name`/`port_name` is listed in `ports_to_expose`.
pub fn is_port_exposed(
    ports_to_expose: &[PortToExpose],
    container_name: &str,
    port_name: &str,
) -> bool {
    ports_to_expose
        .iter()
        .any(|p| p.container_name == container_name && p.port_name == port_name)
}

/// Host ports bound by the exposed container ports of a pod spec.
pub fn exposed_host_ports(template: &PodSpec, ports_to_expose: &[PortToExpose]) -> Vec<u16> {
    template
        .containers
        .iter()
        .flat_map(|c| {
            c.ports
                .iter()
                .filter(|p| is_port_exposed(ports_to_expose, &c.name, &p.name))
                .filter_map(|p| p.host_port)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FleetHealth {
    #[default]
    Healthy,
    /// Terminal until cleared by an operator; the fleet is not scaled.
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    #[serde(default)]
    pub current_initializing: u32,

    #[serde(default)]
    pub current_standing_by: u32,

    #[serde(default)]
    pub current_active: u32,

    /// Cumulative, never decreases.
    #[serde(default)]
    pub crashes_count: u32,

    #[serde(default)]
    pub health: FleetHealth,

    /// `"<current standingBy>/<desired standingBy>"`.
    #[serde(default)]
    pub current_standing_by_ready_desired: String,
}

impl Fleet {
    pub fn is_unhealthy(&self) -> bool {
        self.status.health == FleetHealth::Unhealthy
    }
}
