//! Instances: one game-server attempt owned by a fleet.

use serde::{Deserialize, Serialize};

use crate::fleet::{exposed_host_ports, BuildMetadataItem, PortToExpose};
use crate::meta::{impl_resource, ObjectMeta};
use crate::names::SIDECAR_CONTAINER_NAME;
use crate::pod::PodSpec;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub metadata: ObjectMeta,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl_resource!(Instance, "Instance");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Copy of the fleet template with host ports filled in.
    pub template: PodSpec,

    #[serde(default)]
    pub build_id: String,

    #[serde(default)]
    pub title_id: String,

    #[serde(default)]
    pub ports_to_expose: Vec<PortToExpose>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_metadata: Vec<BuildMetadataItem>,
}

/// Lifecycle state, written by the sidecar except for the two exit states.
///
/// ```text
/// (none)/Initializing -> StandingBy -> Active -> Crashed | GameCompleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Initializing,
    StandingBy,
    Active,
    Crashed,
    GameCompleted,
    Terminating,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::StandingBy => "StandingBy",
            Self::Active => "Active",
            Self::Crashed => "Crashed",
            Self::GameCompleted => "GameCompleted",
            Self::Terminating => "Terminating",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exposed container port and the host port it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Renders mappings as `containerPort:hostPort` joined by commas.
pub fn format_port_mappings(ports: &[PortMapping]) -> String {
    ports
        .iter()
        .map(|p| format!("{}:{}", p.container_port, p.host_port))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// `None` until the sidecar reports the first state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
}

impl Instance {
    pub fn state(&self) -> Option<InstanceState> {
        self.status.state
    }

    /// No state reported yet, or explicitly initializing.
    pub fn is_initializing(&self) -> bool {
        matches!(self.status.state, None | Some(InstanceState::Initializing))
    }

    /// Instances that may be removed to shrink the pool: never Active ones.
    pub fn is_scale_down_candidate(&self) -> bool {
        self.is_initializing() || self.status.state == Some(InstanceState::StandingBy)
    }

    /// Host ports this instance holds in the port registry.
    pub fn host_ports(&self) -> Vec<u16> {
        exposed_host_ports(&self.spec.template, &self.spec.ports_to_expose)
    }

    /// Container/host port pairs of every non-sidecar container port that
    /// has a host port.
    pub fn port_mappings(spec: &PodSpec) -> Vec<PortMapping> {
        spec.containers
            .iter()
            .filter(|c| c.name != SIDECAR_CONTAINER_NAME)
            .flat_map(|c| c.ports.iter())
            .filter_map(|p| {
                p.host_port.map(|host_port| PortMapping {
                    container_port: p.container_port,
                    host_port,
                })
            })
            .collect()
    }
}
