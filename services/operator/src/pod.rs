//! Pod construction for instances.
//!
//! [`build_pod`] turns an instance into a ready-to-submit pod. The steps run
//! in a fixed order and must not be reordered: the data volume must exist
//! before containers mount it, and the sidecar and init container are added
//! after the game containers so that they do not receive the game-server
//! environment twice.

use gamefleet_api::names::{
    INIT_CONTAINER_NAME, LABEL_BUILD_ID, LABEL_BUILD_NAME, LABEL_OWNING_GAME_SERVER,
    LABEL_OWNING_OPERATOR, OPERATOR_NAME, SIDECAR_CONTAINER_NAME,
};
use gamefleet_api::{
    is_port_exposed, Container, EnvVar, Instance, ObjectMeta, Pod, PodSpec, Resource,
    RestartPolicy, Volume, VolumeMount,
};

pub const DATA_VOLUME_NAME: &str = "data";
pub const DATA_VOLUME_MOUNT_PATH: &str = "/data";
pub const GSDK_CONFIG_FILE: &str = "/data/Config/gsdkConfig.json";
pub const LOG_DIRECTORY: &str = "/data/GameLogs/";
pub const CERTIFICATES_DIRECTORY: &str = "/data/GameCertificates";
pub const SHARED_CONTENT_DIRECTORY: &str = "/data/GameSharedContent";

/// Pod-level settings that do not come from the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTemplateConfig {
    pub sidecar_image: String,
    pub init_container_image: String,

    /// Grants the sidecar permission to write instance status.
    pub service_account: String,

    /// Port the sidecar listens on for game-server heartbeats.
    pub sidecar_port: u16,

    /// Reported to the game server as its VM identity.
    pub vm_id: String,
}

impl PodTemplateConfig {
    pub fn new(sidecar_image: impl Into<String>, init_container_image: impl Into<String>) -> Self {
        Self {
            sidecar_image: sidecar_image.into(),
            init_container_image: init_container_image.into(),
            service_account: "gamefleet-gameserver-editor".to_string(),
            sidecar_port: 56001,
            vm_id: "gamefleet-cluster".to_string(),
        }
    }
}

/// Build the pod backing `instance`. Same name and namespace, controlled by
/// the instance.
pub fn build_pod(instance: &Instance, config: &PodTemplateConfig) -> Pod {
    let mut metadata = ObjectMeta::new(instance.metadata.namespace.clone(), instance.name());
    metadata.owner_references.push(instance.controller_ref());
    metadata.labels.extend([
        (LABEL_BUILD_ID.to_string(), instance.spec.build_id.clone()),
        (
            LABEL_BUILD_NAME.to_string(),
            instance
                .metadata
                .labels
                .get(LABEL_BUILD_NAME)
                .cloned()
                .unwrap_or_default(),
        ),
        (LABEL_OWNING_GAME_SERVER.to_string(), instance.name().to_string()),
        (LABEL_OWNING_OPERATOR.to_string(), OPERATOR_NAME.to_string()),
    ]);

    let mut spec = instance.spec.template.clone();

    set_restart_policy(&mut spec);
    add_data_volume(&mut spec);
    for container in &mut spec.containers {
        mount_data_volume(container);
        container.env.extend(game_server_env(instance));
    }
    attach_sidecar(&mut spec, instance, config);
    attach_init_container(&mut spec, instance, config);
    set_service_account(&mut spec, config);

    Pod {
        metadata,
        spec,
        ..Default::default()
    }
}

fn set_restart_policy(spec: &mut PodSpec) {
    spec.restart_policy = RestartPolicy::Never;
}

fn add_data_volume(spec: &mut PodSpec) {
    spec.volumes.push(Volume {
        name: DATA_VOLUME_NAME.to_string(),
        empty_dir: true,
    });
}

fn data_mount() -> VolumeMount {
    VolumeMount {
        name: DATA_VOLUME_NAME.to_string(),
        mount_path: DATA_VOLUME_MOUNT_PATH.to_string(),
    }
}

fn mount_data_volume(container: &mut Container) {
    container.volume_mounts.push(data_mount());
}

fn attach_sidecar(spec: &mut PodSpec, instance: &Instance, config: &PodTemplateConfig) {
    spec.containers.push(Container {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: config.sidecar_image.clone(),
        env: game_server_env(instance),
        volume_mounts: vec![data_mount()],
        ..Default::default()
    });
}

fn attach_init_container(spec: &mut PodSpec, instance: &Instance, config: &PodTemplateConfig) {
    spec.init_containers.push(Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: config.init_container_image.clone(),
        env: init_container_env(instance, config),
        volume_mounts: vec![data_mount()],
        ..Default::default()
    });
}

fn set_service_account(spec: &mut PodSpec, config: &PodTemplateConfig) {
    spec.service_account_name = Some(config.service_account.clone());
}

fn game_server_env(instance: &Instance) -> Vec<EnvVar> {
    vec![
        EnvVar::new("PF_GAMESERVER_NAME", instance.name()),
        EnvVar::new("GSDK_CONFIG_FILE", GSDK_CONFIG_FILE),
        EnvVar::new("PF_GAMESERVER_NAMESPACE", instance.metadata.namespace.clone()),
        EnvVar::new("PF_BUILD_ID", instance.spec.build_id.clone()),
        EnvVar::new("PF_TITLE_ID", instance.spec.title_id.clone()),
    ]
}

fn init_container_env(instance: &Instance, config: &PodTemplateConfig) -> Vec<EnvVar> {
    vec![
        EnvVar::new("HEARTBEAT_ENDPOINT", format!("localhost:{}", config.sidecar_port)),
        EnvVar::new("GSDK_CONFIG_FILE", GSDK_CONFIG_FILE),
        EnvVar::new("PF_SHARED_CONTENT_FOLDER", SHARED_CONTENT_DIRECTORY),
        EnvVar::new("CERTIFICATE_FOLDER", CERTIFICATES_DIRECTORY),
        EnvVar::new("PF_SERVER_LOG_DIRECTORY", LOG_DIRECTORY),
        EnvVar::new("PF_VM_ID", config.vm_id.clone()),
        EnvVar::new("PF_GAMESERVER_NAME", instance.name()),
        EnvVar::new("PF_GAMESERVER_PORTS", game_ports(instance)),
        EnvVar::new("PF_GAMESERVER_BUILD_METADATA", build_metadata(instance)),
    ]
}

/// `name,containerPort,hostPort` for every exposed port, joined by `?`.
fn game_ports(instance: &Instance) -> String {
    instance
        .spec
        .template
        .containers
        .iter()
        .filter(|c| c.name != SIDECAR_CONTAINER_NAME)
        .flat_map(|c| {
            c.ports
                .iter()
                .filter(|p| is_port_exposed(&instance.spec.ports_to_expose, &c.name, &p.name))
                .map(|p| {
                    format!(
                        "{},{},{}",
                        p.name,
                        p.container_port,
                        p.host_port.unwrap_or_default()
                    )
                })
        })
        .collect::<Vec<_>>()
        .join("?")
}

/// `key,value` for every build metadata item, joined by `?`.
fn build_metadata(instance: &Instance) -> String {
    instance
        .spec
        .build_metadata
        .iter()
        .map(|item| format!("{},{}", item.key, item.value))
        .collect::<Vec<_>>()
        .join("?")
}
