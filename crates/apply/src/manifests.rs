//! Desired-state descriptors for a tenant's claim and deployment.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use longhall_core::{TenantId, WorldDetails, LOG_DIR, LOG_FILE};
use serde::{Deserialize, Serialize};

pub const GAME_CONTAINER: &str = "valheim";
pub const SIDECAR_CONTAINER: &str = "log-tailer";
/// Where the game keeps worlds and backups when run as root.
pub const SAVE_DIR: &str = "/root/.config/unity3d/IronGate/Valheim";
pub const TENANT_LABEL: &str = "longhall.io/tenant";

/// Cluster-wide knobs that shape every tenant's objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub namespace: String,
    pub server_image: String,
    pub sidecar_image: String,
    pub storage_class: Option<String>,
    pub volume_gi: u32,
}

fn labels(tenant: &TenantId) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("app.kubernetes.io/name".to_string(), "longhall".to_string());
    m.insert("app.kubernetes.io/managed-by".to_string(), "longhall".to_string());
    m.insert(TENANT_LABEL.to_string(), tenant.to_string());
    m
}

fn meta(name: &str, namespace: &str, labels: Option<BTreeMap<String, String>>) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), labels, ..Default::default() }
}

/// Claim backing the tenant's saved worlds.
pub fn pvc(cfg: &ManifestConfig, tenant: &TenantId) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(format!("{}Gi", cfg.volume_gi)));
    PersistentVolumeClaim {
        metadata: meta(&tenant.pvc_name(), &cfg.namespace, Some(labels(tenant))),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cfg.storage_class.clone(),
            resources: Some(VolumeResourceRequirements { requests: Some(requests), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Game server plus log sidecar. Uses the Recreate strategy so two servers
/// never mount the same world at once.
pub fn deployment(cfg: &ManifestConfig, tenant: &TenantId, world: &WorldDetails) -> Deployment {
    let lbl = labels(tenant);
    let mut selector = BTreeMap::new();
    selector.insert(TENANT_LABEL.to_string(), tenant.to_string());

    let mut res = BTreeMap::new();
    res.insert("cpu".to_string(), Quantity(world.cpu_requests.to_string()));
    res.insert("memory".to_string(), Quantity(format!("{}Gi", world.memory_requests)));

    let udp = |name: &str, port: u16| ContainerPort {
        name: Some(name.to_string()),
        container_port: i32::from(port),
        protocol: Some("UDP".to_string()),
        ..Default::default()
    };
    let mount = |name: &str, path: &str| VolumeMount { name: name.to_string(), mount_path: path.to_string(), ..Default::default() };

    let game = Container {
        name: GAME_CONTAINER.to_string(),
        image: Some(cfg.server_image.clone()),
        args: Some(vec![world.launch_args()]),
        ports: Some(vec![udp("game", world.port), udp("query", world.port.saturating_add(1))]),
        resources: Some(ResourceRequirements { requests: Some(res.clone()), limits: Some(res), ..Default::default() }),
        volume_mounts: Some(vec![mount("saves", SAVE_DIR), mount("logs", LOG_DIR)]),
        ..Default::default()
    };
    let sidecar = Container {
        name: SIDECAR_CONTAINER.to_string(),
        image: Some(cfg.sidecar_image.clone()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec!["touch \"$LOG_FILE\" && exec tail -n +1 -F \"$LOG_FILE\"".to_string()]),
        env: Some(vec![EnvVar { name: "LOG_FILE".to_string(), value: Some(LOG_FILE.to_string()), ..Default::default() }]),
        volume_mounts: Some(vec![mount("logs", LOG_DIR)]),
        ..Default::default()
    };

    Deployment {
        metadata: meta(&tenant.deployment_name(), &cfg.namespace, Some(lbl.clone())),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            strategy: Some(DeploymentStrategy { type_: Some("Recreate".to_string()), rolling_update: None }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(lbl), ..Default::default() }),
                spec: Some(PodSpec {
                    host_network: Some(true),
                    dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                    containers: vec![game, sidecar],
                    volumes: Some(vec![
                        Volume {
                            name: "saves".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: tenant.pvc_name(),
                                read_only: None,
                            }),
                            ..Default::default()
                        },
                        Volume { name: "logs".to_string(), empty_dir: Some(EmptyDirVolumeSource::default()), ..Default::default() },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Name-only descriptors. Enough for delete, which only needs identity.
pub fn pvc_ref(namespace: &str, name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim { metadata: meta(name, namespace, None), ..Default::default() }
}

pub fn deployment_ref(namespace: &str, name: &str) -> Deployment {
    Deployment { metadata: meta(name, namespace, None), ..Default::default() }
}

fn game_container_mut(d: &mut Deployment) -> Option<&mut Container> {
    d.spec.as_mut()?.template.spec.as_mut()?.containers.iter_mut().find(|c| c.name == GAME_CONTAINER)
}

/// Current launch arguments of the game container.
pub fn game_args(d: &Deployment) -> Option<&[String]> {
    d.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == GAME_CONTAINER)?
        .args
        .as_deref()
}

/// Replace the game container's argument list, leaving everything else as is.
/// Returns false when the deployment has no game container.
pub fn set_game_args(d: &mut Deployment, args: String) -> bool {
    match game_container_mut(d) {
        Some(c) => {
            c.args = Some(vec![args]);
            true
        }
        None => false,
    }
}
