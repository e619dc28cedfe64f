//! Rendering and reconciliation of a provisioner's infrastructure
//! bundle: namespace, service accounts, cluster-role bindings, the
//! controller-plugin deployment, the node-plugin daemonset, and the
//! driver registration object.
//!
//! The bundle is an invariant of the provisioner's existence: applied
//! during bootstrap, re-applied on drift while active, and deleted in
//! reverse order once the provisioner is tombstoned.

use std::collections::BTreeMap;
use std::path::PathBuf;

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, DeploymentStrategy,
};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, HostPathVolumeSource, Namespace,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, SecurityContext, ServiceAccount, Volume,
    VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use crate::error::Result;
use crate::provisioner::PavProvisioner;

/// Fixed cluster roles the per-provisioner service accounts bind to;
/// installed with the CRD, outside the registry's purview.
pub const CONTROLLER_PLUGIN_CLUSTER_ROLE: &str = "pav:controller-plugin";
pub const NODE_PLUGIN_CLUSTER_ROLE: &str = "pav:node-plugin";

const CONTROLLER_PLUGIN: &str = "controller-plugin";
const NODE_PLUGIN: &str = "node-plugin";

const FIELD_MANAGER: &str = "pav-controller-agent";

/// Images and host paths the rendered workloads use.
#[derive(Clone, Debug)]
pub struct BundleConfig {
    pub agent_image: String,
    /// The embedded external-provisioner sidecar.
    pub provisioner_sidecar_image: String,
    /// The embedded node-driver-registrar sidecar.
    pub registrar_sidecar_image: String,
    /// Image for worker-pod export sidecars.
    pub export_image: String,
    /// Host directory holding the per-volume directories.
    pub state_root: PathBuf,
    pub kubelet_dir: PathBuf,
}

/// All objects of one provisioner's bundle, in creation order.
pub struct Bundle {
    pub namespace: Namespace,
    pub service_accounts: Vec<ServiceAccount>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub deployment: Deployment,
    pub daemon_set: DaemonSet,
    pub csi_driver: CSIDriver,
}

pub fn render(provisioner: &PavProvisioner, config: &BundleConfig) -> Bundle {
    Bundle {
        namespace: namespace(provisioner),
        service_accounts: service_accounts(provisioner),
        cluster_role_bindings: cluster_role_bindings(provisioner),
        deployment: controller_deployment(provisioner, config),
        daemon_set: node_daemon_set(provisioner, config),
        csi_driver: csi_driver(provisioner),
    }
}

fn owned_metadata(provisioner: &PavProvisioner, name: &str, namespaced: bool) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: namespaced.then(|| provisioner.namespace_name()),
        labels: Some(BTreeMap::from([(
            crate::PROVISIONER_LABEL.to_owned(),
            provisioner.name(),
        )])),
        owner_references: provisioner.owner_reference().map(|r| vec![r]),
        ..Default::default()
    }
}

fn namespace(provisioner: &PavProvisioner) -> Namespace {
    Namespace {
        metadata: owned_metadata(provisioner, &provisioner.namespace_name(), false),
        ..Default::default()
    }
}

fn service_accounts(provisioner: &PavProvisioner) -> Vec<ServiceAccount> {
    [CONTROLLER_PLUGIN, NODE_PLUGIN]
        .iter()
        .map(|name| ServiceAccount {
            metadata: owned_metadata(provisioner, name, true),
            ..Default::default()
        })
        .collect()
}

fn cluster_role_bindings(provisioner: &PavProvisioner) -> Vec<ClusterRoleBinding> {
    [
        (CONTROLLER_PLUGIN, CONTROLLER_PLUGIN_CLUSTER_ROLE),
        (NODE_PLUGIN, NODE_PLUGIN_CLUSTER_ROLE),
    ]
    .iter()
    .map(|(plugin, role)| ClusterRoleBinding {
        metadata: owned_metadata(
            provisioner,
            &format!("pav-{}-{}", provisioner.name(), plugin),
            false,
        ),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "ClusterRole".to_owned(),
            name: (*role).to_owned(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: (*plugin).to_owned(),
            namespace: Some(provisioner.namespace_name()),
            ..Default::default()
        }]),
    })
    .collect()
}

fn controller_deployment(provisioner: &PavProvisioner, config: &BundleConfig) -> Deployment {
    let labels = BTreeMap::from([("app".to_owned(), CONTROLLER_PLUGIN.to_owned())]);

    Deployment {
        metadata: owned_metadata(provisioner, CONTROLLER_PLUGIN, true),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            // Single-writer semantics come from never letting two
            // controller plugins overlap during a rollout.
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_owned()),
                rolling_update: None,
            }),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(CONTROLLER_PLUGIN.to_owned()),
                    containers: vec![
                        Container {
                            name: "agent".to_owned(),
                            image: Some(config.agent_image.clone()),
                            args: Some(vec![
                                "csi-controller".to_owned(),
                                "--provisioner".to_owned(),
                                provisioner.name(),
                                "--csi-socket".to_owned(),
                                "/csi/csi.sock".to_owned(),
                                "--export-image".to_owned(),
                                config.export_image.clone(),
                            ]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "socket-dir".to_owned(),
                                mount_path: "/csi".to_owned(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        },
                        Container {
                            name: "csi-provisioner".to_owned(),
                            image: Some(config.provisioner_sidecar_image.clone()),
                            args: Some(vec![
                                "--csi-address=/csi/csi.sock".to_owned(),
                                // The controller plugin needs the claim
                                // objects; have the sidecar forward them.
                                "--extra-create-metadata".to_owned(),
                            ]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "socket-dir".to_owned(),
                                mount_path: "/csi".to_owned(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        },
                    ],
                    volumes: Some(vec![Volume {
                        name: "socket-dir".to_owned(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node_daemon_set(provisioner: &PavProvisioner, config: &BundleConfig) -> DaemonSet {
    let labels = BTreeMap::from([("app".to_owned(), NODE_PLUGIN.to_owned())]);
    let driver = provisioner.driver_name();
    let kubelet_dir = config.kubelet_dir.display();
    let plugin_dir = format!("{}/plugins/{}", kubelet_dir, driver);
    let state_root = config.state_root.display().to_string();

    DaemonSet {
        metadata: owned_metadata(provisioner, NODE_PLUGIN, true),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(NODE_PLUGIN.to_owned()),
                    containers: vec![
                        Container {
                            name: "agent".to_owned(),
                            image: Some(config.agent_image.clone()),
                            args: Some(vec![
                                "csi-node".to_owned(),
                                "--provisioner".to_owned(),
                                provisioner.name(),
                                "--csi-socket".to_owned(),
                                "/csi/csi.sock".to_owned(),
                                "--state-root".to_owned(),
                                state_root.clone(),
                            ]),
                            env: Some(vec![EnvVar {
                                name: "NODE_NAME".to_owned(),
                                value_from: Some(EnvVarSource {
                                    field_ref: Some(ObjectFieldSelector {
                                        field_path: "spec.nodeName".to_owned(),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }]),
                            // Bind mounts into pod volume directories
                            // need privileges.
                            security_context: Some(SecurityContext {
                                privileged: Some(true),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![
                                VolumeMount {
                                    name: "plugin-dir".to_owned(),
                                    mount_path: "/csi".to_owned(),
                                    ..Default::default()
                                },
                                VolumeMount {
                                    name: "state-root".to_owned(),
                                    mount_path: state_root.clone(),
                                    mount_propagation: Some("Bidirectional".to_owned()),
                                    ..Default::default()
                                },
                                VolumeMount {
                                    name: "pods-dir".to_owned(),
                                    mount_path: format!("{}/pods", kubelet_dir),
                                    mount_propagation: Some("Bidirectional".to_owned()),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        },
                        Container {
                            name: "node-driver-registrar".to_owned(),
                            image: Some(config.registrar_sidecar_image.clone()),
                            args: Some(vec![
                                "--csi-address=/csi/csi.sock".to_owned(),
                                format!("--kubelet-registration-path={}/csi.sock", plugin_dir),
                            ]),
                            volume_mounts: Some(vec![
                                VolumeMount {
                                    name: "plugin-dir".to_owned(),
                                    mount_path: "/csi".to_owned(),
                                    ..Default::default()
                                },
                                VolumeMount {
                                    name: "registration-dir".to_owned(),
                                    mount_path: "/registration".to_owned(),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        },
                    ],
                    volumes: Some(vec![
                        host_path_volume("plugin-dir", &plugin_dir, "DirectoryOrCreate"),
                        host_path_volume(
                            "registration-dir",
                            &format!("{}/plugins_registry", kubelet_dir),
                            "Directory",
                        ),
                        host_path_volume("state-root", &state_root, "DirectoryOrCreate"),
                        host_path_volume("pods-dir", &format!("{}/pods", kubelet_dir), "Directory"),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str, type_: &str) -> Volume {
    Volume {
        name: name.to_owned(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_owned(),
            type_: Some(type_.to_owned()),
        }),
        ..Default::default()
    }
}

fn csi_driver(provisioner: &PavProvisioner) -> CSIDriver {
    CSIDriver {
        metadata: owned_metadata(provisioner, &provisioner.driver_name(), false),
        spec: CSIDriverSpec {
            attach_required: Some(false),
            // The staging context wants the client pod; have the
            // kubelet pass pod info on publish.
            pod_info_on_mount: Some(true),
            volume_lifecycle_modes: Some(vec!["Persistent".to_owned()]),
            ..Default::default()
        },
    }
}

/// Applies the bundle with server-side apply; idempotent, so it also
/// serves as the drift reconciliation while a provisioner is active.
pub async fn apply(client: &kube::Client, provisioner: &PavProvisioner, config: &BundleConfig) -> Result<()> {
    let bundle = render(provisioner, config);
    let namespace = provisioner.namespace_name();
    let pp = PatchParams::apply(FIELD_MANAGER).force();

    let namespaces: Api<Namespace> = Api::all(client.clone());
    namespaces
        .patch(&namespace, &pp, &Patch::Apply(&bundle.namespace))
        .await?;

    let service_accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);
    for account in &bundle.service_accounts {
        service_accounts
            .patch(&account.name(), &pp, &Patch::Apply(account))
            .await?;
    }

    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    for binding in &bundle.cluster_role_bindings {
        bindings
            .patch(&binding.name(), &pp, &Patch::Apply(binding))
            .await?;
    }

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    deployments
        .patch(&bundle.deployment.name(), &pp, &Patch::Apply(&bundle.deployment))
        .await?;

    let daemon_sets: Api<DaemonSet> = Api::namespaced(client.clone(), &namespace);
    daemon_sets
        .patch(&bundle.daemon_set.name(), &pp, &Patch::Apply(&bundle.daemon_set))
        .await?;

    let drivers: Api<CSIDriver> = Api::all(client.clone());
    drivers
        .patch(&bundle.csi_driver.name(), &pp, &Patch::Apply(&bundle.csi_driver))
        .await?;

    debug!(provisioner = %provisioner.name(), "bundle applied");
    Ok(())
}

/// Whether both plugin workloads report ready.
pub async fn workloads_ready(client: &kube::Client, provisioner: &PavProvisioner) -> Result<bool> {
    let namespace = provisioner.namespace_name();

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let deployment = match deployments.get(CONTROLLER_PLUGIN).await {
        Ok(d) => d,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let deployment_ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
        >= 1;

    let daemon_sets: Api<DaemonSet> = Api::namespaced(client.clone(), &namespace);
    let daemon_set = match daemon_sets.get(NODE_PLUGIN).await {
        Ok(d) => d,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let daemon_set_ready = daemon_set
        .status
        .as_ref()
        .map(|s| s.number_ready >= s.desired_number_scheduled)
        .unwrap_or(false);

    Ok(deployment_ready && daemon_set_ready)
}

/// Deletes the bundle in reverse creation order; missing objects are
/// fine (a partial bootstrap still tears down cleanly).
pub async fn delete(client: &kube::Client, provisioner: &PavProvisioner) -> Result<()> {
    let namespace = provisioner.namespace_name();
    let dp = DeleteParams::default();

    let drivers: Api<CSIDriver> = Api::all(client.clone());
    ignore_not_found(drivers.delete(&provisioner.driver_name(), &dp).await)?;

    let daemon_sets: Api<DaemonSet> = Api::namespaced(client.clone(), &namespace);
    ignore_not_found(daemon_sets.delete(NODE_PLUGIN, &dp).await)?;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    ignore_not_found(deployments.delete(CONTROLLER_PLUGIN, &dp).await)?;

    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    for plugin in [NODE_PLUGIN, CONTROLLER_PLUGIN] {
        ignore_not_found(
            bindings
                .delete(&format!("pav-{}-{}", provisioner.name(), plugin), &dp)
                .await,
        )?;
    }

    let service_accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);
    for plugin in [NODE_PLUGIN, CONTROLLER_PLUGIN] {
        ignore_not_found(service_accounts.delete(plugin, &dp).await)?;
    }

    let namespaces: Api<Namespace> = Api::all(client.clone());
    ignore_not_found(namespaces.delete(&namespace, &dp).await)?;

    info!(provisioner = %provisioner.name(), "bundle deleted");
    Ok(())
}

fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn provisioner() -> PavProvisioner {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "pav.dev/v1alpha1",
            "kind": "PavProvisioner",
            "metadata": { "name": "nfs", "uid": "uid-42" },
            "spec": {
                "provisioningModes": ["Dynamic"],
                "volumeStaging": { "podTemplate": { "spec": {} } }
            }
        }))
        .unwrap()
    }

    fn config() -> BundleConfig {
        BundleConfig {
            agent_image: "ghcr.io/pav-storage/pav-agent:latest".to_owned(),
            provisioner_sidecar_image: "registry.k8s.io/sig-storage/csi-provisioner:v3.0.0"
                .to_owned(),
            registrar_sidecar_image:
                "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.3.0".to_owned(),
            export_image: "busybox:1.34".to_owned(),
            state_root: PathBuf::from("/var/lib/pav"),
            kubelet_dir: PathBuf::from("/var/lib/kubelet"),
        }
    }

    #[test]
    fn every_object_is_owned_by_the_provisioner() {
        let bundle = render(&provisioner(), &config());
        let owners = |meta: &ObjectMeta| {
            meta.owner_references
                .as_ref()
                .expect("missing owner reference")[0]
                .uid
                .clone()
        };
        assert_eq!(owners(&bundle.namespace.metadata), "uid-42");
        assert_eq!(owners(&bundle.deployment.metadata), "uid-42");
        assert_eq!(owners(&bundle.daemon_set.metadata), "uid-42");
        assert_eq!(owners(&bundle.csi_driver.metadata), "uid-42");
        for account in &bundle.service_accounts {
            assert_eq!(owners(&account.metadata), "uid-42");
        }
        for binding in &bundle.cluster_role_bindings {
            assert_eq!(owners(&binding.metadata), "uid-42");
        }
    }

    #[test]
    fn the_controller_plugin_recreates_instead_of_rolling() {
        let deployment = controller_deployment(&provisioner(), &config());
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));
    }

    #[test]
    fn the_provisioner_sidecar_forwards_claim_metadata() {
        let deployment = controller_deployment(&provisioner(), &config());
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        let sidecar = containers.iter().find(|c| c.name == "csi-provisioner").unwrap();
        assert!(sidecar
            .args
            .as_ref()
            .unwrap()
            .contains(&"--extra-create-metadata".to_owned()));
    }

    #[test]
    fn the_node_plugin_mounts_the_state_root_bidirectionally() {
        let daemon_set = node_daemon_set(&provisioner(), &config());
        let pod = daemon_set.spec.unwrap().template.spec.unwrap();
        let agent = pod.containers.iter().find(|c| c.name == "agent").unwrap();
        let mount = agent
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == "state-root")
            .unwrap();
        assert_eq!(mount.mount_path, "/var/lib/pav");
        assert_eq!(mount.mount_propagation.as_deref(), Some("Bidirectional"));
        assert_eq!(agent.security_context.as_ref().unwrap().privileged, Some(true));
    }

    #[test]
    fn the_registrar_points_at_the_per_driver_socket() {
        let daemon_set = node_daemon_set(&provisioner(), &config());
        let pod = daemon_set.spec.unwrap().template.spec.unwrap();
        let registrar = pod
            .containers
            .iter()
            .find(|c| c.name == "node-driver-registrar")
            .unwrap();
        assert!(registrar.args.as_ref().unwrap().iter().any(|a| {
            a == "--kubelet-registration-path=/var/lib/kubelet/plugins/nfs.pav.dev/csi.sock"
        }));
    }

    #[test]
    fn the_driver_registration_requests_pod_info() {
        let driver = csi_driver(&provisioner());
        assert_eq!(driver.metadata.name.as_deref(), Some("nfs.pav.dev"));
        assert_eq!(driver.spec.attach_required, Some(false));
        assert_eq!(driver.spec.pod_info_on_mount, Some(true));
    }

    #[test]
    fn bindings_reference_the_fixed_cluster_roles() {
        let bindings = cluster_role_bindings(&provisioner());
        let roles: Vec<&str> = bindings.iter().map(|b| b.role_ref.name.as_str()).collect();
        assert_eq!(roles, vec!["pav:controller-plugin", "pav:node-plugin"]);
        assert_eq!(
            bindings[0].metadata.name.as_deref(),
            Some("pav-nfs-controller-plugin")
        );
        let subject = &bindings[0].subjects.as_ref().unwrap()[0];
        assert_eq!(subject.namespace.as_deref(), Some("pav-nfs"));
    }
}
