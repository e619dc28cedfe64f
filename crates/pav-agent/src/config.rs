//! Configuration for the agent binary. The same binary serves three
//! roles: the cluster-wide controller agent (registry + webhook), the
//! per-provisioner CSI controller plugin, and the per-node CSI node
//! plugin; the bundle rendered by the registry wires the plugin roles
//! up with the right flags.

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "pav-agent",
    about = "Run Kubernetes storage provisioners defined out of pod templates"
)]
pub enum Command {
    /// Run the cluster-wide controller agent: the provisioner registry
    /// and the admission webhook.
    Registry(RegistryConfig),
    /// Serve the CSI controller service for one provisioner.
    CsiController(CsiControllerConfig),
    /// Serve the CSI node service for one provisioner on this node.
    CsiNode(CsiNodeConfig),
}

#[derive(StructOpt, Clone, Debug)]
pub struct RegistryConfig {
    #[structopt(
        long = "agent-image",
        env = "PAV_AGENT_IMAGE",
        help = "Image the plugin workloads in each provisioner's bundle run"
    )]
    pub agent_image: String,

    #[structopt(
        long = "provisioner-sidecar-image",
        env = "PAV_PROVISIONER_SIDECAR_IMAGE",
        default_value = "registry.k8s.io/sig-storage/csi-provisioner:v3.0.0",
        help = "Image of the embedded external-provisioner sidecar"
    )]
    pub provisioner_sidecar_image: String,

    #[structopt(
        long = "registrar-sidecar-image",
        env = "PAV_REGISTRAR_SIDECAR_IMAGE",
        default_value = "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.3.0",
        help = "Image of the embedded node-driver-registrar sidecar"
    )]
    pub registrar_sidecar_image: String,

    #[structopt(
        long = "export-image",
        env = "PAV_EXPORT_IMAGE",
        default_value = "docker.io/library/busybox:1.34",
        help = "Image of the worker-pod export sidecar"
    )]
    pub export_image: String,

    #[structopt(
        long = "state-root",
        env = "PAV_STATE_ROOT",
        default_value = "/var/lib/pav",
        parse(from_os_str),
        help = "Host directory the node plugins keep per-volume state under"
    )]
    pub state_root: PathBuf,

    #[structopt(
        long = "kubelet-dir",
        env = "PAV_KUBELET_DIR",
        default_value = "/var/lib/kubelet",
        parse(from_os_str),
        help = "The kubelet's state directory on every node"
    )]
    pub kubelet_dir: PathBuf,

    #[structopt(
        long = "webhook-service-name",
        env = "PAV_WEBHOOK_SERVICE_NAME",
        default_value = "pav-webhook",
        help = "Service in front of the admission webhook"
    )]
    pub webhook_service_name: String,

    #[structopt(
        long = "webhook-service-namespace",
        env = "PAV_WEBHOOK_SERVICE_NAMESPACE",
        default_value = "pav-system",
        help = "Namespace of the webhook service"
    )]
    pub webhook_service_namespace: String,

    #[structopt(
        long = "webhook-port",
        env = "PAV_WEBHOOK_PORT",
        default_value = "8443",
        help = "Port the webhook listens on behind the port-443 service"
    )]
    pub webhook_port: u16,
}

#[derive(StructOpt, Clone, Debug)]
pub struct CsiControllerConfig {
    #[structopt(
        long = "provisioner",
        env = "PAV_PROVISIONER",
        help = "Name of the PavProvisioner this plugin serves"
    )]
    pub provisioner: String,

    #[structopt(
        long = "csi-socket",
        env = "PAV_CSI_SOCKET",
        default_value = "/csi/csi.sock",
        parse(from_os_str),
        help = "Unix socket the external sidecars dial"
    )]
    pub csi_socket: PathBuf,

    #[structopt(
        long = "export-image",
        env = "PAV_EXPORT_IMAGE",
        default_value = "docker.io/library/busybox:1.34",
        help = "Image of the worker-pod export sidecar"
    )]
    pub export_image: String,
}

#[derive(StructOpt, Clone, Debug)]
pub struct CsiNodeConfig {
    #[structopt(
        long = "provisioner",
        env = "PAV_PROVISIONER",
        help = "Name of the PavProvisioner this plugin serves"
    )]
    pub provisioner: String,

    #[structopt(
        long = "node-name",
        env = "NODE_NAME",
        help = "The name of the node this plugin runs on"
    )]
    pub node_name: String,

    #[structopt(
        long = "csi-socket",
        env = "PAV_CSI_SOCKET",
        default_value = "/csi/csi.sock",
        parse(from_os_str),
        help = "Unix socket the kubelet dials"
    )]
    pub csi_socket: PathBuf,

    #[structopt(
        long = "state-root",
        env = "PAV_STATE_ROOT",
        default_value = "/var/lib/pav",
        parse(from_os_str),
        help = "Host directory per-volume state lives under"
    )]
    pub state_root: PathBuf,

    #[structopt(
        long = "export-image",
        env = "PAV_EXPORT_IMAGE",
        default_value = "docker.io/library/busybox:1.34",
        help = "Image of the worker-pod export sidecar"
    )]
    pub export_image: String,
}

impl RegistryConfig {
    pub fn bundle_config(&self) -> crate::registry::bundle::BundleConfig {
        crate::registry::bundle::BundleConfig {
            agent_image: self.agent_image.clone(),
            provisioner_sidecar_image: self.provisioner_sidecar_image.clone(),
            registrar_sidecar_image: self.registrar_sidecar_image.clone(),
            export_image: self.export_image.clone(),
            state_root: self.state_root.clone(),
            kubelet_dir: self.kubelet_dir.clone(),
        }
    }
}
