use std::net::SocketAddr;

use structopt::StructOpt;
use tracing::warn;

use pav_agent::admission;
use pav_agent::config::{Command, CsiControllerConfig, CsiNodeConfig, RegistryConfig};
use pav_agent::csi;
use pav_agent::registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Tries a kubeconfig file first, then falls back on the in-cluster
    // configuration.
    let client = kube::Client::try_default().await?;

    match Command::from_args() {
        Command::Registry(config) => run_registry(client, config).await,
        Command::CsiController(config) => run_csi_controller(client, config).await,
        Command::CsiNode(config) => run_csi_node(client, config).await,
    }
}

/// The cluster-wide controller agent: admission webhook plus the
/// provisioner registry. Runs as a single replica; the state machines
/// are idempotent under the orchestrator's optimistic concurrency, so
/// no leader election is needed.
async fn run_registry(client: kube::Client, config: RegistryConfig) -> anyhow::Result<()> {
    let tls = admission::tls::self_signed(
        &config.webhook_service_name,
        &config.webhook_service_namespace,
    )?;
    admission::tls::install_webhook_config(
        client.clone(),
        &tls,
        &config.webhook_service_name,
        &config.webhook_service_namespace,
    )
    .await?;

    let addr: SocketAddr = ([0, 0, 0, 0], config.webhook_port).into();
    let webhook = admission::endpoint(tls, addr);

    let mut registry = Registry::new(client, config.bundle_config());

    tokio::select! {
        _ = registry.run() => warn!("registry main loop exited"),
        _ = webhook => warn!("admission webhook exited"),
    }
    Ok(())
}

async fn run_csi_controller(
    client: kube::Client,
    config: CsiControllerConfig,
) -> anyhow::Result<()> {
    let driver_name = pav_agent::provisioner::driver_name(&config.provisioner);
    let identity = csi::IdentityService::controller(driver_name);
    let controller =
        csi::ControllerPlugin::new(client, config.provisioner, config.export_image).await;
    csi::serve_controller(identity, controller, &config.csi_socket).await
}

async fn run_csi_node(client: kube::Client, config: CsiNodeConfig) -> anyhow::Result<()> {
    let driver_name = pav_agent::provisioner::driver_name(&config.provisioner);
    let identity = csi::IdentityService::node(driver_name);
    let node = csi::NodePlugin::new(
        client,
        config.provisioner,
        config.node_name,
        config.state_root,
        config.export_image,
    );
    csi::serve_node(identity, node, &config.csi_socket).await
}
