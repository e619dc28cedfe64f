//! State machine plumbing for the provisioner registry.
//!
//! Each provisioner object runs one cooperative task that advances a
//! chain of `State` handlers; the task owns its object exclusively, so
//! handlers never race with each other for the same provisioner.

use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::provisioner::{PavProvisioner, PavProvisionerStatus};
use crate::registry::bundle::BundleConfig;

/// Process-lifetime state shared by every provisioner state machine.
pub struct RegistryContext {
    pub client: kube::Client,
    pub bundle: BundleConfig,
}

/// Reflects the latest version of an object's manifest as watch events
/// arrive.
#[derive(Clone)]
pub struct ObjectManifest {
    rx: watch::Receiver<PavProvisioner>,
}

impl ObjectManifest {
    pub fn new(initial: PavProvisioner) -> (watch::Sender<PavProvisioner>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, ObjectManifest { rx })
    }

    /// Obtain a clone of the latest manifest.
    pub fn latest(&self) -> PavProvisioner {
        self.rx.borrow().clone()
    }

    /// Waits until the manifest changes (or its watch source goes away).
    pub async fn changed(&mut self) {
        let _ = self.rx.changed().await;
    }

    pub fn deletion_requested(&self) -> bool {
        self.rx.borrow().metadata.deletion_timestamp.is_some()
    }
}

/// Represents the result of state execution and which state to run next.
pub enum Transition {
    Next(Box<dyn State>),
    /// Stop executing the state machine and report the result.
    Complete(anyhow::Result<()>),
}

impl Transition {
    pub fn next(state: impl State + 'static) -> Self {
        Transition::Next(Box::new(state))
    }
}

#[async_trait::async_trait]
/// A node in the registry state graph.
pub trait State: Send + Sync + std::fmt::Debug {
    /// Runs this state to its transition.
    async fn next(
        self: Box<Self>,
        ctx: &RegistryContext,
        manifest: &mut ObjectManifest,
    ) -> Transition;

    /// Status to report on the object while in this state.
    fn status(&self, manifest: &ObjectManifest) -> PavProvisionerStatus;
}

/// Drives the machine until a state completes, patching the status
/// subresource on every state entry.
pub async fn run_to_completion(
    ctx: &RegistryContext,
    mut state: Box<dyn State>,
    mut manifest: ObjectManifest,
) {
    let name = manifest.latest().name();
    loop {
        debug!(provisioner = %name, ?state, "entering state");
        patch_status(ctx, &name, state.status(&manifest)).await;
        match state.next(ctx, &mut manifest).await {
            Transition::Next(next) => state = next,
            Transition::Complete(Ok(())) => {
                debug!(provisioner = %name, "state machine complete");
                break;
            }
            Transition::Complete(Err(e)) => {
                warn!(provisioner = %name, error = ?e, "state machine failed");
                break;
            }
        }
    }
}

async fn patch_status(ctx: &RegistryContext, name: &str, status: PavProvisionerStatus) {
    let api: Api<PavProvisioner> = Api::all(ctx.client.clone());
    let patch = serde_json::json!({ "status": status });
    match api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => (),
        // Object already gone; the machine notices through its manifest.
        Err(kube::Error::Api(ae)) if ae.code == 404 => (),
        Err(e) => warn!(provisioner = %name, error = %e, "failed to patch status"),
    }
}
