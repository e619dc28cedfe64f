use std::time::Duration;

use tracing::warn;

use crate::provisioner::{PavProvisionerStatus, RegistryPhase};
use crate::registry::bundle;
use crate::registry::retry::Retry;
use crate::registry::state::{ObjectManifest, RegistryContext, State, Transition};

use super::Blocked;

/// Periodic full resync even without manifest changes, so drift in the
/// bundle (deleted deployment, edited daemonset) gets repaired.
const RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// The steady state: reconcile bundle drift and re-render on spec
/// changes until a delete request arrives.
#[derive(Default, Debug)]
pub struct Active;

#[async_trait::async_trait]
impl State for Active {
    async fn next(
        self: Box<Self>,
        ctx: &RegistryContext,
        manifest: &mut ObjectManifest,
    ) -> Transition {
        let mut retry = Retry::default();
        loop {
            if manifest.deletion_requested() {
                return Transition::next(Blocked);
            }
            let provisioner = manifest.latest();

            match bundle::apply(&ctx.client, &provisioner, &ctx.bundle).await {
                Ok(()) => {
                    retry.succeeded();
                    tokio::select! {
                        _ = manifest.changed() => (),
                        _ = tokio::time::sleep(RESYNC_PERIOD) => (),
                    }
                }
                Err(e) => {
                    warn!(provisioner = %provisioner.metadata.name.as_deref().unwrap_or(""),
                          error = %e, "bundle reconciliation failed");
                    retry.failed().await;
                }
            }
        }
    }

    fn status(&self, _manifest: &ObjectManifest) -> PavProvisionerStatus {
        PavProvisionerStatus {
            phase: Some(RegistryPhase::Active),
            message: None,
        }
    }
}
