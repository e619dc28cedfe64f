use tracing::warn;

use crate::provisioner::{PavProvisionerStatus, RegistryPhase};
use crate::registry;
use crate::registry::bundle;
use crate::registry::retry::Retry;
use crate::registry::state::{ObjectManifest, RegistryContext, State, Transition};

/// The finalizer has released: delete the bundle in reverse order,
/// then drop the finalizer so the orchestrator can remove the object.
#[derive(Default, Debug)]
pub struct Tombstoned;

#[async_trait::async_trait]
impl State for Tombstoned {
    async fn next(
        self: Box<Self>,
        ctx: &RegistryContext,
        manifest: &mut ObjectManifest,
    ) -> Transition {
        let provisioner = manifest.latest();
        let name = provisioner.metadata.name.clone().unwrap_or_default();
        let mut retry = Retry::default();

        loop {
            let result = async {
                bundle::delete(&ctx.client, &provisioner).await?;
                registry::remove_finalizer(&ctx.client, &name).await
            }
            .await;

            match result {
                Ok(()) => return Transition::Complete(Ok(())),
                Err(e) => {
                    warn!(provisioner = %name, error = %e, "teardown attempt failed");
                    retry.failed().await;
                }
            }
        }
    }

    fn status(&self, _manifest: &ObjectManifest) -> PavProvisionerStatus {
        PavProvisionerStatus {
            phase: Some(RegistryPhase::Tombstoned),
            message: Some("deleting the provisioner's infrastructure bundle".to_owned()),
        }
    }
}
