use std::time::Duration;

use tracing::{info, warn};

use crate::provisioner::{PavProvisionerStatus, RegistryPhase};
use crate::registry;
use crate::registry::retry::Retry;
use crate::registry::state::{ObjectManifest, RegistryContext, State, Transition};

use super::Tombstoned;

const VOLUME_POLL: Duration = Duration::from_secs(5);

/// A delete request has arrived. While any volume of the provisioner
/// exists the finalizer keeps the object pinned here; once the last
/// volume is gone the machine proceeds to teardown.
#[derive(Default, Debug)]
pub struct Blocked;

#[async_trait::async_trait]
impl State for Blocked {
    async fn next(
        self: Box<Self>,
        ctx: &RegistryContext,
        manifest: &mut ObjectManifest,
    ) -> Transition {
        let provisioner = manifest.latest();
        let name = provisioner.metadata.name.clone().unwrap_or_default();
        let mut retry = Retry::default();
        let mut reported = false;

        loop {
            match registry::volumes_exist(&ctx.client, &provisioner).await {
                Ok(false) => return Transition::next(Tombstoned),
                Ok(true) => {
                    retry.succeeded();
                    if !reported {
                        info!(provisioner = %name, "deletion blocked while volumes exist");
                        reported = true;
                    }
                    tokio::time::sleep(VOLUME_POLL).await;
                }
                Err(e) => {
                    warn!(provisioner = %name, error = %e, "failed to check for volumes");
                    retry.failed().await;
                }
            }
        }
    }

    fn status(&self, _manifest: &ObjectManifest) -> PavProvisionerStatus {
        PavProvisionerStatus {
            phase: Some(RegistryPhase::Blocked),
            message: Some("deletion is blocked while volumes of this provisioner exist".to_owned()),
        }
    }
}
