use std::time::Duration;

use tracing::warn;

use crate::provisioner::{PavProvisionerStatus, RegistryPhase};
use crate::registry;
use crate::registry::bundle;
use crate::registry::retry::Retry;
use crate::registry::state::{ObjectManifest, RegistryContext, State, Transition};

use super::{Active, Blocked};

const READINESS_POLL: Duration = Duration::from_secs(2);

/// Renders the infrastructure bundle and waits until both plugin
/// workloads report ready. The finalizer is attached first so a delete
/// request arriving mid-bootstrap still goes through teardown.
#[derive(Default, Debug)]
pub struct Bootstrapping;

#[async_trait::async_trait]
impl State for Bootstrapping {
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

            let ready = async {
                registry::ensure_finalizer(&ctx.client, &provisioner).await?;
                bundle::apply(&ctx.client, &provisioner, &ctx.bundle).await?;
                bundle::workloads_ready(&ctx.client, &provisioner).await
            }
            .await;

            match ready {
                Ok(true) => return Transition::next(Active),
                Ok(false) => {
                    retry.succeeded();
                    tokio::time::sleep(READINESS_POLL).await;
                }
                Err(e) => {
                    warn!(provisioner = %provisioner.metadata.name.as_deref().unwrap_or(""),
                          error = %e, "bootstrap attempt failed");
                    retry.failed().await;
                }
            }
        }
    }

    fn status(&self, _manifest: &ObjectManifest) -> PavProvisionerStatus {
        PavProvisionerStatus {
            phase: Some(RegistryPhase::Bootstrapping),
            message: Some("creating the provisioner's infrastructure bundle".to_owned()),
        }
    }
}
