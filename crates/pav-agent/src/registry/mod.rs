//! The provisioner registry: watches `PavProvisioner` objects and runs
//! one state machine per object, serialized through a per-key channel
//! so concurrent watch events never race for the same provisioner.

pub mod bundle;
pub(crate) mod retry;
pub mod state;
pub mod states;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use tokio::sync::mpsc::Sender;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::error::Result;
use crate::provisioner::PavProvisioner;
use crate::registry::state::{run_to_completion, ObjectManifest, RegistryContext};
use crate::registry::states::{Bootstrapping, Tombstoned};
use crate::FINALIZER;

/// Claim annotations through which the external sidecar records the
/// responsible driver; used to count pending claims as volumes.
const PROVISIONER_ANNOTATIONS: [&str; 2] = [
    "volume.beta.kubernetes.io/storage-provisioner",
    "volume.kubernetes.io/storage-provisioner",
];

/// Watches provisioner objects and dispatches events to per-object
/// state machine tasks.
pub struct Registry {
    ctx: Arc<RegistryContext>,
    handlers: HashMap<String, Sender<Event<PavProvisioner>>>,
}

impl Registry {
    pub fn new(client: kube::Client, bundle: bundle::BundleConfig) -> Self {
        Registry {
            ctx: Arc::new(RegistryContext { client, bundle }),
            handlers: HashMap::new(),
        }
    }

    /// Listens for updates to provisioners and forwards them to the
    /// per-object tasks. Blocks forever.
    pub async fn run(&mut self) {
        let api = Api::<PavProvisioner>::all(self.ctx.client.clone());
        let mut informer = watcher(api, ListParams::default()).boxed();
        loop {
            match informer.try_next().await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => break,
                Err(error) => warn!(%error, "error streaming provisioner events"),
            }
        }
    }

    async fn handle_event(&mut self, event: Event<PavProvisioner>) {
        if let Event::Restarted(objects) = event {
            info!("got a watch restart, resyncing provisioners");
            if let Err(error) = self.resync(objects).await {
                warn!(?error, "error resyncing provisioners");
            }
            return;
        }
        if let Err(error) = self.dispatch(event).await {
            warn!(?error, "error dispatching provisioner event");
        }
    }

    /// Dispatches an event to the matching object's task, starting a
    /// task for objects seen for the first time.
    async fn dispatch(&mut self, event: Event<PavProvisioner>) -> anyhow::Result<()> {
        match &event {
            Event::Applied(object) => {
                let key = object.name();
                match self.handlers.get_mut(&key) {
                    Some(sender) => {
                        trace!(provisioner = %key, "found existing handler");
                        if let Err(error) = sender.send(event).await {
                            error!(provisioner = %key, %error, "error sending event, will retry on next event");
                        }
                    }
                    None => {
                        debug!(provisioner = %key, "creating handler");
                        let sender = self.start_object(event).await?;
                        self.handlers.insert(key, sender);
                    }
                }
                Ok(())
            }
            Event::Deleted(object) => {
                let key = object.name();
                if let Some(sender) = self.handlers.remove(&key) {
                    debug!(provisioner = %key, "removed handler");
                    sender.send(event).await?;
                }
                Ok(())
            }
            Event::Restarted(_) => unreachable!("restart events are resynced"),
        }
    }

    /// Requeues an apply for every live object and a delete for every
    /// object we track that the restarted watch no longer lists.
    async fn resync(&mut self, objects: Vec<PavProvisioner>) -> anyhow::Result<()> {
        let current: HashSet<String> = objects.iter().map(|o| o.name()).collect();
        let tracked: HashSet<String> = self.handlers.keys().cloned().collect();
        for key in tracked.difference(&current) {
            let mut gone = PavProvisioner::new(key, Default::default());
            gone.metadata.name = Some(key.clone());
            self.dispatch(Event::Deleted(gone)).await?;
        }
        for object in objects {
            self.dispatch(Event::Applied(object)).await?;
        }
        Ok(())
    }

    /// Starts the two tasks serving one object: a forwarder keeping the
    /// shared manifest current, and the state machine itself.
    async fn start_object(
        &self,
        initial_event: Event<PavProvisioner>,
    ) -> anyhow::Result<Sender<Event<PavProvisioner>>> {
        let (sender, mut receiver) = tokio::sync::mpsc::channel::<Event<PavProvisioner>>(128);

        let provisioner = match initial_event {
            Event::Applied(provisioner) => provisioner,
            _ => return Err(anyhow::anyhow!("got non-apply event when starting object")),
        };

        let (manifest_tx, manifest) = ObjectManifest::new(provisioner);
        let deleted = Arc::new(Notify::new());

        let forwarder_deleted = Arc::clone(&deleted);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    Event::Applied(provisioner) => {
                        if manifest_tx.send(provisioner).is_err() {
                            debug!("manifest receiver hung up, exiting");
                            return;
                        }
                    }
                    Event::Deleted(_) => {
                        forwarder_deleted.notify_one();
                        break;
                    }
                    _ => warn!("object got unexpected event, ignoring"),
                }
            }
        });

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(run_object_task(ctx, manifest, deleted));

        Ok(sender)
    }
}

async fn run_object_task(
    ctx: Arc<RegistryContext>,
    manifest: ObjectManifest,
    deleted: Arc<Notify>,
) {
    let name = manifest.latest().name();
    tokio::select! {
        _ = run_to_completion(&ctx, Box::new(Bootstrapping), manifest.clone()) => (),
        _ = deleted.notified() => {
            // The object vanished under us (finalizer raced or was
            // stripped); tear the bundle down best-effort.
            debug!(provisioner = %name, "object deleted, jumping to teardown");
            run_to_completion(&ctx, Box::new(Tombstoned), manifest.clone()).await;
        }
    }
    debug!(provisioner = %name, "object task finished");
}

/// Attaches the registry finalizer if it is not already present.
pub(crate) async fn ensure_finalizer(
    client: &kube::Client,
    provisioner: &PavProvisioner,
) -> Result<()> {
    let mut finalizers = provisioner.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    finalizers.push(FINALIZER.to_owned());

    let api: Api<PavProvisioner> = Api::all(client.clone());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&provisioner.name(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Drops the registry finalizer, letting the orchestrator remove the
/// object. A missing object means someone beat us to it.
pub(crate) async fn remove_finalizer(client: &kube::Client, name: &str) -> Result<()> {
    let api: Api<PavProvisioner> = Api::all(client.clone());
    let provisioner = match api.get(name).await {
        Ok(provisioner) => provisioner,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let finalizers: Vec<String> = provisioner
        .metadata
        .finalizers
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Whether any volume (bound or in flight) still references the
/// provisioner: a persistent volume carrying its driver, or a claim the
/// external sidecar has already earmarked for it.
pub(crate) async fn volumes_exist(
    client: &kube::Client,
    provisioner: &PavProvisioner,
) -> Result<bool> {
    let driver = provisioner.driver_name();

    let volumes: Api<PersistentVolume> = Api::all(client.clone());
    for volume in volumes.list(&ListParams::default()).await?.items {
        let is_ours = volume
            .spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .map(|csi| csi.driver == driver)
            .unwrap_or(false);
        if is_ours {
            return Ok(true);
        }
    }

    let claims: Api<PersistentVolumeClaim> = Api::all(client.clone());
    for claim in claims.list(&ListParams::default()).await?.items {
        let annotations = claim.annotations();
        if PROVISIONER_ANNOTATIONS
            .iter()
            .any(|key| annotations.get(*key) == Some(&driver))
        {
            return Ok(true);
        }
    }

    Ok(false)
}
