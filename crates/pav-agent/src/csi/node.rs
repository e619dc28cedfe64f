//! The node plugin: the staging and unstaging state machines behind
//! `Node.NodePublishVolume` and `Node.NodeUnpublishVolume`, plus the
//! host-side per-volume directory management.

use std::collections::BTreeMap;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use k8s_csi::v1_3_0::node_server::Node as NodeService;
use k8s_csi::v1_3_0::volume_capability::AccessType;
use k8s_csi::v1_3_0::*;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use kube::api::ListParams;
use kube::{Api, Resource};
use serde_json::Value;
use tracing::{info, warn};

use crate::capacity;
use crate::csi::controller::{CONTEXT_PVC_NAME, CONTEXT_PVC_NAMESPACE};
use crate::error::Error;
use crate::mount;
use crate::provisioner::phase::Phase;
use crate::provisioner::{namespace_name, PavProvisioner};
use crate::template::context::StagingContext;
use crate::template::TemplateEngine;
use crate::worker::keyed::KeyedLocks;
use crate::worker::{PavVolumeSource, WorkerParams, WorkerPodDriver};

const RESERVED_CONTEXT_PREFIXES: [&str; 2] = ["csi.storage.k8s.io/", "pav.dev/"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VolumeMode {
    Filesystem,
    Block,
}

impl VolumeMode {
    fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Filesystem => "Filesystem",
            VolumeMode::Block => "Block",
        }
    }
}

pub struct NodePlugin {
    client: kube::Client,
    provisioner_name: String,
    node_name: String,
    state_root: PathBuf,
    engine: TemplateEngine,
    driver: WorkerPodDriver,
    volume_locks: KeyedLocks,
}

impl NodePlugin {
    pub fn new(
        client: kube::Client,
        provisioner_name: String,
        node_name: String,
        state_root: PathBuf,
        export_image: String,
    ) -> Self {
        let namespace = namespace_name(&provisioner_name);
        NodePlugin {
            engine: TemplateEngine::new(client.clone()),
            driver: WorkerPodDriver::new(client.clone(), namespace, export_image),
            client,
            provisioner_name,
            node_name,
            state_root,
            volume_locks: KeyedLocks::new(),
        }
    }

    /// The stable per-volume directory on this node's filesystem.
    fn volume_dir(&self, handle: &str) -> PathBuf {
        self.state_root.join(&self.provisioner_name).join(handle)
    }

    async fn load_provisioner(&self) -> Result<PavProvisioner, tonic::Status> {
        let api: Api<PavProvisioner> = Api::all(self.client.clone());
        api.get(&self.provisioner_name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => tonic::Status::failed_precondition(format!(
                "provisioner {} no longer exists",
                self.provisioner_name
            )),
            e => tonic::Status::internal(e.to_string()),
        })
    }

    async fn find_volume(&self, handle: &str) -> Option<PersistentVolume> {
        let driver = crate::provisioner::driver_name(&self.provisioner_name);
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = volumes.list(&ListParams::default()).await.ok()?;
        list.items.into_iter().find(|pv| {
            pv.spec
                .as_ref()
                .and_then(|spec| spec.csi.as_ref())
                .map(|csi| csi.driver == driver && csi.volume_handle == handle)
                .unwrap_or(false)
        })
    }

    /// Builds the staging/unstaging context for a volume. The claim and
    /// volume objects may legitimately be absent (already deleted when
    /// unstaging runs late); templates see `null` then.
    async fn staging_context(
        &self,
        handle: &str,
        volume_mode: Option<VolumeMode>,
        read_only: bool,
        volume_context: &BTreeMap<String, String>,
    ) -> Result<StagingContext, tonic::Status> {
        let pv = self.find_volume(handle).await;
        let pv_spec = pv.as_ref().and_then(|pv| pv.spec.clone()).unwrap_or_default();

        let mut params: BTreeMap<String, String> = volume_context
            .iter()
            .filter(|(key, _)| {
                !RESERVED_CONTEXT_PREFIXES
                    .iter()
                    .any(|prefix| key.starts_with(prefix))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if params.is_empty() {
            // Unpublish has no volume context; recover the parameters
            // from the persisted volume attributes.
            params = pv_spec
                .csi
                .as_ref()
                .and_then(|csi| csi.volume_attributes.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|(key, _)| {
                    !RESERVED_CONTEXT_PREFIXES
                        .iter()
                        .any(|prefix| key.starts_with(prefix))
                })
                .collect();
        }

        let claim_identity = volume_context
            .get(CONTEXT_PVC_NAME)
            .zip(volume_context.get(CONTEXT_PVC_NAMESPACE))
            .map(|(name, namespace)| (name.clone(), namespace.clone()))
            .or_else(|| {
                pv_spec.claim_ref.as_ref().and_then(|claim_ref| {
                    claim_ref.name.clone().zip(claim_ref.namespace.clone())
                })
            });
        let pvc = match claim_identity {
            Some((name, namespace)) => {
                let claims: Api<PersistentVolumeClaim> =
                    Api::namespaced(self.client.clone(), &namespace);
                claims
                    .get(&name)
                    .await
                    .map(|pvc| serde_json::to_value(pvc).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null)
            }
            None => Value::Null,
        };

        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes
            .get(&self.node_name)
            .await
            .map_err(|e| tonic::Status::internal(format!("reading node object: {}", e)))?;

        let capacity_bytes = pv_spec
            .capacity
            .as_ref()
            .and_then(|c| c.get("storage"))
            .and_then(|q| capacity::parse(q.0.trim()).ok())
            .unwrap_or(0);

        let access_modes = pv_spec.access_modes.clone().unwrap_or_default();

        // Unstaging runs without a capability in hand; fall back to the
        // persisted volume's mode then.
        let volume_mode = match volume_mode {
            Some(mode) => mode.as_str().to_owned(),
            None => pv_spec
                .volume_mode
                .clone()
                .unwrap_or_else(|| "Filesystem".to_owned()),
        };

        Ok(StagingContext {
            volume_mode,
            access_modes,
            capacity: capacity_bytes,
            params,
            handle: handle.to_owned(),
            read_only,
            pvc,
            pv: pv
                .map(|pv| serde_json::to_value(pv).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            node: serde_json::to_value(node).unwrap_or(Value::Null),
        })
    }

    fn provisioner_uid(&self, provisioner: &PavProvisioner) -> String {
        provisioner.meta().uid.clone().unwrap_or_default()
    }

    /// Runs the staging worker until it terminates successfully or
    /// signals `/pav/ready` while staying alive.
    async fn stage(
        &self,
        provisioner: &PavProvisioner,
        ctx: &StagingContext,
        dir: &Path,
    ) -> Result<(), Error> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Staging(format!("creating {}: {}", dir.display(), e)))?;

        let evaluated = self
            .engine
            .evaluate_tree(
                "volumeStaging.podTemplate",
                &provisioner.spec.volume_staging.pod_template,
                ctx,
            )
            .await?;

        let verdict = self
            .driver
            .run_phase(WorkerParams {
                phase: Phase::Staging,
                provisioner_uid: &self.provisioner_uid(provisioner),
                handle: &ctx.handle,
                retry_epoch: 0,
                template: &evaluated,
                owner: None,
                node_name: Some(&self.node_name),
                pav_volume: PavVolumeSource::HostDir(dir),
            })
            .await?;

        if !verdict.succeeded {
            return Err(Error::Staging(verdict.failure_message()));
        }
        Ok(())
    }

    /// Reverts staging: terminate a live staging worker, run the
    /// unstaging worker if one is templated, remove the per-volume
    /// directory. Returns the unstaging failure, if any.
    async fn unstage(
        &self,
        provisioner: &PavProvisioner,
        ctx: &StagingContext,
        dir: &Path,
    ) -> Result<(), Error> {
        let uid = self.provisioner_uid(provisioner);
        let staging_pod = WorkerPodDriver::pod_name(&uid, Phase::Staging, &ctx.handle, 0);
        self.driver
            .terminate(&staging_pod, Phase::Unstaging.descriptor().timeout)
            .await?;

        if let Some(unstaging) = &provisioner.spec.volume_unstaging {
            if tokio::fs::metadata(dir).await.is_ok() {
                let evaluated = self
                    .engine
                    .evaluate_tree("volumeUnstaging.podTemplate", &unstaging.pod_template, ctx)
                    .await?;
                let verdict = self
                    .driver
                    .run_phase(WorkerParams {
                        phase: Phase::Unstaging,
                        provisioner_uid: &uid,
                        handle: &ctx.handle,
                        retry_epoch: 0,
                        template: &evaluated,
                        owner: None,
                        node_name: Some(&self.node_name),
                        pav_volume: PavVolumeSource::HostDir(dir),
                    })
                    .await?;
                if !verdict.succeeded {
                    return Err(Error::Unrecoverable {
                        phase: Phase::Unstaging,
                        message: verdict.failure_message(),
                    });
                }
            }
        }

        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => {
                return Err(Error::Staging(format!(
                    "removing {}: {}",
                    dir.display(),
                    e
                )))
            }
        }
        Ok(())
    }

    /// Rollback path for failed publishes; never overrides the original
    /// error.
    async fn rollback_staging(&self, provisioner: &PavProvisioner, ctx: &StagingContext, dir: &Path) {
        if let Err(e) = self.unstage(provisioner, ctx, dir).await {
            warn!(handle = %ctx.handle, error = %e, "synthesized unstaging failed");
        } else {
            info!(handle = %ctx.handle, "synthesized unstaging completed");
        }
    }
}

async fn artifact_kind(artifact: &Path) -> Option<VolumeMode> {
    let metadata = tokio::fs::metadata(artifact).await.ok()?;
    if metadata.is_dir() {
        Some(VolumeMode::Filesystem)
    } else if metadata.file_type().is_block_device() {
        Some(VolumeMode::Block)
    } else {
        None
    }
}

fn requested_mode(capability: Option<&VolumeCapability>) -> Result<VolumeMode, tonic::Status> {
    match capability.and_then(|c| c.access_type.as_ref()) {
        Some(AccessType::Mount(_)) => Ok(VolumeMode::Filesystem),
        Some(AccessType::Block(_)) => Ok(VolumeMode::Block),
        None => Err(tonic::Status::invalid_argument(
            "a volume capability with an access type is required",
        )),
    }
}

#[async_trait::async_trait]
impl NodeService for NodePlugin {
    async fn node_publish_volume(
        &self,
        request: tonic::Request<NodePublishVolumeRequest>,
    ) -> Result<tonic::Response<NodePublishVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        let handle = req.volume_id.clone();
        let target = PathBuf::from(&req.target_path);

        let _guard = self.volume_locks.lock(&handle).await;

        // Re-publishing a published volume is a no-op.
        if mount::is_mount_point(&target)
            .await
            .map_err(|e| tonic::Status::internal(e.to_string()))?
        {
            return Ok(tonic::Response::new(NodePublishVolumeResponse {}));
        }

        let volume_mode = requested_mode(req.volume_capability.as_ref())?;
        info!(%handle, target = %target.display(), mode = volume_mode.as_str(), "publishing volume");

        let provisioner = self.load_provisioner().await?;
        let dir = self.volume_dir(&handle);
        let artifact = dir.join("volume");

        let ctx = self
            .staging_context(&handle, Some(volume_mode), req.readonly, &req.volume_context)
            .await?;

        if artifact_kind(&artifact).await.is_none() {
            if let Err(e) = self.stage(&provisioner, &ctx, &dir).await {
                self.rollback_staging(&provisioner, &ctx, &dir).await;
                return Err(e.into_status());
            }
        }

        match artifact_kind(&artifact).await {
            Some(kind) if kind == volume_mode => (),
            Some(kind) => {
                let e = Error::Staging(format!(
                    "staging produced a {} artifact but the claim wants {}",
                    kind.as_str(),
                    volume_mode.as_str()
                ));
                self.rollback_staging(&provisioner, &ctx, &dir).await;
                return Err(e.into_status());
            }
            None => {
                let e = Error::Staging(
                    "staging worker did not produce /pav/volume".to_owned(),
                );
                self.rollback_staging(&provisioner, &ctx, &dir).await;
                return Err(e.into_status());
            }
        }

        let mounted = match volume_mode {
            VolumeMode::Filesystem => {
                mount::bind_mount_dir(&artifact, &target, req.readonly).await
            }
            VolumeMode::Block => mount::bind_mount_device(&artifact, &target, req.readonly).await,
        };
        if let Err(e) = mounted {
            self.rollback_staging(&provisioner, &ctx, &dir).await;
            return Err(Error::Staging(format!("publishing artifact: {}", e)).into_status());
        }

        info!(%handle, "volume published");
        Ok(tonic::Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: tonic::Request<NodeUnpublishVolumeRequest>,
    ) -> Result<tonic::Response<NodeUnpublishVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        let handle = req.volume_id.clone();
        let target = PathBuf::from(&req.target_path);

        let _guard = self.volume_locks.lock(&handle).await;
        info!(%handle, target = %target.display(), "unpublishing volume");

        mount::unmount(&target)
            .await
            .map_err(|e| tonic::Status::internal(e.to_string()))?;
        remove_publish_target(&target).await;

        let dir = self.volume_dir(&handle);

        let provisioner = match self.load_provisioner().await {
            Ok(provisioner) => provisioner,
            Err(_) => {
                // The provisioner is gone; there is no template left to
                // run, so only local state can be released.
                warn!(%handle, "provisioner missing during unpublish, removing local state only");
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Ok(tonic::Response::new(NodeUnpublishVolumeResponse {}));
            }
        };

        let ctx = self
            .staging_context(&handle, None, false, &Default::default())
            .await?;

        self.unstage(&provisioner, &ctx, &dir)
            .await
            .map_err(Error::into_status)?;

        info!(%handle, "volume unpublished");
        Ok(tonic::Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_info(
        &self,
        _request: tonic::Request<NodeGetInfoRequest>,
    ) -> Result<tonic::Response<NodeGetInfoResponse>, tonic::Status> {
        let mut segments = std::collections::BTreeMap::new();
        segments.insert("kubernetes.io/hostname".to_owned(), self.node_name.clone());
        Ok(tonic::Response::new(NodeGetInfoResponse {
            node_id: self.node_name.clone(),
            max_volumes_per_node: 0,
            accessible_topology: Some(Topology { segments }),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: tonic::Request<NodeGetCapabilitiesRequest>,
    ) -> Result<tonic::Response<NodeGetCapabilitiesResponse>, tonic::Status> {
        // Staging happens inside publish; STAGE_UNSTAGE is deliberately
        // not advertised.
        Ok(tonic::Response::new(NodeGetCapabilitiesResponse {
            capabilities: Vec::with_capacity(0),
        }))
    }

    async fn node_stage_volume(
        &self,
        _request: tonic::Request<NodeStageVolumeRequest>,
    ) -> Result<tonic::Response<NodeStageVolumeResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("stage volume not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: tonic::Request<NodeUnstageVolumeRequest>,
    ) -> Result<tonic::Response<NodeUnstageVolumeResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("unstage volume not supported"))
    }

    async fn node_get_volume_stats(
        &self,
        _request: tonic::Request<NodeGetVolumeStatsRequest>,
    ) -> Result<tonic::Response<NodeGetVolumeStatsResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("volume stats not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: tonic::Request<NodeExpandVolumeRequest>,
    ) -> Result<tonic::Response<NodeExpandVolumeResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("expand volume not supported"))
    }
}

/// The kubelet expects the plugin to clean the publish target up.
async fn remove_publish_target(target: &Path) {
    match tokio::fs::metadata(target).await {
        Ok(metadata) if metadata.is_dir() => {
            let _ = tokio::fs::remove_dir(target).await;
        }
        Ok(_) => {
            let _ = tokio::fs::remove_file(target).await;
        }
        Err(_) => (),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_csi::v1_3_0::volume_capability::{AccessMode, BlockVolume, MountVolume};

    #[test]
    fn the_requested_mode_follows_the_access_type() {
        let mount = VolumeCapability {
            access_mode: Some(AccessMode { mode: 1 }),
            access_type: Some(AccessType::Mount(MountVolume::default())),
        };
        assert_eq!(
            requested_mode(Some(&mount)).unwrap(),
            VolumeMode::Filesystem
        );

        let block = VolumeCapability {
            access_mode: Some(AccessMode { mode: 1 }),
            access_type: Some(AccessType::Block(BlockVolume {})),
        };
        assert_eq!(requested_mode(Some(&block)).unwrap(), VolumeMode::Block);

        assert!(requested_mode(None).is_err());
    }

    #[tokio::test]
    async fn directories_read_as_filesystem_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("volume");
        assert!(artifact_kind(&artifact).await.is_none());

        tokio::fs::create_dir(&artifact).await.unwrap();
        assert_eq!(artifact_kind(&artifact).await, Some(VolumeMode::Filesystem));
    }

    #[tokio::test]
    async fn plain_files_are_not_valid_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("volume");
        tokio::fs::write(&artifact, b"not a device").await.unwrap();
        assert_eq!(artifact_kind(&artifact).await, None);
    }
}
