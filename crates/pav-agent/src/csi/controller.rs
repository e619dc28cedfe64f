//! The controller plugin: the creation and deletion state machines
//! behind `Controller.CreateVolume` and `Controller.DeleteVolume`.
//!
//! The plugin is stateless between RPCs; everything it needs lives in
//! the orchestrator objects and in the deterministic worker-pod names.

use std::collections::BTreeMap;

use k8s_csi::v1_3_0::controller_server::Controller;
use k8s_csi::v1_3_0::controller_service_capability::rpc::Type as RpcType;
use k8s_csi::v1_3_0::controller_service_capability::{Rpc, Type as CapabilityType};
use k8s_csi::v1_3_0::volume_capability::access_mode::Mode as AccessModeKind;
use k8s_csi::v1_3_0::volume_capability::AccessType;
use k8s_csi::v1_3_0::*;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::capacity;
use crate::error::Error;
use crate::provisioner::phase::Phase;
use crate::provisioner::{namespace_name, PavProvisioner, ProvisioningMode, VolumeCreation};
use crate::schema;
use crate::template::context::{ProvisioningContext, ValidationContext};
use crate::template::TemplateEngine;
use crate::worker::keyed::KeyedLocks;
use crate::worker::{PavVolumeSource, SideChannel, WorkerParams, WorkerPodDriver};
use crate::UNRECOVERABLE_ANNOTATION;

/// Claim identity keys the external provisioner forwards when running
/// with `--extra-create-metadata`.
const PARAM_PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
const PARAM_PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";

/// Keys this plugin stashes into the volume context for the node
/// plugin.
pub const CONTEXT_PVC_NAME: &str = "pav.dev/pvc-name";
pub const CONTEXT_PVC_NAMESPACE: &str = "pav.dev/pvc-namespace";

const RESERVED_PARAM_PREFIXES: [&str; 2] = ["csi.storage.k8s.io/", "pav.dev/"];

pub struct ControllerPlugin {
    client: kube::Client,
    provisioner_name: String,
    engine: TemplateEngine,
    driver: WorkerPodDriver,
    claim_locks: KeyedLocks,
    /// The controller-plugin deployment, owner of all creation and
    /// deletion workers. Absent when running outside the bundle.
    worker_owner: Option<OwnerReference>,
}

impl ControllerPlugin {
    pub async fn new(client: kube::Client, provisioner_name: String, export_image: String) -> Self {
        let namespace = namespace_name(&provisioner_name);
        let worker_owner = deployment_owner(&client, &namespace).await;
        if worker_owner.is_none() {
            warn!("controller-plugin deployment not found; workers will be unowned");
        }
        ControllerPlugin {
            engine: TemplateEngine::new(client.clone()),
            driver: WorkerPodDriver::new(client.clone(), namespace, export_image),
            client,
            provisioner_name,
            claim_locks: KeyedLocks::new(),
            worker_owner,
        }
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

    /// The static admission filters of `volumeValidation`; filter
    /// entries are themselves templates over the validation context.
    async fn run_admission_filters(
        &self,
        provisioner: &PavProvisioner,
        ctx: &ValidationContext,
    ) -> Result<(), Error> {
        let validation = match &provisioner.spec.volume_validation {
            Some(validation) => validation,
            None => return Ok(()),
        };

        if let Some(modes) = &validation.volume_modes {
            let mut allowed = Vec::with_capacity(modes.len());
            for (i, mode) in modes.iter().enumerate() {
                let path = format!("volumeValidation.volumeModes.{}", i);
                let mode = self.engine.evaluate_string(&path, mode, ctx).await?;
                let mode = mode.trim().to_owned();
                if !schema::is_volume_mode(&mode) {
                    return Err(Error::template(&path, format!("'{}' is not a volume mode", mode)));
                }
                allowed.push(mode);
            }
            if !allowed.contains(&ctx.requested_volume_mode) {
                return Err(Error::Validation(format!(
                    "volume mode {} is not offered by this provisioner",
                    ctx.requested_volume_mode
                )));
            }
        }

        if let Some(modes) = &validation.access_modes {
            let mut allowed = Vec::with_capacity(modes.len());
            for (i, mode) in modes.iter().enumerate() {
                let path = format!("volumeValidation.accessModes.{}", i);
                let mode = self.engine.evaluate_string(&path, mode, ctx).await?;
                let mode = mode.trim().to_owned();
                if !schema::is_access_mode(&mode) {
                    return Err(Error::template(&path, format!("'{}' is not an access mode", mode)));
                }
                allowed.push(mode);
            }
            for requested in &ctx.requested_access_modes {
                if !allowed.contains(requested) {
                    return Err(Error::Validation(format!(
                        "access mode {} is not offered by this provisioner",
                        requested
                    )));
                }
            }
        }

        if let Some(min) = &validation.min_capacity {
            let min = self
                .engine
                .evaluate_capacity("volumeValidation.minCapacity", &min.as_text(), ctx)
                .await?;
            if ctx.requested_min_capacity < min {
                return Err(Error::Validation(format!(
                    "requested capacity {} is below the provisioner minimum {}",
                    ctx.requested_min_capacity, min
                )));
            }
        }

        if let (Some(max), Some(requested_max)) =
            (&validation.max_capacity, ctx.requested_max_capacity)
        {
            let max = self
                .engine
                .evaluate_capacity("volumeValidation.maxCapacity", &max.as_text(), ctx)
                .await?;
            if requested_max > max {
                return Err(Error::Validation(format!(
                    "requested capacity limit {} exceeds the provisioner maximum {}",
                    requested_max, max
                )));
            }
        }

        Ok(())
    }

    /// Runs the validation worker, if the provisioner declares one.
    async fn run_validation_worker(
        &self,
        provisioner: &PavProvisioner,
        ctx: &ValidationContext,
        default_handle: &str,
    ) -> Result<(), Error> {
        let template = match provisioner
            .spec
            .volume_validation
            .as_ref()
            .and_then(|v| v.pod_template.as_ref())
        {
            Some(template) => template,
            None => return Ok(()),
        };

        let evaluated = self
            .engine
            .evaluate_tree("volumeValidation.podTemplate", template, ctx)
            .await?;
        let verdict = self
            .driver
            .run_phase(WorkerParams {
                phase: Phase::Validation,
                provisioner_uid: &provisioner_uid(provisioner),
                handle: default_handle,
                retry_epoch: 0,
                template: &evaluated,
                owner: self.worker_owner.clone(),
                node_name: None,
                pav_volume: PavVolumeSource::EmptyDirWithExport,
            })
            .await?;
        if !verdict.succeeded {
            return Err(Error::Validation(verdict.failure_message()));
        }
        Ok(())
    }

    /// Runs the creation worker and resolves handle and capacity. On
    /// failure after the worker ran, a deletion phase is synthesized
    /// before the error propagates.
    async fn provision(
        &self,
        provisioner: &PavProvisioner,
        creation: &VolumeCreation,
        ctx: &ProvisioningContext,
    ) -> Result<(String, i64), Error> {
        let field_handle = match &creation.handle {
            Some(template) => Some(
                self.engine
                    .evaluate_handle("volumeCreation.handle", template, ctx)
                    .await?,
            ),
            None => None,
        };
        let field_capacity = match &creation.capacity {
            Some(field) => Some(
                self.engine
                    .evaluate_capacity("volumeCreation.capacity", &field.as_text(), ctx)
                    .await?,
            ),
            None => None,
        };

        let mut side_channel = SideChannel::default();
        let mut worker_ran = false;
        if let Some(template) = &creation.pod_template {
            let evaluated = self
                .engine
                .evaluate_tree("volumeCreation.podTemplate", template, ctx)
                .await?;
            worker_ran = true;
            let verdict = self
                .driver
                .run_phase(WorkerParams {
                    phase: Phase::Creation,
                    provisioner_uid: &provisioner_uid(provisioner),
                    handle: &ctx.default_handle,
                    retry_epoch: 0,
                    template: &evaluated,
                    owner: self.worker_owner.clone(),
                    node_name: None,
                    pav_volume: PavVolumeSource::EmptyDirWithExport,
                })
                .await;
            match verdict {
                Ok(verdict) if verdict.succeeded => side_channel = verdict.side_channel,
                Ok(verdict) => {
                    let message = verdict.failure_message();
                    self.synthesize_deletion(provisioner, ctx).await;
                    return Err(Error::Creation(message));
                }
                Err(e) => {
                    self.synthesize_deletion(provisioner, ctx).await;
                    return Err(e);
                }
            }
        }

        let resolved = resolve_handle(field_handle, side_channel.handle, &ctx.default_handle)
            .and_then(|handle| {
                resolve_capacity(field_capacity, side_channel.capacity)
                    .map(|capacity| (handle, capacity))
            });
        match resolved {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                if worker_ran {
                    self.synthesize_deletion(provisioner, ctx).await;
                }
                Err(e)
            }
        }
    }

    /// Best-effort rollback: run the deletion phase once so a failed
    /// creation does not leak backing storage.
    async fn synthesize_deletion(&self, provisioner: &PavProvisioner, ctx: &ProvisioningContext) {
        let template = match &provisioner.spec.volume_deletion {
            Some(deletion) => &deletion.pod_template,
            None => return,
        };
        let evaluated = match self
            .engine
            .evaluate_tree("volumeDeletion.podTemplate", template, ctx)
            .await
        {
            Ok(evaluated) => evaluated,
            Err(e) => {
                warn!(error = %e, "could not render synthesized deletion");
                return;
            }
        };
        let result = self
            .driver
            .run_phase(WorkerParams {
                phase: Phase::Deletion,
                provisioner_uid: &provisioner_uid(provisioner),
                handle: &ctx.default_handle,
                retry_epoch: 0,
                template: &evaluated,
                owner: self.worker_owner.clone(),
                node_name: None,
                pav_volume: PavVolumeSource::EmptyDirWithExport,
            })
            .await;
        match result {
            Ok(verdict) if verdict.succeeded => info!("synthesized deletion succeeded"),
            Ok(verdict) => warn!(message = %verdict.failure_message(), "synthesized deletion failed"),
            Err(e) => warn!(error = %e, "synthesized deletion failed"),
        }
    }

    /// Locates the persistent volume carrying our driver and the given
    /// handle.
    async fn find_volume(&self, handle: &str) -> Result<Option<PersistentVolume>, tonic::Status> {
        let driver = crate::provisioner::driver_name(&self.provisioner_name);
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = volumes
            .list(&ListParams::default())
            .await
            .map_err(|e| tonic::Status::internal(e.to_string()))?;
        Ok(list.items.into_iter().find(|pv| {
            pv.spec
                .as_ref()
                .and_then(|spec| spec.csi.as_ref())
                .map(|csi| csi.driver == driver && csi.volume_handle == handle)
                .unwrap_or(false)
        }))
    }
}

#[async_trait::async_trait]
impl Controller for ControllerPlugin {
    async fn create_volume(
        &self,
        request: tonic::Request<CreateVolumeRequest>,
    ) -> Result<tonic::Response<CreateVolumeResponse>, tonic::Status> {
        let req = request.into_inner();

        let pvc_name = req
            .parameters
            .get(PARAM_PVC_NAME)
            .ok_or_else(|| missing_claim_metadata())?
            .clone();
        let pvc_namespace = req
            .parameters
            .get(PARAM_PVC_NAMESPACE)
            .ok_or_else(|| missing_claim_metadata())?
            .clone();

        // No two create attempts for the same claim run concurrently.
        let claim_key = format!("{}/{}", pvc_namespace, pvc_name);
        let _guard = self.claim_locks.lock(&claim_key).await;
        info!(claim = %claim_key, volume = %req.name, "creating volume");

        let provisioner = self.load_provisioner().await?;
        if !provisioner.allows(ProvisioningMode::Dynamic) {
            return Err(tonic::Status::failed_precondition(
                "this provisioner does not support dynamic provisioning",
            ));
        }

        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &pvc_namespace);
        let pvc = claims.get(&pvc_name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                tonic::Status::not_found(format!("claim {} not found", claim_key))
            }
            e => tonic::Status::internal(e.to_string()),
        })?;
        let claim_uid = pvc
            .uid()
            .ok_or_else(|| tonic::Status::internal("claim has no uid"))?;
        let default_handle = format!("pvc-{}", claim_uid);

        let sc = match pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone()) {
            Some(name) => {
                let classes: Api<StorageClass> = Api::all(self.client.clone());
                classes
                    .get(&name)
                    .await
                    .map(|sc| serde_json::to_value(sc).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null)
            }
            None => Value::Null,
        };

        let (volume_mode, access_modes) = requested_modes(&req.volume_capabilities)?;
        let (min_capacity, max_capacity) = requested_capacity(req.capacity_range.as_ref())?;
        let params = worker_params(&req.parameters);

        let validation_ctx = ValidationContext {
            requested_volume_mode: volume_mode,
            requested_access_modes: access_modes,
            requested_min_capacity: min_capacity,
            requested_max_capacity: max_capacity,
            params: params.clone(),
            sc,
            pvc: serde_json::to_value(&pvc).unwrap_or(Value::Null),
        };

        self.run_admission_filters(&provisioner, &validation_ctx)
            .await
            .map_err(Error::into_status)?;
        self.run_validation_worker(&provisioner, &validation_ctx, &default_handle)
            .await
            .map_err(Error::into_status)?;

        let ctx = ProvisioningContext {
            validation: validation_ctx,
            default_handle,
        };
        let creation = provisioner.spec.volume_creation.clone().unwrap_or_default();
        let (handle, capacity_bytes) = self
            .provision(&provisioner, &creation, &ctx)
            .await
            .map_err(Error::into_status)?;

        info!(claim = %claim_key, %handle, capacity_bytes, "volume created");

        let mut volume_context: BTreeMap<String, String> = params;
        volume_context.insert(CONTEXT_PVC_NAME.to_owned(), pvc_name);
        volume_context.insert(CONTEXT_PVC_NAMESPACE.to_owned(), pvc_namespace);

        Ok(tonic::Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                volume_id: handle,
                capacity_bytes,
                volume_context,
                ..Default::default()
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: tonic::Request<DeleteVolumeRequest>,
    ) -> Result<tonic::Response<DeleteVolumeResponse>, tonic::Status> {
        let req = request.into_inner();
        let handle = req.volume_id;

        let _guard = self.claim_locks.lock(&handle).await;
        info!(%handle, "deleting volume");

        let provisioner = self.load_provisioner().await?;
        let pv = match self.find_volume(&handle).await? {
            Some(pv) => pv,
            // Repeat deletion of an already-gone volume succeeds.
            None => return Ok(tonic::Response::new(DeleteVolumeResponse {})),
        };

        if let Some(deletion) = &provisioner.spec.volume_deletion {
            let ctx = deletion_context(&self.client, &pv, &handle).await;
            let evaluated = self
                .engine
                .evaluate_tree("volumeDeletion.podTemplate", &deletion.pod_template, &ctx)
                .await
                .map_err(Error::into_status)?;
            let verdict = self
                .driver
                .run_phase(WorkerParams {
                    phase: Phase::Deletion,
                    provisioner_uid: &provisioner_uid(&provisioner),
                    handle: &handle,
                    retry_epoch: 0,
                    template: &evaluated,
                    owner: self.worker_owner.clone(),
                    node_name: None,
                    pav_volume: PavVolumeSource::EmptyDirWithExport,
                })
                .await
                .map_err(Error::into_status)?;
            if !verdict.succeeded {
                // Park the volume for operator intervention; the worker
                // pod is already retained by the driver.
                let message = verdict.failure_message();
                annotate_unrecoverable(&self.client, &pv, &message).await;
                return Err(Error::Unrecoverable {
                    phase: Phase::Deletion,
                    message,
                }
                .into_status());
            }
        }

        info!(%handle, "volume deleted");
        Ok(tonic::Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_get_capabilities(
        &self,
        _request: tonic::Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<tonic::Response<ControllerGetCapabilitiesResponse>, tonic::Status> {
        Ok(tonic::Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![ControllerServiceCapability {
                r#type: Some(CapabilityType::Rpc(Rpc {
                    r#type: RpcType::CreateDeleteVolume as i32,
                })),
            }],
        }))
    }

    async fn controller_publish_volume(
        &self,
        _request: tonic::Request<ControllerPublishVolumeRequest>,
    ) -> Result<tonic::Response<ControllerPublishVolumeResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "controller publish volume not supported",
        ))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: tonic::Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<tonic::Response<ControllerUnpublishVolumeResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "controller unpublish volume not supported",
        ))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: tonic::Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<tonic::Response<ValidateVolumeCapabilitiesResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "validate volume capabilities not supported",
        ))
    }

    async fn list_volumes(
        &self,
        _request: tonic::Request<ListVolumesRequest>,
    ) -> Result<tonic::Response<ListVolumesResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("list volumes not supported"))
    }

    async fn get_capacity(
        &self,
        _request: tonic::Request<GetCapacityRequest>,
    ) -> Result<tonic::Response<GetCapacityResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("get capacity not supported"))
    }

    async fn create_snapshot(
        &self,
        _request: tonic::Request<CreateSnapshotRequest>,
    ) -> Result<tonic::Response<CreateSnapshotResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("snapshots not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: tonic::Request<DeleteSnapshotRequest>,
    ) -> Result<tonic::Response<DeleteSnapshotResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("snapshots not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: tonic::Request<ListSnapshotsRequest>,
    ) -> Result<tonic::Response<ListSnapshotsResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("snapshots not supported"))
    }

    async fn controller_expand_volume(
        &self,
        _request: tonic::Request<ControllerExpandVolumeRequest>,
    ) -> Result<tonic::Response<ControllerExpandVolumeResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("expand volume not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: tonic::Request<ControllerGetVolumeRequest>,
    ) -> Result<tonic::Response<ControllerGetVolumeResponse>, tonic::Status> {
        Err(tonic::Status::unimplemented("get volume not supported"))
    }
}

/// The evaluated `volumeCreation.handle` field wins; the worker's
/// `/pav/handle` file is consulted only when the field is unset, and the
/// claim-derived default closes the chain.
fn resolve_handle(
    field: Option<String>,
    file: Option<String>,
    default_handle: &str,
) -> Result<String, Error> {
    match field {
        Some(handle) => Ok(handle),
        None => match file {
            Some(file_handle) if schema::is_handle(&file_handle) => Ok(file_handle),
            Some(file_handle) => Err(Error::Creation(format!(
                "worker exported invalid handle '{}'",
                file_handle
            ))),
            None => Ok(default_handle.to_owned()),
        },
    }
}

/// Capacity must be determinable: the evaluated field, else the
/// worker's `/pav/capacity` file, else the creation fails.
fn resolve_capacity(field: Option<i64>, file: Option<i64>) -> Result<i64, Error> {
    match field.or(file) {
        Some(capacity) if capacity > 0 => Ok(capacity),
        Some(capacity) => Err(Error::Creation(format!(
            "creation phase produced a non-positive capacity {}",
            capacity
        ))),
        None => Err(Error::Creation(
            "volume capacity could not be determined from the creation phase".to_owned(),
        )),
    }
}

fn missing_claim_metadata() -> tonic::Status {
    tonic::Status::invalid_argument(
        "claim metadata missing; the external provisioner must run with --extra-create-metadata",
    )
}

fn provisioner_uid(provisioner: &PavProvisioner) -> String {
    provisioner.meta().uid.clone().unwrap_or_default()
}

/// Maps the requested capabilities onto a volume mode and the claim's
/// access modes.
fn requested_modes(
    capabilities: &[VolumeCapability],
) -> Result<(String, Vec<String>), tonic::Status> {
    if capabilities.is_empty() {
        return Err(tonic::Status::invalid_argument(
            "at least one volume capability is required",
        ));
    }

    let mut volume_mode: Option<&'static str> = None;
    let mut access_modes: Vec<String> = Vec::new();

    for capability in capabilities {
        let mode = match capability.access_type.as_ref() {
            Some(AccessType::Mount(_)) => "Filesystem",
            Some(AccessType::Block(_)) => "Block",
            None => {
                return Err(tonic::Status::invalid_argument(
                    "volume capability without an access type",
                ))
            }
        };
        match volume_mode {
            None => volume_mode = Some(mode),
            Some(previous) if previous != mode => {
                return Err(tonic::Status::invalid_argument(
                    "volume capabilities mix filesystem and block access",
                ))
            }
            Some(_) => (),
        }

        let kind = capability
            .access_mode
            .as_ref()
            .and_then(|m| AccessModeKind::from_i32(m.mode))
            .ok_or_else(|| tonic::Status::invalid_argument("unknown access mode"))?;
        let name = match kind {
            AccessModeKind::SingleNodeWriter | AccessModeKind::MultiNodeSingleWriter => {
                "ReadWriteOnce"
            }
            AccessModeKind::SingleNodeReaderOnly | AccessModeKind::MultiNodeReaderOnly => {
                "ReadOnlyMany"
            }
            AccessModeKind::MultiNodeMultiWriter => "ReadWriteMany",
            AccessModeKind::Unknown => {
                return Err(tonic::Status::invalid_argument("unknown access mode"))
            }
        };
        if !access_modes.iter().any(|m| m == name) {
            access_modes.push(name.to_owned());
        }
    }

    Ok((volume_mode.unwrap().to_owned(), access_modes))
}

fn requested_capacity(
    range: Option<&CapacityRange>,
) -> Result<(i64, Option<i64>), tonic::Status> {
    let range = range.ok_or_else(|| {
        tonic::Status::invalid_argument("a capacity range is required")
    })?;
    if range.required_bytes <= 0 {
        return Err(tonic::Status::invalid_argument(
            "a positive required capacity is required",
        ));
    }
    let max = (range.limit_bytes > 0).then(|| range.limit_bytes);
    Ok((range.required_bytes, max))
}

/// Storage-class parameters with the orchestrator- and PaV-reserved
/// keys stripped; what templates see as `params`.
fn worker_params(parameters: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    parameters
        .iter()
        .filter(|(key, _)| {
            !RESERVED_PARAM_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Rebuilds the deletion context from the persisted volume attributes
/// and the (possibly absent) original claim.
async fn deletion_context(
    client: &kube::Client,
    pv: &PersistentVolume,
    handle: &str,
) -> ProvisioningContext {
    let spec = pv.spec.clone().unwrap_or_default();
    let csi = spec.csi.clone().unwrap_or_default();

    let params: BTreeMap<String, String> = csi
        .volume_attributes
        .unwrap_or_default()
        .into_iter()
        .filter(|(key, _)| {
            !RESERVED_PARAM_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
        })
        .collect();

    let capacity_bytes = spec
        .capacity
        .as_ref()
        .and_then(|c| c.get("storage"))
        .and_then(|q| capacity::parse(q.0.trim()).ok())
        .unwrap_or(1);

    let (pvc, default_handle) = match spec.claim_ref.as_ref() {
        Some(claim_ref) => {
            let default_handle = claim_ref
                .uid
                .as_ref()
                .map(|uid| format!("pvc-{}", uid))
                .unwrap_or_else(|| handle.to_owned());
            let pvc = match (claim_ref.namespace.as_ref(), claim_ref.name.as_ref()) {
                (Some(namespace), Some(name)) => {
                    let claims: Api<PersistentVolumeClaim> =
                        Api::namespaced(client.clone(), namespace);
                    claims
                        .get(name)
                        .await
                        .map(|pvc| serde_json::to_value(pvc).unwrap_or(Value::Null))
                        .unwrap_or(Value::Null)
                }
                _ => Value::Null,
            };
            (pvc, default_handle)
        }
        None => (Value::Null, handle.to_owned()),
    };

    let sc = match spec.storage_class_name.as_ref() {
        Some(name) => {
            let classes: Api<StorageClass> = Api::all(client.clone());
            classes
                .get(name)
                .await
                .map(|sc| serde_json::to_value(sc).unwrap_or(Value::Null))
                .unwrap_or(Value::Null)
        }
        None => Value::Null,
    };

    ProvisioningContext {
        validation: ValidationContext {
            requested_volume_mode: spec.volume_mode.unwrap_or_else(|| "Filesystem".to_owned()),
            requested_access_modes: spec.access_modes.unwrap_or_default(),
            requested_min_capacity: capacity_bytes,
            requested_max_capacity: None,
            params,
            sc,
            pvc,
        },
        default_handle,
    }
}

async fn annotate_unrecoverable(client: &kube::Client, pv: &PersistentVolume, message: &str) {
    let volumes: Api<PersistentVolume> = Api::all(client.clone());
    let patch = serde_json::json!({
        "metadata": { "annotations": { UNRECOVERABLE_ANNOTATION: message } }
    });
    if let Err(e) = volumes
        .patch(&pv.name(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!(volume = %pv.name(), error = %e, "failed to annotate parked volume");
    }
}

async fn deployment_owner(client: &kube::Client, namespace: &str) -> Option<OwnerReference> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let deployment = deployments.get("controller-plugin").await.ok()?;
    Some(OwnerReference {
        api_version: "apps/v1".to_owned(),
        kind: "Deployment".to_owned(),
        name: deployment.name(),
        uid: deployment.uid()?,
        ..Default::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_csi::v1_3_0::volume_capability::{AccessMode, BlockVolume, MountVolume};

    fn capability(mode: AccessModeKind, block: bool) -> VolumeCapability {
        VolumeCapability {
            access_mode: Some(AccessMode { mode: mode as i32 }),
            access_type: Some(if block {
                AccessType::Block(BlockVolume {})
            } else {
                AccessType::Mount(MountVolume::default())
            }),
        }
    }

    #[test]
    fn capabilities_map_to_claim_modes() {
        let (mode, access) = requested_modes(&[
            capability(AccessModeKind::SingleNodeWriter, false),
            capability(AccessModeKind::MultiNodeReaderOnly, false),
        ])
        .unwrap();
        assert_eq!(mode, "Filesystem");
        assert_eq!(access, vec!["ReadWriteOnce", "ReadOnlyMany"]);

        let (mode, access) =
            requested_modes(&[capability(AccessModeKind::MultiNodeMultiWriter, true)]).unwrap();
        assert_eq!(mode, "Block");
        assert_eq!(access, vec!["ReadWriteMany"]);
    }

    #[test]
    fn mixed_access_types_are_rejected() {
        let result = requested_modes(&[
            capability(AccessModeKind::SingleNodeWriter, false),
            capability(AccessModeKind::SingleNodeWriter, true),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn empty_capabilities_are_rejected() {
        assert!(requested_modes(&[]).is_err());
    }

    #[test]
    fn capacity_range_requires_a_positive_minimum() {
        assert!(requested_capacity(None).is_err());
        assert!(requested_capacity(Some(&CapacityRange {
            required_bytes: 0,
            limit_bytes: 0,
        }))
        .is_err());
        assert_eq!(
            requested_capacity(Some(&CapacityRange {
                required_bytes: 1073741824,
                limit_bytes: 0,
            }))
            .unwrap(),
            (1073741824, None)
        );
        assert_eq!(
            requested_capacity(Some(&CapacityRange {
                required_bytes: 10,
                limit_bytes: 20,
            }))
            .unwrap(),
            (10, Some(20))
        );
    }

    #[test]
    fn the_handle_field_wins_over_the_side_channel_file() {
        let handle = resolve_handle(
            Some("field-handle".to_owned()),
            Some("file-handle".to_owned()),
            "pvc-uid",
        )
        .unwrap();
        assert_eq!(handle, "field-handle");
    }

    #[test]
    fn the_handle_file_is_used_when_the_field_is_unset() {
        let handle = resolve_handle(None, Some("file-handle".to_owned()), "pvc-uid").unwrap();
        assert_eq!(handle, "file-handle");
    }

    #[test]
    fn invalid_handle_files_fail_the_creation() {
        assert!(resolve_handle(None, Some("not a handle".to_owned()), "pvc-uid").is_err());
    }

    #[test]
    fn the_default_handle_closes_the_chain() {
        let handle = resolve_handle(None, None, "pvc-uid").unwrap();
        assert_eq!(handle, "pvc-uid");
    }

    #[test]
    fn capacity_resolution_prefers_the_field_and_never_guesses() {
        assert_eq!(resolve_capacity(Some(10), Some(20)).unwrap(), 10);
        assert_eq!(resolve_capacity(None, Some(20)).unwrap(), 20);
        assert!(resolve_capacity(None, None).is_err());
        assert!(resolve_capacity(Some(0), None).is_err());
    }

    #[test]
    fn reserved_parameters_are_hidden_from_templates() {
        let mut parameters = BTreeMap::new();
        parameters.insert("fsType".to_owned(), "ext4".to_owned());
        parameters.insert(PARAM_PVC_NAME.to_owned(), "claim".to_owned());
        parameters.insert("pav.dev/internal".to_owned(), "x".to_owned());

        let params = worker_params(&parameters);
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("fsType").map(String::as_str), Some("ext4"));
    }
}
