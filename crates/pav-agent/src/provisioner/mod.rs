//! The `PavProvisioner` custom resource.
//!
//! A provisioner names up to five lifecycle phases, each carrying a pod
//! template. Pod templates (and every other string leaf outside
//! `provisioningModes`) are templates, so they are carried as free
//! `serde_json::Value` trees rather than typed pod specs; typing happens
//! after evaluation, when the tree must deserialize into a real pod
//! template.

pub mod phase;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::API_GROUP;

/// How volumes reach a provisioner: provisioned on demand from claims
/// (`Dynamic`) or pre-provisioned by the operator (`Static`).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ProvisioningMode {
    Dynamic,
    Static,
}

/// A capacity leaf: a literal byte count, a quantity string, or a
/// template evaluating to either.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum CapacityField {
    Bytes(i64),
    Text(String),
}

impl CapacityField {
    /// The textual form handed to the template engine.
    pub fn as_text(&self) -> String {
        match self {
            CapacityField::Bytes(n) => n.to_string(),
            CapacityField::Text(s) => s.clone(),
        }
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "pav.dev",
    version = "v1alpha1",
    kind = "PavProvisioner",
    plural = "pavprovisioners",
    shortname = "pav",
    status = "PavProvisionerStatus"
)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PavProvisionerSpec {
    /// Non-empty subset of {Dynamic, Static}. Never templated.
    pub provisioning_modes: Vec<ProvisioningMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_validation: Option<VolumeValidation>,

    /// Only allowed when `Dynamic` is among the provisioning modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_creation: Option<VolumeCreation>,

    /// Only allowed when `Dynamic` is among the provisioning modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_deletion: Option<VolumeDeletion>,

    pub volume_staging: VolumeStaging,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_unstaging: Option<VolumeUnstaging>,
}

/// Admission filters for incoming volumes plus an optional validation
/// worker.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_modes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_capacity: Option<CapacityField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_capacity: Option<CapacityField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<Value>,
}

/// The worker that creates the backing storage object.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeCreation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<CapacityField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeDeletion {
    pub pod_template: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeStaging {
    pub pod_template: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeUnstaging {
    pub pod_template: Value,
}

/// Where the registry state machine currently has a provisioner.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RegistryPhase {
    Bootstrapping,
    Active,
    Blocked,
    Tombstoned,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PavProvisionerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RegistryPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The CSI driver name a provisioner registers under; storage classes
/// reference it in their `provisioner:` field.
pub fn driver_name(provisioner_name: &str) -> String {
    format!("{}.{}", provisioner_name, API_GROUP)
}

/// The namespace holding a provisioner's infrastructure bundle and its
/// worker pods.
pub fn namespace_name(provisioner_name: &str) -> String {
    format!("pav-{}", provisioner_name)
}

impl PavProvisioner {
    pub fn driver_name(&self) -> String {
        driver_name(&self.name())
    }

    pub fn namespace_name(&self) -> String {
        namespace_name(&self.name())
    }

    pub fn allows(&self, mode: ProvisioningMode) -> bool {
        self.spec.provisioning_modes.contains(&mode)
    }

    /// Owner reference pointing at this provisioner, used by the bundle
    /// objects so that deleting the CR cascades.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.meta().uid.clone()?;
        Some(OwnerReference {
            api_version: PavProvisioner::api_version(&()).to_string(),
            kind: PavProvisioner::kind(&()).to_string(),
            name: self.name(),
            uid,
            controller: Some(true),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal() -> PavProvisioner {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "pav.dev/v1alpha1",
            "kind": "PavProvisioner",
            "metadata": { "name": "hello-world", "uid": "abc-123" },
            "spec": {
                "provisioningModes": ["Dynamic"],
                "volumeCreation": { "capacity": "{{ requestedMinCapacity }}" },
                "volumeStaging": { "podTemplate": { "spec": { "containers": [] } } }
            }
        }))
        .unwrap()
    }

    #[test]
    fn names_derive_from_the_cr_name() {
        let p = minimal();
        assert_eq!(p.driver_name(), "hello-world.pav.dev");
        assert_eq!(p.namespace_name(), "pav-hello-world");
    }

    #[test]
    fn capacity_fields_accept_integers_and_strings() {
        let p = minimal();
        let creation = p.spec.volume_creation.unwrap();
        assert_eq!(
            creation.capacity,
            Some(CapacityField::Text("{{ requestedMinCapacity }}".into()))
        );

        let as_int: CapacityField = serde_json::from_value(serde_json::json!(1073741824)).unwrap();
        assert_eq!(as_int, CapacityField::Bytes(1073741824));
        assert_eq!(as_int.as_text(), "1073741824");
    }

    #[test]
    fn unknown_spec_fields_are_rejected() {
        let result: Result<PavProvisionerSpec, _> = serde_json::from_value(serde_json::json!({
            "provisioningModes": ["Dynamic"],
            "volumeStaging": { "podTemplate": {} },
            "volumeSnapshotting": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn modes_outside_the_enum_are_rejected() {
        let result: Result<PavProvisionerSpec, _> = serde_json::from_value(serde_json::json!({
            "provisioningModes": ["Elastic"],
            "volumeStaging": { "podTemplate": {} }
        }));
        assert!(result.is_err());
    }
}
