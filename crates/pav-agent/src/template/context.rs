//! The named evaluation contexts templates are rendered under.
//!
//! Each phase renders its templates over exactly one of these shapes;
//! the serialized field names are the variables visible to template
//! authors.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Context for the validation phase of a dynamically provisioned
/// volume, built from the triggering claim and its storage class.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ValidationContext {
    pub requested_volume_mode: String,
    pub requested_access_modes: Vec<String>,
    pub requested_min_capacity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_max_capacity: Option<i64>,
    pub params: BTreeMap<String, String>,
    pub sc: Value,
    pub pvc: Value,
}

/// Context for the creation and deletion phases: validation plus the
/// default handle derived from the claim UID.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningContext {
    #[serde(flatten)]
    pub validation: ValidationContext,
    pub default_handle: String,
}

/// Context for the staging and unstaging phases, built from the bound
/// volume and the node it is being made available on.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StagingContext {
    pub volume_mode: String,
    pub access_modes: Vec<String>,
    pub capacity: i64,
    pub params: BTreeMap<String, String>,
    pub handle: String,
    pub read_only: bool,
    pub pvc: Value,
    pub pv: Value,
    pub node: Value,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validation_context_serializes_the_documented_names() {
        let ctx = ValidationContext {
            requested_volume_mode: "Filesystem".into(),
            requested_access_modes: vec!["ReadOnlyMany".into()],
            requested_min_capacity: 1073741824,
            requested_max_capacity: None,
            params: BTreeMap::new(),
            sc: Value::Null,
            pvc: Value::Null,
        };
        let value = serde_json::to_value(&ctx).unwrap();
        let mut keys: Vec<&str> =
            value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "params",
                "pvc",
                "requestedAccessModes",
                "requestedMinCapacity",
                "requestedVolumeMode",
                "sc",
            ]
        );
    }

    #[test]
    fn provisioning_context_flattens_validation() {
        let ctx = ProvisioningContext {
            validation: ValidationContext {
                requested_volume_mode: "Block".into(),
                requested_access_modes: vec![],
                requested_min_capacity: 1,
                requested_max_capacity: Some(2),
                params: BTreeMap::new(),
                sc: Value::Null,
                pvc: Value::Null,
            },
            default_handle: "pvc-abc".into(),
        };
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["defaultHandle"], "pvc-abc");
        assert_eq!(value["requestedMaxCapacity"], 2);
        assert!(value.get("validation").is_none());
    }

    #[test]
    fn staging_context_serializes_the_documented_names() {
        let ctx = StagingContext {
            volume_mode: "Filesystem".into(),
            access_modes: vec!["ReadWriteOnce".into()],
            capacity: 42,
            params: BTreeMap::new(),
            handle: "h".into(),
            read_only: true,
            pvc: Value::Null,
            pv: Value::Null,
            node: Value::Null,
        };
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["volumeMode"], "Filesystem");
        assert_eq!(value["readOnly"], true);
        assert!(value.get("node").is_some());
    }
}
