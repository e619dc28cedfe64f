//! Declarative validation of provisioner objects.
//!
//! The same rule walk runs in two modes: *template-permissive* accepts a
//! template wherever a string leaf is expected (this is what admission
//! runs, since nearly every leaf of a stored provisioner is a template),
//! while *shape-strict* demands literal values matching the intrinsic
//! class regexes and is applied to evaluated output, where template
//! tokens must no longer appear.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::capacity;
use crate::error::{Error, Result};
use crate::provisioner::{PavProvisionerSpec, ProvisioningMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    ShapeStrict,
    TemplatePermissive,
}

/// The intrinsic classes string leaves can carry.
#[derive(Clone, Copy, Debug)]
enum Class {
    Capacity,
    AccessMode,
    VolumeMode,
    Handle,
}

lazy_static! {
    static ref DNS_LABEL: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").unwrap();
    static ref HANDLE: Regex = Regex::new(r"^[A-Za-z0-9._-]+$").unwrap();
    static ref ACCESS_MODE: Regex =
        Regex::new(r"^(ReadWriteOnce|ReadOnlyMany|ReadWriteMany)$").unwrap();
    static ref VOLUME_MODE: Regex = Regex::new(r"^(Filesystem|Block)$").unwrap();
}

pub fn is_dns_label(s: &str) -> bool {
    DNS_LABEL.is_match(s)
}

pub fn is_handle(s: &str) -> bool {
    HANDLE.is_match(s)
}

pub fn is_access_mode(s: &str) -> bool {
    ACCESS_MODE.is_match(s)
}

pub fn is_volume_mode(s: &str) -> bool {
    VOLUME_MODE.is_match(s)
}

/// True when the string opens a template expression or statement.
pub fn has_template_token(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

fn matches_class(value: &str, class: Class) -> bool {
    match class {
        Class::Capacity => capacity::is_capacity(value),
        Class::AccessMode => is_access_mode(value),
        Class::VolumeMode => is_volume_mode(value),
        Class::Handle => is_handle(value),
    }
}

fn check_leaf(mode: Mode, path: &str, value: &str, class: Class) -> Result<()> {
    match mode {
        Mode::TemplatePermissive if has_template_token(value) => Ok(()),
        Mode::ShapeStrict if has_template_token(value) => Err(Error::schema(
            path,
            "template strings are not allowed here".to_owned(),
        )),
        _ if matches_class(value, class) => Ok(()),
        _ => Err(Error::schema(
            path,
            format!("'{}' does not match the expected {:?} form", value, class),
        )),
    }
}

/// Walks a free-form template tree; in shape-strict mode no string leaf
/// may carry a template token.
pub fn check_template_tree(mode: Mode, path: &str, tree: &Value) -> Result<()> {
    if mode == Mode::TemplatePermissive {
        return Ok(());
    }
    match tree {
        Value::String(s) if has_template_token(s) => Err(Error::schema(
            path,
            "template strings are not allowed here".to_owned(),
        )),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_template_tree(mode, &format!("{}.{}", path, i), item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                check_template_tree(mode, &format!("{}.{}", path, key), item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Validates a provisioner spec (plus its object name) against the
/// declarative schema in the given mode.
pub fn validate_spec(name: &str, spec: &PavProvisionerSpec, mode: Mode) -> Result<()> {
    if !is_dns_label(name) {
        return Err(Error::schema(
            "metadata.name",
            format!("'{}' is not a DNS label", name),
        ));
    }

    if let Some(validation) = &spec.volume_validation {
        if let Some(modes) = &validation.volume_modes {
            for (i, m) in modes.iter().enumerate() {
                check_leaf(
                    mode,
                    &format!("volumeValidation.volumeModes.{}", i),
                    m,
                    Class::VolumeMode,
                )?;
            }
        }
        if let Some(modes) = &validation.access_modes {
            for (i, m) in modes.iter().enumerate() {
                check_leaf(
                    mode,
                    &format!("volumeValidation.accessModes.{}", i),
                    m,
                    Class::AccessMode,
                )?;
            }
        }
        if let Some(min) = &validation.min_capacity {
            check_leaf(
                mode,
                "volumeValidation.minCapacity",
                &min.as_text(),
                Class::Capacity,
            )?;
        }
        if let Some(max) = &validation.max_capacity {
            check_leaf(
                mode,
                "volumeValidation.maxCapacity",
                &max.as_text(),
                Class::Capacity,
            )?;
        }
        if let Some(template) = &validation.pod_template {
            check_template_tree(mode, "volumeValidation.podTemplate", template)?;
        }
    }

    if let Some(creation) = &spec.volume_creation {
        if let Some(handle) = &creation.handle {
            check_leaf(mode, "volumeCreation.handle", handle, Class::Handle)?;
        }
        if let Some(cap) = &creation.capacity {
            check_leaf(mode, "volumeCreation.capacity", &cap.as_text(), Class::Capacity)?;
        }
        if let Some(template) = &creation.pod_template {
            check_template_tree(mode, "volumeCreation.podTemplate", template)?;
        }
    }

    if let Some(deletion) = &spec.volume_deletion {
        check_template_tree(mode, "volumeDeletion.podTemplate", &deletion.pod_template)?;
    }

    check_template_tree(mode, "volumeStaging.podTemplate", &spec.volume_staging.pod_template)?;

    if let Some(unstaging) = &spec.volume_unstaging {
        check_template_tree(mode, "volumeUnstaging.podTemplate", &unstaging.pod_template)?;
    }

    Ok(())
}

/// The cross-field rules admission enforces on top of the schema walk.
pub fn validate_cross_field(spec: &PavProvisionerSpec) -> Result<()> {
    if spec.provisioning_modes.is_empty() {
        return Err(Error::schema(
            "provisioningModes",
            "at least one provisioning mode is required".to_owned(),
        ));
    }

    let dynamic = spec.provisioning_modes.contains(&ProvisioningMode::Dynamic);
    let r#static = spec.provisioning_modes.contains(&ProvisioningMode::Static);

    if spec.provisioning_modes.len() > [dynamic, r#static].iter().filter(|b| **b).count() {
        return Err(Error::schema(
            "provisioningModes",
            "provisioning modes must be unique".to_owned(),
        ));
    }

    if !dynamic && spec.volume_creation.is_some() {
        return Err(Error::schema(
            "volumeCreation",
            "only allowed when provisioning modes include Dynamic".to_owned(),
        ));
    }
    if !dynamic && spec.volume_deletion.is_some() {
        return Err(Error::schema(
            "volumeDeletion",
            "only allowed when provisioning modes include Dynamic".to_owned(),
        ));
    }

    // Validation workers for statically provisioned volumes are not
    // supported; reject them up front instead of ignoring the template.
    if r#static
        && spec
            .volume_validation
            .as_ref()
            .map(|v| v.pod_template.is_some())
            .unwrap_or(false)
    {
        return Err(Error::schema(
            "volumeValidation.podTemplate",
            "validation workers are not supported for Static provisioning".to_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> PavProvisionerSpec {
        serde_json::from_value(value).unwrap()
    }

    fn templated() -> PavProvisionerSpec {
        spec(json!({
            "provisioningModes": ["Dynamic"],
            "volumeValidation": {
                "volumeModes": ["Filesystem"],
                "minCapacity": "{{ params.min }}",
            },
            "volumeCreation": {
                "handle": "{{ defaultHandle }}",
                "capacity": "{{ requestedMinCapacity }}",
            },
            "volumeStaging": {
                "podTemplate": { "spec": { "containers": [
                    { "name": "w", "command": ["sh", "-c", "echo {{ handle | to-shell-token }}"] }
                ]}}
            }
        }))
    }

    #[test]
    fn permissive_accepts_templates_in_string_leaves() {
        validate_spec("prov", &templated(), Mode::TemplatePermissive).unwrap();
    }

    #[test]
    fn strict_rejects_templates_in_string_leaves() {
        let err = validate_spec("prov", &templated(), Mode::ShapeStrict).unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
    }

    #[test]
    fn strict_accepts_literal_leaves() {
        let literal = spec(json!({
            "provisioningModes": ["Dynamic"],
            "volumeValidation": {
                "volumeModes": ["Block"],
                "accessModes": ["ReadWriteOnce"],
                "minCapacity": "1Gi",
                "maxCapacity": 1073741824i64,
            },
            "volumeCreation": { "handle": "vol-1", "capacity": "2Gi" },
            "volumeStaging": { "podTemplate": { "spec": {} } }
        }));
        validate_spec("prov", &literal, Mode::ShapeStrict).unwrap();
    }

    #[test]
    fn malformed_literals_fail_both_modes() {
        let bad = spec(json!({
            "provisioningModes": ["Dynamic"],
            "volumeValidation": { "accessModes": ["ReadSometimes"] },
            "volumeStaging": { "podTemplate": {} }
        }));
        assert!(validate_spec("prov", &bad, Mode::TemplatePermissive).is_err());
        assert!(validate_spec("prov", &bad, Mode::ShapeStrict).is_err());
    }

    #[test]
    fn object_names_must_be_dns_labels() {
        let ok = spec(json!({
            "provisioningModes": ["Static"],
            "volumeStaging": { "podTemplate": {} }
        }));
        assert!(validate_spec("Has-Caps", &ok, Mode::TemplatePermissive).is_err());
        assert!(validate_spec("-leading", &ok, Mode::TemplatePermissive).is_err());
        assert!(validate_spec("fine-name-1", &ok, Mode::TemplatePermissive).is_ok());
    }

    #[test]
    fn static_only_forbids_creation_and_deletion() {
        let bad = spec(json!({
            "provisioningModes": ["Static"],
            "volumeCreation": {},
            "volumeStaging": { "podTemplate": {} }
        }));
        assert!(validate_cross_field(&bad).is_err());

        let ok = spec(json!({
            "provisioningModes": ["Static", "Dynamic"],
            "volumeCreation": {},
            "volumeStaging": { "podTemplate": {} }
        }));
        assert!(validate_cross_field(&ok).is_ok());
    }

    #[test]
    fn duplicate_modes_are_rejected() {
        let bad = spec(json!({
            "provisioningModes": ["Dynamic", "Dynamic"],
            "volumeStaging": { "podTemplate": {} }
        }));
        assert!(validate_cross_field(&bad).is_err());
    }

    #[test]
    fn empty_modes_are_rejected() {
        let bad = spec(json!({
            "provisioningModes": [],
            "volumeStaging": { "podTemplate": {} }
        }));
        assert!(validate_cross_field(&bad).is_err());
    }

    #[test]
    fn static_validation_workers_are_rejected() {
        let bad = spec(json!({
            "provisioningModes": ["Static"],
            "volumeValidation": { "podTemplate": { "spec": {} } },
            "volumeStaging": { "podTemplate": {} }
        }));
        assert!(validate_cross_field(&bad).is_err());
    }

    #[test]
    fn evaluated_trees_may_not_keep_template_tokens() {
        let evaluated = json!({ "spec": { "containers": [{ "command": ["echo", "done"] }] } });
        check_template_tree(Mode::ShapeStrict, "p", &evaluated).unwrap();

        let leaky = json!({ "spec": { "containers": [{ "command": ["echo", "{{ handle }}"] }] } });
        assert!(check_template_tree(Mode::ShapeStrict, "p", &leaky).is_err());
    }
}
