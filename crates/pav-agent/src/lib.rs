//! Agent library for PaV, a cluster plugin that turns pod templates
//! into storage provisioners.
//!
//! An operator writes a [`provisioner::PavProvisioner`] naming up to
//! five lifecycle phases, each carrying a pod template. The
//! [`registry`] materializes an infrastructure bundle per provisioner;
//! the [`csi`] plugins advance each volume through its phase state
//! machines by launching worker pods rendered through the
//! [`template`] engine and judged by the [`worker`] driver.

pub mod admission;
pub mod capacity;
pub mod config;
pub mod csi;
pub mod error;
pub mod mount;
pub mod provisioner;
pub mod registry;
pub mod schema;
pub mod template;
pub mod worker;

pub use error::{Error, Result};

/// API group of the `PavProvisioner` custom resource.
pub const API_GROUP: &str = "pav.dev";

/// Finalizer through which the registry pins a provisioner while
/// volumes of it exist.
pub const FINALIZER: &str = "pav.dev/provisioner";

/// Label marking which provisioner an infrastructure-bundle object
/// belongs to.
pub const PROVISIONER_LABEL: &str = "pav.dev/provisioner";

/// Worker-pod labels.
pub const PHASE_LABEL: &str = "pav.dev/phase";
pub const PROVISIONER_UID_LABEL: &str = "pav.dev/provisioner-uid";
pub const VOLUME_HANDLE_LABEL: &str = "pav.dev/volume-handle";

/// Annotation flagging an object parked for operator intervention
/// after an unrecoverable deletion or unstaging failure.
pub const UNRECOVERABLE_ANNOTATION: &str = "pav.dev/unrecoverable";
