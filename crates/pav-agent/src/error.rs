//! The error taxonomy shared by every agent component.

use std::time::Duration;

use thiserror::Error;

use crate::provisioner::phase::Phase;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Describes the possible failure kinds of a phase or agent operation.
///
/// Only `Orchestrator` errors are retried locally (with backoff);
/// everything else propagates to the caller, which for RPCs means the
/// status codes produced by [`Error::into_status`].
#[derive(Error, Debug)]
pub enum Error {
    /// The provisioner object violates its schema.
    #[error("schema violation at {path}: {message}")]
    Schema { path: String, message: String },

    /// Template evaluation failed. Not retried until the CR changes.
    #[error("template evaluation failed at {path}: {message}")]
    Template { path: String, message: String },

    /// The validation phase rejected the volume. Phase-retriable.
    #[error("volume validation failed: {0}")]
    Validation(String),

    /// The creation phase failed or did not yield a handle/capacity.
    #[error("volume creation failed: {0}")]
    Creation(String),

    /// The staging phase failed or did not produce `/pav/volume`.
    #[error("volume staging failed: {0}")]
    Staging(String),

    /// A deletion or unstaging phase failed; the volume is parked and
    /// flagged for operator intervention.
    #[error("{phase} phase failed and needs operator attention: {message}")]
    Unrecoverable { phase: Phase, message: String },

    /// A phase exceeded its bound.
    #[error("{phase} phase timed out after {timeout:?}")]
    Timeout { phase: Phase, timeout: Duration },

    /// Transient orchestrator trouble; retried with exponential backoff.
    #[error(transparent)]
    Orchestrator(#[from] kube::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Schema {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn template(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Template {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Maps the taxonomy onto the RPC status vocabulary.
    pub fn into_status(self) -> tonic::Status {
        match self {
            Error::Schema { .. } | Error::Template { .. } | Error::Validation(_) => {
                tonic::Status::invalid_argument(self.to_string())
            }
            Error::Creation(_) | Error::Staging(_) | Error::Unrecoverable { .. } => {
                tonic::Status::internal(self.to_string())
            }
            Error::Timeout { .. } => tonic::Status::deadline_exceeded(self.to_string()),
            Error::Orchestrator(_) | Error::Other(_) => tonic::Status::internal(self.to_string()),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        e.into_status()
    }
}
