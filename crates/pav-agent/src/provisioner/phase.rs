//! The five lifecycle phases a provisioner can template.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Default bound on a single worker-pod lifetime.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(600);

/// A provisioner lifecycle phase. Every worker pod runs exactly one of
/// these on behalf of exactly one volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Validation,
    Creation,
    Deletion,
    Staging,
    Unstaging,
}

/// Which evaluation-context family a phase renders its templates under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    /// The claim-centric context used by validation, creation and deletion.
    Provisioning,
    /// The node-centric context used by staging and unstaging.
    Staging,
}

/// How a phase's worker pod is judged successful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuccessRule {
    /// The pod must terminate with exit code zero.
    PodSucceeded,
    /// Exit code zero, or the pod signals `/pav/ready` and stays alive.
    PodSucceededOrReady,
}

/// Capability record for a phase: how to render it, when it succeeded,
/// and which phase undoes its partial effects. New phases extend the
/// `Phase` variant and this table, nothing else.
#[derive(Clone, Copy, Debug)]
pub struct PhaseDescriptor {
    pub context: ContextKind,
    pub success: SuccessRule,
    pub rollback: Option<Phase>,
    pub timeout: Duration,
    /// Failed pods of phases with no rollback path are kept (and
    /// annotated) for diagnostics instead of deleted; the volume is
    /// parked until an operator intervenes.
    pub retain_failed_pod: bool,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validation => "validation",
            Phase::Creation => "creation",
            Phase::Deletion => "deletion",
            Phase::Staging => "staging",
            Phase::Unstaging => "unstaging",
        }
    }

    pub fn descriptor(&self) -> PhaseDescriptor {
        match self {
            Phase::Validation => PhaseDescriptor {
                context: ContextKind::Provisioning,
                success: SuccessRule::PodSucceeded,
                rollback: None,
                timeout: DEFAULT_PHASE_TIMEOUT,
                retain_failed_pod: false,
            },
            Phase::Creation => PhaseDescriptor {
                context: ContextKind::Provisioning,
                success: SuccessRule::PodSucceeded,
                rollback: Some(Phase::Deletion),
                timeout: DEFAULT_PHASE_TIMEOUT,
                retain_failed_pod: false,
            },
            Phase::Deletion => PhaseDescriptor {
                context: ContextKind::Provisioning,
                success: SuccessRule::PodSucceeded,
                rollback: None,
                timeout: DEFAULT_PHASE_TIMEOUT,
                retain_failed_pod: true,
            },
            Phase::Staging => PhaseDescriptor {
                context: ContextKind::Staging,
                // A staging pod may keep running after signalling
                // readiness; the timeout only bounds the time to the
                // first of the two outcomes.
                success: SuccessRule::PodSucceededOrReady,
                rollback: Some(Phase::Unstaging),
                timeout: DEFAULT_PHASE_TIMEOUT,
                retain_failed_pod: false,
            },
            Phase::Unstaging => PhaseDescriptor {
                context: ContextKind::Staging,
                success: SuccessRule::PodSucceeded,
                rollback: None,
                timeout: DEFAULT_PHASE_TIMEOUT,
                retain_failed_pod: true,
            },
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rollback_edges_match_the_state_machines() {
        assert_eq!(Phase::Creation.descriptor().rollback, Some(Phase::Deletion));
        assert_eq!(Phase::Staging.descriptor().rollback, Some(Phase::Unstaging));
        assert_eq!(Phase::Validation.descriptor().rollback, None);
        assert_eq!(Phase::Deletion.descriptor().rollback, None);
        assert_eq!(Phase::Unstaging.descriptor().rollback, None);
    }

    #[test]
    fn only_staging_may_stay_alive() {
        for phase in [
            Phase::Validation,
            Phase::Creation,
            Phase::Deletion,
            Phase::Unstaging,
        ] {
            assert_eq!(phase.descriptor().success, SuccessRule::PodSucceeded);
        }
        assert_eq!(
            Phase::Staging.descriptor().success,
            SuccessRule::PodSucceededOrReady
        );
    }
}
