//! Remote lifecycle state interpretation.
//!
//! | remote state | phase     | readiness                   | requeue | error         |
//! |--------------|-----------|-----------------------------|---------|---------------|
//! | CREATED      | running   | ready                       | none    | none          |
//! | PENDING      | pending   | not ready (Pending)         | 30s     | none          |
//! | FAILED       | failed    | not ready (ProvisionFailed) | none    | terminal      |
//! | DELETING     | unchanged | unchanged                   | 30s     | none          |
//! | other        | unknown   | not ready (UnknownState)    | 30s     | unknown state |

use std::time::Duration;

use mvm_reconcile::REQUEUE_PERIOD;
use thiserror::Error;

use crate::api::{ConditionReason, Severity, VmState};
use crate::remote::RemoteState;

/// Errors reported by interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// The remote service gave up provisioning. Retrying locally won't help.
    #[error("microvm failed to provision")]
    ProvisionFailed,

    #[error("microvm is in an unknown or unsupported state: {0}")]
    UnknownState(String),
}

/// Readiness update to apply to the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady {
        reason: ConditionReason,
        severity: Severity,
        message: String,
    },
}

/// Outcome of interpreting one remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpretation {
    /// `None` leaves the phase unchanged.
    pub vm_state: Option<VmState>,
    /// `None` leaves readiness unchanged.
    pub readiness: Option<Readiness>,
    pub requeue_after: Option<Duration>,
    pub error: Option<StateError>,
}

/// Map a remote lifecycle state to local status and requeue policy.
pub fn interpret(state: &RemoteState) -> Interpretation {
    match state {
        RemoteState::Created => Interpretation {
            vm_state: Some(VmState::Running),
            readiness: Some(Readiness::Ready),
            requeue_after: None,
            error: None,
        },
        RemoteState::Pending => Interpretation {
            vm_state: Some(VmState::Pending),
            readiness: Some(Readiness::NotReady {
                reason: ConditionReason::Pending,
                severity: Severity::Info,
                message: String::new(),
            }),
            requeue_after: Some(REQUEUE_PERIOD),
            error: None,
        },
        RemoteState::Failed => {
            let error = StateError::ProvisionFailed;
            Interpretation {
                vm_state: Some(VmState::Failed),
                readiness: Some(Readiness::NotReady {
                    reason: ConditionReason::ProvisionFailed,
                    severity: Severity::Error,
                    message: error.to_string(),
                }),
                requeue_after: None,
                error: Some(error),
            }
        }
        // Delete was issued on an earlier pass.
        RemoteState::Deleting => Interpretation {
            vm_state: None,
            readiness: None,
            requeue_after: Some(REQUEUE_PERIOD),
            error: None,
        },
        RemoteState::Other(raw) => {
            let error = StateError::UnknownState(raw.clone());
            Interpretation {
                vm_state: Some(VmState::Unknown),
                readiness: Some(Readiness::NotReady {
                    reason: ConditionReason::UnknownState,
                    severity: Severity::Error,
                    message: error.to_string(),
                }),
                requeue_after: Some(REQUEUE_PERIOD),
                error: Some(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case::created(RemoteState::Created, Some(VmState::Running), None, false)]
    #[case::pending(
        RemoteState::Pending,
        Some(VmState::Pending),
        Some(REQUEUE_PERIOD),
        false
    )]
    #[case::failed(RemoteState::Failed, Some(VmState::Failed), None, true)]
    #[case::deleting(RemoteState::Deleting, None, Some(REQUEUE_PERIOD), false)]
    #[case::unknown(
        RemoteState::Other("HIBERNATING".to_string()),
        Some(VmState::Unknown),
        Some(REQUEUE_PERIOD),
        true
    )]
    fn test_interpretation_table(
        #[case] state: RemoteState,
        #[case] vm_state: Option<VmState>,
        #[case] requeue_after: Option<Duration>,
        #[case] is_error: bool,
    ) {
        let result = interpret(&state);
        assert_eq!(result.vm_state, vm_state);
        assert_eq!(result.requeue_after, requeue_after);
        assert_eq!(result.error.is_some(), is_error);
    }

    #[rstest]
    #[case::pending(RemoteState::Pending, ConditionReason::Pending, Severity::Info)]
    #[case::failed(RemoteState::Failed, ConditionReason::ProvisionFailed, Severity::Error)]
    #[case::unknown(
        RemoteState::Other(String::new()),
        ConditionReason::UnknownState,
        Severity::Error
    )]
    fn test_not_ready_reasons(
        #[case] state: RemoteState,
        #[case] expected_reason: ConditionReason,
        #[case] expected_severity: Severity,
    ) {
        match interpret(&state).readiness {
            Some(Readiness::NotReady {
                reason, severity, ..
            }) => {
                assert_eq!(reason, expected_reason);
                assert_eq!(severity, expected_severity);
            }
            other => panic!("expected not ready, got {other:?}"),
        }
    }

    #[test]
    fn test_created_is_ready_and_quiescent() {
        let result = interpret(&RemoteState::Created);
        assert_eq!(result.readiness, Some(Readiness::Ready));
        assert!(result.requeue_after.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn test_deleting_leaves_status_alone() {
        let result = interpret(&RemoteState::Deleting);
        assert!(result.readiness.is_none());
        assert!(result.vm_state.is_none());
    }

    #[test]
    fn test_failed_is_terminal_error() {
        let result = interpret(&RemoteState::Failed);
        assert_eq!(result.error, Some(StateError::ProvisionFailed));
        assert!(result.requeue_after.is_none());
    }

    proptest! {
        #[test]
        fn test_unrecognized_states_poll_with_error(raw in "[A-Z_]{0,16}") {
            let state = RemoteState::from(raw.clone());
            prop_assume!(matches!(state, RemoteState::Other(_)));

            let result = interpret(&state);
            prop_assert_eq!(result.vm_state, Some(VmState::Unknown));
            prop_assert_eq!(result.requeue_after, Some(REQUEUE_PERIOD));
            prop_assert_eq!(result.error, Some(StateError::UnknownState(raw)));
        }
    }
}
