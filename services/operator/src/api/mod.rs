//! Microvm resource model.
//!
//! - `microvm`: the desired-state record (identity, spec, status, finalizers)
//! - `conditions`: readiness condition vocabulary and bookkeeping helpers

pub mod conditions;
pub mod microvm;

pub use conditions::{
    Condition, ConditionReason, ConditionStatus, Severity, MICROVM_READY_CONDITION,
};
pub use microvm::{
    ContainerFileSource, HostSpec, IfaceType, Microvm, MicrovmProxy, MicrovmSpec, MicrovmStatus,
    NetworkInterface, ObjectKey, ObjectMeta, SshPublicKey, VmState, Volume, MICROVM_FINALIZER,
};
