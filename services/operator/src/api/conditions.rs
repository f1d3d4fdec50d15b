//! Readiness condition vocabulary.
//!
//! Observers read the `MicrovmReady` condition to tell apart "still
//! provisioning", "provisioning failed", "deleting" and "unknown" without
//! consulting logs. Reasons are a closed set.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition type reporting whether the microvm is running.
pub const MICROVM_READY_CONDITION: &str = "MicrovmReady";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "Info"),
            Severity::Warning => write!(f, "Warning"),
            Severity::Error => write!(f, "Error"),
        }
    }
}

/// Why a microvm is not ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    /// The microvm failed to provision.
    #[serde(rename = "MicrovmProvisionFailed")]
    ProvisionFailed,

    /// The microvm is still being provisioned.
    #[serde(rename = "MicrovmPending")]
    Pending,

    /// The microvm is being deleted.
    #[serde(rename = "MicrovmDeleting")]
    Deleting,

    /// The delete call for the microvm failed.
    #[serde(rename = "MicrovmDeleteFailed")]
    DeleteFailed,

    /// The microvm is in an unknown or unsupported state.
    #[serde(rename = "MicrovmUnknownState")]
    UnknownState,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProvisionFailed => "MicrovmProvisionFailed",
            Self::Pending => "MicrovmPending",
            Self::Deleting => "MicrovmDeleting",
            Self::DeleteFailed => "MicrovmDeleteFailed",
            Self::UnknownState => "MicrovmUnknownState",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    /// Set only when `status` is not `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConditionReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// When `status` last changed.
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// A `True` condition of the given type.
    pub fn true_condition(condition_type: &str) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::True,
            reason: None,
            severity: None,
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    /// A `False` condition with a reason.
    pub fn false_condition(
        condition_type: &str,
        reason: ConditionReason,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::False,
            reason: Some(reason),
            severity: Some(severity),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same status, reason, severity and message (ignoring timestamps).
    pub fn same_as(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.severity == other.severity
            && self.message == other.message
    }
}

/// Find a condition by type.
pub fn get<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Insert or replace a condition by type.
///
/// An identical condition is left untouched, and `last_transition_time` is
/// carried over unless `status` changes. Returns true if anything changed.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) if existing.same_as(&condition) => false,
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}
