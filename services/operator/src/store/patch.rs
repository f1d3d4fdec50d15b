//! Field-level merge patches for Microvm resources.
//!
//! A patch only names the fields that changed, so concurrent writers that
//! touch other fields (other finalizers, other condition types, the spec) are
//! never overwritten.

use crate::api::conditions;
use crate::api::{Condition, Microvm, VmState};

use super::StoreError;

/// Changes to apply to a stored Microvm.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MicrovmPatch {
    /// Precondition: the stored resource version must equal this value.
    pub resource_version: Option<u64>,

    pub add_finalizers: Vec<String>,
    pub remove_finalizers: Vec<String>,

    pub status: StatusPatch,
}

/// Changes to the status sub-record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub provider_id: Option<String>,
    /// Precondition for changing an assigned provider ID: the stored ID must
    /// equal this value. Without it an assigned ID cannot change.
    pub replaces_provider_id: Option<String>,
    pub ready: Option<bool>,
    pub vm_state: Option<VmState>,
    /// Upserted by condition type.
    pub conditions: Vec<Condition>,
    pub observed_generation: Option<i64>,
    /// `Some(None)` clears the field.
    pub failure_reason: Option<Option<String>>,
    pub failure_message: Option<Option<String>>,
}

impl StatusPatch {
    pub fn is_empty(&self) -> bool {
        self.provider_id.is_none()
            && self.ready.is_none()
            && self.vm_state.is_none()
            && self.conditions.is_empty()
            && self.observed_generation.is_none()
            && self.failure_reason.is_none()
            && self.failure_message.is_none()
    }
}

impl MicrovmPatch {
    /// Compute the patch that turns `before` into `after`.
    ///
    /// Only finalizers and status are diffed; metadata and spec are owned by
    /// other writers.
    pub fn diff(before: &Microvm, after: &Microvm) -> Self {
        let add_finalizers = after
            .metadata
            .finalizers
            .iter()
            .filter(|f| !before.metadata.finalizers.contains(f))
            .cloned()
            .collect();
        let remove_finalizers = before
            .metadata
            .finalizers
            .iter()
            .filter(|f| !after.metadata.finalizers.contains(f))
            .cloned()
            .collect();

        let old = &before.status;
        let new = &after.status;

        let conditions = new
            .conditions
            .iter()
            .filter(|c| {
                conditions::get(&old.conditions, &c.condition_type).map_or(true, |o| o != *c)
            })
            .cloned()
            .collect();

        let status = StatusPatch {
            provider_id: new
                .provider_id
                .clone()
                .filter(|_| new.provider_id != old.provider_id),
            replaces_provider_id: old
                .provider_id
                .clone()
                .filter(|_| new.provider_id.is_some() && new.provider_id != old.provider_id),
            ready: (new.ready != old.ready).then_some(new.ready),
            vm_state: new.vm_state.filter(|_| new.vm_state != old.vm_state),
            conditions,
            observed_generation: (new.observed_generation != old.observed_generation)
                .then_some(new.observed_generation),
            failure_reason: (new.failure_reason != old.failure_reason)
                .then(|| new.failure_reason.clone()),
            failure_message: (new.failure_message != old.failure_message)
                .then(|| new.failure_message.clone()),
        };

        Self {
            resource_version: None,
            add_finalizers,
            remove_finalizers,
            status,
        }
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.add_finalizers.is_empty() && self.remove_finalizers.is_empty() && self.status.is_empty()
    }

    /// Returns true if the patch touches the finalizer set.
    pub fn changes_finalizers(&self) -> bool {
        !self.add_finalizers.is_empty() || !self.remove_finalizers.is_empty()
    }

    /// Merge the patch into `microvm`.
    ///
    /// Fails if the patch would change an already assigned provider ID other
    /// than the one it names in `replaces_provider_id`.
    pub fn apply_to(&self, microvm: &mut Microvm) -> Result<(), StoreError> {
        let status = &mut microvm.status;

        if let Some(provider_id) = &self.status.provider_id {
            if let Some(existing) = status.provider_id.as_ref().filter(|e| *e != provider_id) {
                if self.status.replaces_provider_id.as_ref() != Some(existing) {
                    return Err(StoreError::Invalid(format!(
                        "provider ID is immutable: {existing} cannot become {provider_id}"
                    )));
                }
            }
            status.provider_id = Some(provider_id.clone());
        }
        if let Some(ready) = self.status.ready {
            status.ready = ready;
        }
        if let Some(vm_state) = self.status.vm_state {
            status.vm_state = Some(vm_state);
        }
        for condition in &self.status.conditions {
            conditions::set(&mut status.conditions, condition.clone());
        }
        if let Some(generation) = self.status.observed_generation {
            status.observed_generation = generation;
        }
        if let Some(reason) = &self.status.failure_reason {
            status.failure_reason = reason.clone();
        }
        if let Some(message) = &self.status.failure_message {
            status.failure_message = message.clone();
        }

        for finalizer in &self.add_finalizers {
            microvm.add_finalizer(finalizer);
        }
        for finalizer in &self.remove_finalizers {
            microvm.remove_finalizer(finalizer);
        }

        Ok(())
    }
}
