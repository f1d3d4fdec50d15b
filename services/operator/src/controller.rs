//! Microvm reconciliation engine.
//!
//! Each pass re-reads the resource, then either drives it toward a running
//! remote microvm or, once deletion was requested, tears the remote microvm
//! down and releases the finalizer.
//!
//! Crash-safety ordering within a normal pass:
//! 1. the finalizer is persisted before any create call
//! 2. the provider ID is persisted right after create, before the remote
//!    state is interpreted
//!
//! Everything else is buffered in the scope and written once when the pass
//! ends, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use mvm_reconcile::{Action, REQUEUE_PERIOD};
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};

use crate::api::{ConditionReason, ObjectKey, Severity, MICROVM_FINALIZER};
use crate::remote::{ClientFactory, ClientOptions, RemoteError, RemoteRecord, RemoteState};
use crate::scope::{MicrovmScope, ScopeError};
use crate::service::MicrovmService;
use crate::state::{self, Readiness, StateError};
use crate::store::Store;

/// Errors returned by a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("microvm client factory is not configured")]
    ClientFactoryRequired,

    #[error("{operation} for {key}: {source}")]
    Scope {
        operation: &'static str,
        key: ObjectKey,
        #[source]
        source: ScopeError,
    },

    #[error("{operation} for {key}: {source}")]
    Remote {
        operation: &'static str,
        key: ObjectKey,
        #[source]
        source: RemoteError,
    },

    #[error("microvm {key} failed to provision")]
    ProvisionFailed { key: ObjectKey },

    #[error("microvm {key} is in an unknown or unsupported state: {state}")]
    UnknownState { key: ObjectKey, state: String },
}

impl ReconcileError {
    fn scope(operation: &'static str, key: ObjectKey, source: ScopeError) -> Self {
        Self::Scope {
            operation,
            key,
            source,
        }
    }

    fn remote(operation: &'static str, key: ObjectKey, source: RemoteError) -> Self {
        Self::Remote {
            operation,
            key,
            source,
        }
    }

    /// Retrying won't help: misconfiguration or a failed remote provision.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReconcileError::ClientFactoryRequired | ReconcileError::ProvisionFailed { .. }
        )
    }

    /// Fixed re-check delay for errors that should keep polling.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::UnknownState { .. } => Some(REQUEUE_PERIOD),
            _ => None,
        }
    }
}

/// Reconciles Microvm resources against the remote lifecycle service.
pub struct MicrovmReconciler {
    store: Arc<dyn Store>,
    client_factory: Option<Arc<dyn ClientFactory>>,
}

impl MicrovmReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        client_factory: Option<Arc<dyn ClientFactory>>,
    ) -> Self {
        Self {
            store,
            client_factory,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run one reconciliation pass for `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let mut scope = match MicrovmScope::open(Arc::clone(&self.store), key).await {
            Ok(scope) => scope,
            Err(ScopeError::NotFound(_)) => {
                debug!(key = %key, "Microvm not found, nothing to do");
                return Ok(Action::await_change());
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to open microvm scope");
                return Err(ReconcileError::scope("opening scope", key.clone(), e));
            }
        };

        if scope.endpoint().is_empty() {
            info!(key = %key, "Host endpoint not set for microvm, skipping");
            return Ok(Action::await_change());
        }

        let span = scope.span().clone();
        let result = async {
            if scope.is_deleting() {
                self.reconcile_delete(&mut scope).await
            } else {
                self.reconcile_normal(&mut scope).await
            }
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = scope.close().await {
            error!(parent: &span, error = %e, "Failed to write back microvm");
        }

        result
    }

    async fn reconcile_delete(&self, scope: &mut MicrovmScope) -> Result<Action, ReconcileError> {
        info!("Reconciling microvm delete");

        // The finalizer keeps the resource around, so parking here loses nothing.
        let service = match self.microvm_service(scope).await {
            Ok(service) => service,
            Err(e) => {
                error!(error = %e, "Failed to get microvm service");
                return Ok(Action::await_change());
            }
        };

        let result = self.delete_remote(scope, &service).await;
        service.close().await;
        result
    }

    async fn delete_remote(
        &self,
        scope: &mut MicrovmScope,
        service: &MicrovmService,
    ) -> Result<Action, ReconcileError> {
        let key = scope.key();

        let record = service.get(scope).await.map_err(|e| {
            error!(error = %e, "Failed getting microvm");
            ReconcileError::remote("getting microvm", key.clone(), e)
        })?;

        let Some(record) = record else {
            // Nothing left remotely; the store may now remove the resource.
            scope.remove_finalizer(MICROVM_FINALIZER);
            info!("Microvm deleted");
            return Ok(Action::await_change());
        };

        scope.set_not_ready(ConditionReason::Deleting, Severity::Info, "");

        if record.state != RemoteState::Deleting {
            info!(uid = %record.uid, "Deleting microvm");
            if let Err(e) = service.delete(scope).await {
                error!(uid = %record.uid, error = %e, "Failed deleting microvm");
                scope.set_not_ready(ConditionReason::DeleteFailed, Severity::Error, &e.to_string());
                return Err(ReconcileError::remote("deleting microvm", key, e));
            }
        }

        Ok(Action::requeue(REQUEUE_PERIOD))
    }

    async fn reconcile_normal(&self, scope: &mut MicrovmScope) -> Result<Action, ReconcileError> {
        let service = self.microvm_service(scope).await.map_err(|e| {
            error!(error = %e, "Failed to get microvm service");
            e
        })?;

        let result = self.ensure_remote(scope, &service).await;
        service.close().await;
        result
    }

    async fn ensure_remote(
        &self,
        scope: &mut MicrovmScope,
        service: &MicrovmService,
    ) -> Result<Action, ReconcileError> {
        let key = scope.key();

        // Not found is "does not exist yet", also when the remote lost it.
        let existing = match scope.provider_id() {
            Some(_) => service.get(scope).await.map_err(|e| {
                error!(error = %e, "Failed checking if microvm exists");
                ReconcileError::remote("checking if microvm exists", key.clone(), e)
            })?,
            None => None,
        };

        scope.add_finalizer(MICROVM_FINALIZER);
        scope.close().await.map_err(|e| {
            error!(error = %e, "Unable to persist finalizer");
            ReconcileError::scope("persisting finalizer", key.clone(), e)
        })?;

        let record = match existing {
            Some(record) => {
                scope
                    .set_provider_id(&record.uid)
                    .map_err(|e| ReconcileError::scope("recording provider ID", key.clone(), e))?;
                record
            }
            None => {
                let record = self.create_remote(scope, service).await?;
                scope.replace_provider_id(&record.uid);
                record
            }
        };
        scope.close().await.map_err(|e| {
            error!(error = %e, "Unable to persist provider ID");
            ReconcileError::scope("persisting provider ID", key.clone(), e)
        })?;

        self.apply_remote_state(scope, &record.state)
    }

    async fn create_remote(
        &self,
        scope: &MicrovmScope,
        service: &MicrovmService,
    ) -> Result<RemoteRecord, ReconcileError> {
        let key = scope.key();

        match scope.provider_id() {
            Some(lost) => warn!(lost_uid = %lost, "Remote microvm not found, recreating"),
            None => info!("Creating microvm"),
        }
        let record = service
            .create(scope)
            .await
            .map_err(|e| ReconcileError::remote("creating microvm", key, e))?;
        info!(uid = %record.uid, "Microvm created");

        Ok(record)
    }

    fn apply_remote_state(
        &self,
        scope: &mut MicrovmScope,
        remote_state: &RemoteState,
    ) -> Result<Action, ReconcileError> {
        let interpretation = state::interpret(remote_state);

        if let Some(vm_state) = interpretation.vm_state {
            let previous = scope.microvm().status.vm_state;
            if previous != Some(vm_state) {
                info!(
                    remote_state = %remote_state,
                    vm_state = %vm_state,
                    "Microvm state changed"
                );
            }
            scope.set_vm_state(vm_state);
        } else {
            debug!(remote_state = %remote_state, "Microvm is deleting");
        }

        match interpretation.readiness {
            Some(Readiness::Ready) => scope.set_ready(),
            Some(Readiness::NotReady {
                reason,
                severity,
                message,
            }) => scope.set_not_ready(reason, severity, &message),
            None => {}
        }

        match interpretation.error {
            None => Ok(Action {
                requeue_after: interpretation.requeue_after,
            }),
            Some(StateError::ProvisionFailed) => {
                Err(ReconcileError::ProvisionFailed { key: scope.key() })
            }
            Some(StateError::UnknownState(state)) => Err(ReconcileError::UnknownState {
                key: scope.key(),
                state,
            }),
        }
    }

    async fn microvm_service(&self, scope: &MicrovmScope) -> Result<MicrovmService, ReconcileError> {
        let factory = self
            .client_factory
            .as_ref()
            .ok_or(ReconcileError::ClientFactoryRequired)?;

        let token = scope
            .basic_auth_token()
            .await
            .map_err(|e| ReconcileError::scope("getting basic auth token", scope.key(), e))?;
        let tls = scope
            .tls_config()
            .await
            .map_err(|e| ReconcileError::scope("getting TLS config", scope.key(), e))?;

        let options = ClientOptions {
            proxy: scope
                .microvm()
                .spec
                .microvm_proxy
                .as_ref()
                .map(|proxy| proxy.endpoint.clone()),
            basic_auth_token: token,
            tls,
        };

        let client = factory
            .connect(scope.endpoint(), options)
            .map_err(|e| ReconcileError::remote("creating microvm client", scope.key(), e))?;

        Ok(MicrovmService::new(client))
    }
}
