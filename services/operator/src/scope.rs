//! Per-pass resource scope.
//!
//! A `MicrovmScope` wraps one Microvm for the duration of a reconciliation
//! pass. Mutations go to a working copy that later steps read back at once;
//! nothing is visible to other readers until `close` writes the difference
//! between the working copy and the last persisted snapshot as a merge patch.
//! `close` may be called any number of times; each call writes only what
//! changed since the previous one.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info_span, warn, Span};

use crate::api::conditions;
use crate::api::{
    Condition, ConditionReason, Microvm, ObjectKey, Severity, VmState, MICROVM_READY_CONDITION,
};
use crate::remote::TlsConfig;
use crate::store::{MicrovmPatch, Store, StoreError};

/// Secret key holding the basic auth token.
pub const BASIC_AUTH_TOKEN_KEY: &str = "token";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const TLS_CA_KEY: &str = "ca.crt";

/// Write-back attempts before a version conflict is reported.
const MAX_CLOSE_ATTEMPTS: usize = 3;

/// Errors from scope operations.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("microvm {0} not found")]
    NotFound(ObjectKey),

    #[error("invalid host endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("provider ID is immutable: {existing} cannot become {requested}")]
    ProviderIdImmutable { existing: String, requested: String },

    #[error("secret {namespace}/{name} not found")]
    MissingSecret { namespace: String, name: String },

    #[error("secret {namespace}/{name}: {reason}")]
    InvalidSecret {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validate a `host:port` endpoint.
pub fn validate_endpoint(endpoint: &str) -> Result<(), ScopeError> {
    let invalid = |reason: &str| ScopeError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    if host.contains('/') {
        return Err(invalid("must not contain a scheme or path"));
    }
    port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok(())
}

/// Accessor for one Microvm during one reconciliation pass.
pub struct MicrovmScope {
    store: Arc<dyn Store>,
    microvm: Microvm,
    persisted: Microvm,
    span: Span,
}

impl MicrovmScope {
    /// Load the resource and validate its immutable fields.
    ///
    /// An empty host endpoint is accepted; it means the resource is not
    /// scheduled yet and the caller decides what to do with it.
    pub async fn open(store: Arc<dyn Store>, key: &ObjectKey) -> Result<Self, ScopeError> {
        let microvm = match store.get(key).await {
            Ok(microvm) => microvm,
            Err(e) if e.is_not_found() => return Err(ScopeError::NotFound(key.clone())),
            Err(e) => return Err(e.into()),
        };

        let endpoint = &microvm.spec.host.endpoint;
        if !endpoint.is_empty() {
            validate_endpoint(endpoint)?;
        }

        let span = info_span!(
            "microvm",
            namespace = %microvm.metadata.namespace,
            name = %microvm.metadata.name,
        );

        Ok(Self {
            store,
            persisted: microvm.clone(),
            microvm,
            span,
        })
    }

    pub fn name(&self) -> &str {
        &self.microvm.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.microvm.metadata.namespace
    }

    pub fn key(&self) -> ObjectKey {
        self.microvm.key()
    }

    /// The working copy, including unsaved mutations.
    pub fn microvm(&self) -> &Microvm {
        &self.microvm
    }

    /// Span bound to the resource identity.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn endpoint(&self) -> &str {
        &self.microvm.spec.host.endpoint
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.microvm.status.provider_id.as_deref()
    }

    pub fn is_deleting(&self) -> bool {
        self.microvm.is_deleting()
    }

    /// Record the remote UID. Setting the same value again is a no-op.
    pub fn set_provider_id(&mut self, id: &str) -> Result<(), ScopeError> {
        match self.microvm.status.provider_id.as_deref() {
            Some(existing) if existing == id => Ok(()),
            Some(existing) => Err(ScopeError::ProviderIdImmutable {
                existing: existing.to_string(),
                requested: id.to_string(),
            }),
            None => {
                self.microvm.status.provider_id = Some(id.to_string());
                Ok(())
            }
        }
    }

    /// Record the UID of a microvm created this pass.
    ///
    /// Replaces a recorded ID whose remote record was lost. The write-back
    /// only succeeds if the stored ID is still the one being replaced.
    pub fn replace_provider_id(&mut self, id: &str) {
        if let Some(lost) = self.provider_id().filter(|lost| *lost != id) {
            warn!(parent: &self.span, lost_uid = %lost, uid = %id, "Replacing provider ID of lost microvm");
        }
        self.microvm.status.provider_id = Some(id.to_string());
    }

    pub fn set_vm_state(&mut self, state: VmState) {
        self.microvm.status.vm_state = Some(state);
    }

    /// Mark the microvm ready and clear any recorded failure.
    pub fn set_ready(&mut self) {
        let status = &mut self.microvm.status;
        status.ready = true;
        status.failure_reason = None;
        status.failure_message = None;
        conditions::set(
            &mut status.conditions,
            Condition::true_condition(MICROVM_READY_CONDITION),
        );
    }

    /// Mark the microvm not ready.
    ///
    /// `Error` severity records the failure reason and message; any other
    /// severity clears them.
    pub fn set_not_ready(&mut self, reason: ConditionReason, severity: Severity, message: &str) {
        let status = &mut self.microvm.status;
        status.ready = false;
        if severity == Severity::Error {
            status.failure_reason = Some(reason.as_str().to_string());
            status.failure_message = Some(message.to_string());
        } else {
            status.failure_reason = None;
            status.failure_message = None;
        }
        conditions::set(
            &mut status.conditions,
            Condition::false_condition(MICROVM_READY_CONDITION, reason, severity, message),
        );
    }

    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        self.microvm.add_finalizer(finalizer)
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        self.microvm.remove_finalizer(finalizer)
    }

    /// True if the working copy differs from what was last written.
    pub fn has_changes(&self) -> bool {
        !MicrovmPatch::diff(&self.persisted, &self.microvm).is_empty()
    }

    /// Basic auth token from the secret named by `basic_auth_secret`.
    pub async fn basic_auth_token(&self) -> Result<Option<String>, ScopeError> {
        let Some(name) = self.microvm.spec.basic_auth_secret.as_deref() else {
            return Ok(None);
        };

        let secret = self.secret(name).await?;
        match secret.data.get(BASIC_AUTH_TOKEN_KEY) {
            Some(token) => Ok(Some(token.clone())),
            None => Err(self.invalid_secret(name, format!("missing key {BASIC_AUTH_TOKEN_KEY}"))),
        }
    }

    /// Client TLS material from the secret named by `tls_secret_ref`.
    pub async fn tls_config(&self) -> Result<Option<TlsConfig>, ScopeError> {
        let Some(name) = self.microvm.spec.tls_secret_ref.as_deref() else {
            return Ok(None);
        };

        let secret = self.secret(name).await?;
        let field = |key: &str| {
            secret
                .data
                .get(key)
                .cloned()
                .ok_or_else(|| self.invalid_secret(name, format!("missing key {key}")))
        };

        Ok(Some(TlsConfig {
            cert_pem: field(TLS_CERT_KEY)?,
            key_pem: field(TLS_KEY_KEY)?,
            ca_pem: field(TLS_CA_KEY)?,
        }))
    }

    async fn secret(&self, name: &str) -> Result<crate::store::Secret, ScopeError> {
        match self.store.get_secret(self.namespace(), name).await {
            Ok(secret) => Ok(secret),
            Err(e) if e.is_not_found() => Err(ScopeError::MissingSecret {
                namespace: self.namespace().to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn invalid_secret(&self, name: &str, reason: String) -> ScopeError {
        ScopeError::InvalidSecret {
            namespace: self.namespace().to_string(),
            name: name.to_string(),
            reason,
        }
    }

    /// Write pending mutations back to the store.
    ///
    /// Does nothing if nothing changed since the last write. Only changed
    /// fields are sent, so concurrent writers of other fields are preserved.
    /// A version conflict is retried against the latest stored version.
    pub async fn close(&mut self) -> Result<(), ScopeError> {
        self.microvm.status.observed_generation = self.microvm.metadata.generation;

        let mut patch = MicrovmPatch::diff(&self.persisted, &self.microvm);
        if patch.is_empty() {
            return Ok(());
        }
        let key = self.key();
        patch.resource_version = Some(self.persisted.metadata.resource_version);

        let mut attempt = 1;
        let stored = loop {
            match self.store.patch(&key, &patch).await {
                Ok(stored) => break stored,
                Err(e) if e.is_conflict() && attempt < MAX_CLOSE_ATTEMPTS => {
                    warn!(parent: &self.span, attempt, error = %e, "Write-back conflict, retrying");
                    attempt += 1;
                    match self.store.get(&key).await {
                        Ok(latest) => {
                            patch.resource_version = Some(latest.metadata.resource_version);
                        }
                        Err(e) if e.is_not_found() => break None,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        match stored {
            Some(stored) => {
                debug!(
                    parent: &self.span,
                    resource_version = stored.metadata.resource_version,
                    "Microvm written back"
                );
                self.microvm = stored.clone();
                self.persisted = stored;
            }
            None => {
                debug!(parent: &self.span, "Microvm removed from store");
                self.persisted = self.microvm.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MicrovmSpec, MICROVM_FINALIZER};
    use crate::store::{Secret, SqliteStore};

    fn spec(endpoint: &str) -> MicrovmSpec {
        let mut spec = MicrovmSpec::default();
        spec.host.endpoint = endpoint.to_string();
        spec
    }

    async fn setup(spec: MicrovmSpec) -> (Arc<dyn Store>, ObjectKey) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mvm = store
            .apply(Microvm::new("default", "mvm-1", spec))
            .await
            .unwrap();
        (store, mvm.key())
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("10.0.0.1:9090").is_ok());
        assert!(validate_endpoint("host.example.com:443").is_ok());
        assert!(validate_endpoint("[::1]:9090").is_ok());

        assert!(validate_endpoint("10.0.0.1").is_err());
        assert!(validate_endpoint(":9090").is_err());
        assert!(validate_endpoint("10.0.0.1:http").is_err());
        assert!(validate_endpoint("10.0.0.1:70000").is_err());
        assert!(validate_endpoint("http://10.0.0.1:9090").is_err());
    }

    #[tokio::test]
    async fn test_open_missing_resource() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let err = MicrovmScope::open(store, &ObjectKey::new("default", "nope"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScopeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_open_rejects_malformed_endpoint() {
        let (store, key) = setup(spec("not-an-endpoint")).await;
        let err = MicrovmScope::open(store, &key).await.err().unwrap();
        assert!(matches!(err, ScopeError::InvalidEndpoint { .. }));
    }

    #[tokio::test]
    async fn test_open_accepts_empty_endpoint() {
        let (store, key) = setup(spec("")).await;
        let scope = MicrovmScope::open(store, &key).await.unwrap();
        assert_eq!(scope.endpoint(), "");
        assert_eq!(scope.name(), "mvm-1");
    }

    #[tokio::test]
    async fn test_mutations_are_buffered_until_close() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let mut scope = MicrovmScope::open(Arc::clone(&store), &key).await.unwrap();

        scope.add_finalizer(MICROVM_FINALIZER);
        scope.set_provider_id("uid-1").unwrap();
        assert_eq!(scope.provider_id(), Some("uid-1"));
        assert!(scope.has_changes());

        let stored = store.get(&key).await.unwrap();
        assert!(stored.status.provider_id.is_none());
        assert!(stored.metadata.finalizers.is_empty());

        scope.close().await.unwrap();
        assert!(!scope.has_changes());

        let stored = store.get(&key).await.unwrap();
        assert_eq!(stored.status.provider_id.as_deref(), Some("uid-1"));
        assert!(stored.has_finalizer(MICROVM_FINALIZER));
        assert_eq!(stored.status.observed_generation, 1);
    }

    #[tokio::test]
    async fn test_close_without_changes_does_not_write() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let mut scope = MicrovmScope::open(Arc::clone(&store), &key).await.unwrap();
        scope.close().await.unwrap();
        let version = store.get(&key).await.unwrap().metadata.resource_version;

        scope.close().await.unwrap();
        scope.close().await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap().metadata.resource_version,
            version
        );
    }

    #[tokio::test]
    async fn test_provider_id_is_immutable() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let mut scope = MicrovmScope::open(store, &key).await.unwrap();

        scope.set_provider_id("uid-1").unwrap();
        scope.set_provider_id("uid-1").unwrap();
        let err = scope.set_provider_id("uid-2").unwrap_err();
        assert!(matches!(err, ScopeError::ProviderIdImmutable { .. }));
        assert_eq!(scope.provider_id(), Some("uid-1"));
    }

    #[tokio::test]
    async fn test_readiness_and_failure_fields() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let mut scope = MicrovmScope::open(store, &key).await.unwrap();

        scope.set_not_ready(ConditionReason::ProvisionFailed, Severity::Error, "boom");
        let status = &scope.microvm().status;
        assert!(!status.ready);
        assert_eq!(status.failure_reason.as_deref(), Some("MicrovmProvisionFailed"));
        assert_eq!(status.failure_message.as_deref(), Some("boom"));
        let ready = conditions::get(&status.conditions, MICROVM_READY_CONDITION).unwrap();
        assert_eq!(ready.reason, Some(ConditionReason::ProvisionFailed));

        scope.set_ready();
        let status = &scope.microvm().status;
        assert!(status.ready);
        assert!(status.failure_reason.is_none());
        assert!(status.failure_message.is_none());
    }

    #[tokio::test]
    async fn test_informational_not_ready_clears_failure() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let mut scope = MicrovmScope::open(store, &key).await.unwrap();

        scope.set_not_ready(ConditionReason::DeleteFailed, Severity::Error, "unavailable");
        scope.set_not_ready(ConditionReason::Deleting, Severity::Info, "");

        let status = &scope.microvm().status;
        assert!(status.failure_reason.is_none());
        assert!(status.failure_message.is_none());
        let ready = conditions::get(&status.conditions, MICROVM_READY_CONDITION).unwrap();
        assert_eq!(ready.reason, Some(ConditionReason::Deleting));
    }

    #[tokio::test]
    async fn test_replace_provider_id_after_lost_record() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let mut scope = MicrovmScope::open(Arc::clone(&store), &key).await.unwrap();
        scope.set_provider_id("uid-1").unwrap();
        scope.close().await.unwrap();

        scope.replace_provider_id("uid-2");
        scope.close().await.unwrap();

        let stored = store.get(&key).await.unwrap();
        assert_eq!(stored.status.provider_id.as_deref(), Some("uid-2"));
    }

    #[tokio::test]
    async fn test_replace_provider_id_loses_to_concurrent_change() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let mut scope = MicrovmScope::open(Arc::clone(&store), &key).await.unwrap();
        scope.set_provider_id("uid-1").unwrap();
        scope.close().await.unwrap();

        // Another writer already replaced the lost ID.
        let mut stale = MicrovmScope::open(Arc::clone(&store), &key).await.unwrap();
        stale.replace_provider_id("uid-2");
        scope.replace_provider_id("uid-3");
        stale.close().await.unwrap();

        assert!(scope.close().await.is_err());
        let stored = store.get(&key).await.unwrap();
        assert_eq!(stored.status.provider_id.as_deref(), Some("uid-2"));
    }

    #[tokio::test]
    async fn test_close_keeps_concurrent_changes() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let mut scope = MicrovmScope::open(Arc::clone(&store), &key).await.unwrap();

        // Another writer adds its own finalizer after the scope was opened.
        let other = MicrovmPatch {
            add_finalizers: vec!["other.io/cleanup".to_string()],
            ..MicrovmPatch::default()
        };
        store.patch(&key, &other).await.unwrap();

        scope.set_vm_state(VmState::Pending);
        scope.close().await.unwrap();

        let stored = store.get(&key).await.unwrap();
        assert_eq!(stored.status.vm_state, Some(VmState::Pending));
        assert!(stored.has_finalizer("other.io/cleanup"));
        assert!(scope.microvm().has_finalizer("other.io/cleanup"));
    }

    #[tokio::test]
    async fn test_basic_auth_token() {
        let mut spec = spec("10.0.0.1:9090");
        spec.basic_auth_secret = Some("mvm-auth".to_string());
        let (store, key) = setup(spec).await;

        let scope = MicrovmScope::open(Arc::clone(&store), &key).await.unwrap();
        assert!(matches!(
            scope.basic_auth_token().await.unwrap_err(),
            ScopeError::MissingSecret { .. }
        ));

        store
            .put_secret(Secret::new("default", "mvm-auth").with("token", "s3cr3t"))
            .await
            .unwrap();
        assert_eq!(
            scope.basic_auth_token().await.unwrap().as_deref(),
            Some("s3cr3t")
        );
    }

    #[tokio::test]
    async fn test_partial_tls_material_is_rejected() {
        let mut spec = spec("10.0.0.1:9090");
        spec.tls_secret_ref = Some("mvm-tls".to_string());
        let (store, key) = setup(spec).await;
        store
            .put_secret(
                Secret::new("default", "mvm-tls")
                    .with(TLS_CERT_KEY, "CERT")
                    .with(TLS_KEY_KEY, "KEY"),
            )
            .await
            .unwrap();

        let scope = MicrovmScope::open(Arc::clone(&store), &key).await.unwrap();
        assert!(matches!(
            scope.tls_config().await.unwrap_err(),
            ScopeError::InvalidSecret { .. }
        ));

        store
            .put_secret(
                Secret::new("default", "mvm-tls")
                    .with(TLS_CERT_KEY, "CERT")
                    .with(TLS_KEY_KEY, "KEY")
                    .with(TLS_CA_KEY, "CA"),
            )
            .await
            .unwrap();
        let tls = scope.tls_config().await.unwrap().unwrap();
        assert_eq!(tls.ca_pem, "CA");
    }

    #[tokio::test]
    async fn test_no_secrets_configured() {
        let (store, key) = setup(spec("10.0.0.1:9090")).await;
        let scope = MicrovmScope::open(store, &key).await.unwrap();
        assert!(scope.basic_auth_token().await.unwrap().is_none());
        assert!(scope.tls_config().await.unwrap().is_none());
    }
}
