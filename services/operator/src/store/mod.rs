//! Desired-state store.
//!
//! The reconciler only needs three calls from the store: `get`, `patch` and
//! `get_secret`. The remaining calls are used by external actors (users,
//! tests, the controller runner) to create, delete, list and watch resources.
//!
//! Deletion semantics follow the finalizer model:
//! - `delete` on a resource with finalizers only sets the deletion marker
//! - a deletion-marked resource is physically removed by the `patch` that
//!   empties its finalizer set

mod patch;
mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::api::{Microvm, ObjectKey};

pub use patch::{MicrovmPatch, StatusPatch};
pub use sqlite::SqliteStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed.
    #[error("conflict on {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Credentials and other opaque material referenced by a resource spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Change notification emitted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The resource was created or modified.
    Applied(ObjectKey),
    /// The resource was physically removed.
    Deleted(ObjectKey),
}

impl WatchEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            WatchEvent::Applied(key) | WatchEvent::Deleted(key) => key,
        }
    }
}

/// Desired-state repository for Microvm resources.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a resource by identity.
    async fn get(&self, key: &ObjectKey) -> Result<Microvm, StoreError>;

    /// Merge `patch` into the stored resource.
    ///
    /// Returns the resource as stored after the patch, or `None` if the patch
    /// released the last finalizer of a deletion-marked resource and it was
    /// physically removed.
    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &MicrovmPatch,
    ) -> Result<Option<Microvm>, StoreError>;

    /// Read a secret by namespace and name.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError>;

    /// Create a resource, or replace the spec and labels of an existing one.
    async fn apply(&self, microvm: Microvm) -> Result<Microvm, StoreError>;

    /// Request deletion of a resource.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// List all resource identities.
    async fn list(&self) -> Result<Vec<ObjectKey>, StoreError>;

    /// Create or replace a secret.
    async fn put_secret(&self, secret: Secret) -> Result<(), StoreError>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
