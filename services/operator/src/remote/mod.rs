//! Remote lifecycle service client.
//!
//! The reconciler talks to the service that actually provisions microvms
//! through four calls: `get`, `create`, `delete` and `close`. A "not found"
//! answer is a typed error variant so callers never match on error text.
//!
//! - `http`: JSON over HTTP(S) implementation
//! - `mock`: in-memory implementation for tests and local development

pub mod http;
pub mod mock;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpClientFactory, HttpMicrovmClient};
pub use mock::{MockClientFactory, MockMicrovmClient, RemoteCall};

/// Errors from the remote lifecycle service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The requested microvm does not exist.
    #[error("microvm not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Client options could not be turned into a working client.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// Lifecycle state reported by the remote service.
///
/// Unrecognized values are kept verbatim in `Other` rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteState {
    Pending,
    Created,
    Failed,
    Deleting,
    Other(String),
}

impl RemoteState {
    pub fn as_str(&self) -> &str {
        match self {
            RemoteState::Pending => "PENDING",
            RemoteState::Created => "CREATED",
            RemoteState::Failed => "FAILED",
            RemoteState::Deleting => "DELETING",
            RemoteState::Other(s) => s,
        }
    }
}

impl From<String> for RemoteState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PENDING" => RemoteState::Pending,
            "CREATED" => RemoteState::Created,
            "FAILED" => RemoteState::Failed,
            "DELETING" => RemoteState::Deleting,
            _ => RemoteState::Other(s),
        }
    }
}

impl From<RemoteState> for String {
    fn from(state: RemoteState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The remote service's view of a microvm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub uid: String,
    pub state: RemoteState,
    /// Echo of the spec the microvm was created with.
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Request body for creating a microvm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub id: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub vcpu: u32,
    pub memory_in_mb: u32,
    pub kernel: KernelSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<ImageFile>,
    pub root_volume: VolumeSpec,
    #[serde(default)]
    pub additional_volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
    /// Cloud-init documents, base64 encoded.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub cmdline: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageFile {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub id: String,
    pub image: String,
    pub is_read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub device_id: String,
    #[serde(rename = "type")]
    pub iface_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Client-side TLS material (PEM encoded).
#[derive(Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("cert_pem", &"<redacted>")
            .field("key_pem", &"<redacted>")
            .field("ca_pem", &"<redacted>")
            .finish()
    }
}

/// Connection options for a lifecycle client.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub proxy: Option<String>,
    pub basic_auth_token: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("proxy", &self.proxy)
            .field(
                "basic_auth_token",
                &self.basic_auth_token.as_ref().map(|_| "<redacted>"),
            )
            .field("tls", &self.tls)
            .finish()
    }
}

/// Remote lifecycle API.
#[async_trait]
pub trait MicrovmClient: Send + Sync {
    /// Fetch a microvm by UID or name. Absence is `RemoteError::NotFound`.
    async fn get(&self, id: &str) -> Result<RemoteRecord, RemoteError>;

    /// Create a microvm.
    async fn create(&self, request: &CreateRequest) -> Result<RemoteRecord, RemoteError>;

    /// Start deleting a microvm. Deletion completes asynchronously.
    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    /// Release the connection.
    async fn close(&self);
}

/// Builds a client for one host endpoint.
pub trait ClientFactory: Send + Sync {
    fn connect(
        &self,
        endpoint: &str,
        options: ClientOptions,
    ) -> Result<Box<dyn MicrovmClient>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_state_known_values() {
        for state in [
            RemoteState::Pending,
            RemoteState::Created,
            RemoteState::Failed,
            RemoteState::Deleting,
        ] {
            let json = serde_json::to_value(&state).unwrap();
            let parsed: RemoteState = serde_json::from_value(json).unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_remote_state_keeps_unknown_value() {
        let record: RemoteRecord =
            serde_json::from_str(r#"{"uid": "uid-1", "state": "HIBERNATING"}"#).unwrap();
        assert_eq!(record.state, RemoteState::Other("HIBERNATING".to_string()));
        assert_eq!(record.state.to_string(), "HIBERNATING");
        assert!(record.spec.is_null());
    }

    #[test]
    fn test_client_options_debug_redacts_secrets() {
        let options = ClientOptions {
            proxy: Some("http://proxy:3128".to_string()),
            basic_auth_token: Some("s3cr3t".to_string()),
            tls: Some(TlsConfig {
                cert_pem: "CERT".to_string(),
                key_pem: "KEY".to_string(),
                ca_pem: "CA".to_string(),
            }),
        };

        let debug = format!("{options:?}");
        assert!(debug.contains("proxy:3128"));
        assert!(!debug.contains("s3cr3t"));
        assert!(!debug.contains("KEY"));
    }
}
