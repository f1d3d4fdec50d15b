//! The Microvm resource.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conditions::Condition;

/// Finalizer token that blocks physical removal until the remote microvm is gone.
pub const MICROVM_FINALIZER: &str = "microvm.infrastructure.liquid-metal.io";

/// Identity of a resource in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Store-managed metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,

    /// Store-assigned unique ID.
    #[serde(default)]
    pub uid: String,

    /// Incremented by the store whenever the spec changes.
    #[serde(default)]
    pub generation: i64,

    /// Incremented by the store on every write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set when deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Desired-state record for one microvm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Microvm {
    pub metadata: ObjectMeta,
    pub spec: MicrovmSpec,
    #[serde(default)]
    pub status: MicrovmStatus,
}

impl Microvm {
    /// Create a resource with the given identity and spec.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: MicrovmSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: namespace.into(),
                name: name.into(),
                ..ObjectMeta::default()
            },
            spec,
            status: MicrovmStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Returns true once deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add a finalizer. Returns true if it was not present before.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove a finalizer. Returns true if it was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != finalizer);
        before != self.metadata.finalizers.len()
    }
}

/// Desired microvm configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmSpec {
    /// Host running the lifecycle service for this microvm.
    #[serde(default)]
    pub host: HostSpec,

    /// Name of a secret (same namespace) holding a `token` for basic auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth_secret: Option<String>,

    /// Name of a secret (same namespace) holding `tls.crt`, `tls.key` and `ca.crt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_ref: Option<String>,

    /// Proxy used to reach the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microvm_proxy: Option<MicrovmProxy>,

    pub vcpu: u32,
    pub memory_mib: u32,

    pub kernel: ContainerFileSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<ContainerFileSource>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kernel_cmdline: BTreeMap<String, String>,

    pub root_volume: Volume,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_keys: Vec<SshPublicKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// `host:port` of the lifecycle service. Empty means "not scheduled yet".
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmProxy {
    pub endpoint: String,
}

/// A file shipped inside a container image (kernel, initrd).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFileSource {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfaceType {
    #[default]
    Macvtap,
    Tap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub guest_device_name: String,
    #[serde(default, rename = "type")]
    pub iface_type: IfaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    /// Static address in CIDR form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshPublicKey {
    pub user: String,
    #[serde(default)]
    pub authorized_keys: Vec<String>,
}

/// Local lifecycle phase of a microvm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Pending,
    Running,
    Failed,
    Unknown,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Pending => write!(f, "pending"),
            VmState::Running => write!(f, "running"),
            VmState::Failed => write!(f, "failed"),
            VmState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Observed state, written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmStatus {
    /// Remote UID of the provisioned microvm. Immutable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_state: Option<VmState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec the status was last computed from.
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}
