//! Per-pass microvm service.
//!
//! Binds a lifecycle client to the resource being reconciled: lookups use the
//! provider ID when one is recorded and fall back to the resource name, and
//! create requests are built from the resource spec.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use tracing::debug;

use crate::api::{IfaceType, Microvm, Volume};
use crate::remote::{
    CreateRequest, ImageFile, InterfaceSpec, KernelSpec, MicrovmClient, RemoteError,
    RemoteRecord, VolumeSpec,
};
use crate::scope::MicrovmScope;

/// Cloud-init metadata keys sent with a create request.
pub const META_DATA_KEY: &str = "meta-data";
pub const USER_DATA_KEY: &str = "user-data";

pub struct MicrovmService {
    client: Box<dyn MicrovmClient>,
}

impl MicrovmService {
    pub fn new(client: Box<dyn MicrovmClient>) -> Self {
        Self { client }
    }

    /// Fetch the remote record for the scope's resource.
    ///
    /// A missing record is `Ok(None)`.
    pub async fn get(&self, scope: &MicrovmScope) -> Result<Option<RemoteRecord>, RemoteError> {
        let id = remote_id(scope);
        match self.client.get(id).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => {
                debug!(parent: scope.span(), id, "Remote microvm not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Create the remote microvm from the resource spec.
    pub async fn create(&self, scope: &MicrovmScope) -> Result<RemoteRecord, RemoteError> {
        let request = build_create_request(scope.microvm())?;
        self.client.create(&request).await
    }

    /// Start deleting the remote microvm.
    pub async fn delete(&self, scope: &MicrovmScope) -> Result<(), RemoteError> {
        self.client.delete(remote_id(scope)).await
    }

    pub async fn close(self) {
        self.client.close().await;
    }
}

fn remote_id(scope: &MicrovmScope) -> &str {
    scope.provider_id().unwrap_or_else(|| scope.name())
}

/// Build the create request for a resource.
pub fn build_create_request(microvm: &Microvm) -> Result<CreateRequest, RemoteError> {
    let spec = &microvm.spec;

    let interfaces = spec
        .network_interfaces
        .iter()
        .map(|iface| InterfaceSpec {
            device_id: iface.guest_device_name.clone(),
            iface_type: match iface.iface_type {
                IfaceType::Macvtap => "macvtap".to_string(),
                IfaceType::Tap => "tap".to_string(),
            },
            guest_mac: iface.guest_mac.clone(),
            address: iface.address.clone(),
        })
        .collect();

    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert(META_DATA_KEY.to_string(), STANDARD.encode(meta_data(microvm)?));
    metadata.insert(USER_DATA_KEY.to_string(), STANDARD.encode(user_data(microvm)?));

    Ok(CreateRequest {
        id: microvm.metadata.name.clone(),
        namespace: microvm.metadata.namespace.clone(),
        labels: microvm.metadata.labels.clone(),
        vcpu: spec.vcpu,
        memory_in_mb: spec.memory_mib,
        kernel: KernelSpec {
            image: spec.kernel.image.clone(),
            filename: spec.kernel.filename.clone(),
            cmdline: spec.kernel_cmdline.clone(),
        },
        initrd: spec.initrd.as_ref().map(|initrd| ImageFile {
            image: initrd.image.clone(),
            filename: initrd.filename.clone(),
        }),
        root_volume: volume_spec(&spec.root_volume),
        additional_volumes: spec.additional_volumes.iter().map(volume_spec).collect(),
        interfaces,
        metadata,
    })
}

fn volume_spec(volume: &Volume) -> VolumeSpec {
    VolumeSpec {
        id: volume.id.clone(),
        image: volume.image.clone(),
        is_read_only: volume.read_only,
        mount_point: volume.mount_point.clone(),
    }
}

fn meta_data(microvm: &Microvm) -> Result<String, RemoteError> {
    let doc = json!({
        "instance-id": format!("{}/{}", microvm.metadata.namespace, microvm.metadata.name),
        "local-hostname": microvm.metadata.name,
        "platform": "liquid_metal",
    });
    Ok(serde_json::to_string(&doc)?)
}

fn user_data(microvm: &Microvm) -> Result<String, RemoteError> {
    let users: Vec<_> = microvm
        .spec
        .ssh_public_keys
        .iter()
        .map(|key| {
            json!({
                "name": key.user,
                "ssh_authorized_keys": key.authorized_keys,
            })
        })
        .collect();

    let doc = json!({
        "hostname": microvm.metadata.name,
        "users": users,
    });
    Ok(format!("#cloud-config\n{}", serde_json::to_string(&doc)?))
}
