//! Image pull through the containerd transfer service.
//!
//! The daemon does the fetching; the agent only describes the source
//! registry and the destination image store. Credentials ride as a
//! pre-computed basic `Authorization` header on the registry resolver.
//! Skipping TLS verification uses a transient hosts dir with
//! `skip_verify = true`, which is available to us because the agent runs on
//! the node itself.

use crate::error::{Result, RuntimeError};
use crate::RunOpts;
use base64::Engine;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{GetImageRequest, TransferOptions, TransferRequest};
use containerd_client::types::transfer::{
    ImageStore, OciRegistry, RegistryResolver, UnpackConfiguration,
};
use containerd_client::types::Platform;
use containerd_client::with_namespace;
use prost::Message;
use std::collections::HashMap;
use std::path::PathBuf;
use tonic::transport::Channel;
use tonic::{Code, Request};
use tracing::debug;
use uuid::Uuid;

use super::image::oci_arch;

const OCI_REGISTRY_TYPE_URL: &str = "types.containerd.io/containerd.types.transfer.OCIRegistry";
const IMAGE_STORE_TYPE_URL: &str = "types.containerd.io/containerd.types.transfer.ImageStore";

/// Checks whether the image is already present in the namespace.
///
/// # Errors
///
/// Returns [`RuntimeError::Grpc`] on transport failures; NotFound maps to
/// `Ok(false)`.
pub async fn image_exists(channel: Channel, namespace: &str, image: &str) -> Result<bool> {
    let mut images = ImagesClient::new(channel);
    let req = GetImageRequest {
        name: image.to_string(),
    };
    match images.get(with_namespace!(req, namespace)).await {
        Ok(resp) => Ok(resp.into_inner().image.is_some()),
        Err(status) if status.code() == Code::NotFound => Ok(false),
        Err(status) => Err(status.into()),
    }
}

/// Pulls and unpacks `opts.image` into the namespace's image store.
///
/// # Errors
///
/// Returns [`RuntimeError::Pull`] when the transfer fails.
pub async fn transfer_pull(
    channel: Channel,
    namespace: &str,
    snapshotter: &str,
    opts: &RunOpts,
) -> Result<()> {
    // Keep the hosts dir alive until the transfer returns.
    let _hosts_dir;
    let mut resolver = RegistryResolver::default();
    if let Some(auth) = &opts.auth {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", auth.username, auth.password));
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Basic {token}"));
        resolver.headers = headers;
        debug!(username = %auth.username, "using registry credentials for pull");
    }
    if opts.registry_skip_tls {
        let hosts = HostsDir::write(&registry_host(&opts.image))?;
        resolver.host_dir = hosts.path().display().to_string();
        _hosts_dir = hosts;
    }

    let source = OciRegistry {
        reference: opts.image.clone(),
        resolver: Some(resolver),
    };
    let destination = ImageStore {
        name: opts.image.clone(),
        unpacks: vec![UnpackConfiguration {
            platform: Some(Platform {
                os: "linux".to_string(),
                architecture: oci_arch().to_string(),
                ..Platform::default()
            }),
            snapshotter: snapshotter.to_string(),
        }],
        ..ImageStore::default()
    };

    let req = TransferRequest {
        source: Some(to_any(OCI_REGISTRY_TYPE_URL, &source)),
        destination: Some(to_any(IMAGE_STORE_TYPE_URL, &destination)),
        options: Some(TransferOptions::default()),
    };

    let mut transfer = TransferClient::new(channel);
    transfer
        .transfer(with_namespace!(req, namespace))
        .await
        .map_err(|status| RuntimeError::Pull {
            image: opts.image.clone(),
            reason: status.message().to_string(),
        })?;
    Ok(())
}

fn to_any<M: Message>(type_url: &str, message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

/// Registry host component of an image reference.
#[must_use]
pub fn registry_host(image: &str) -> String {
    let first = image.split('/').next().unwrap_or_default();
    if first.contains('.') || first.contains(':') || first == "localhost" {
        first.to_string()
    } else {
        "docker.io".to_string()
    }
}

/// Transient hosts configuration directory enabling `skip_verify` for one
/// registry. Removed on drop.
#[derive(Debug)]
pub struct HostsDir {
    path: PathBuf,
}

impl HostsDir {
    /// Writes `<dir>/<host>/hosts.toml` with TLS verification disabled.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory or file cannot be written.
    pub fn write(host: &str) -> Result<Self> {
        let path = std::env::temp_dir()
            .join("kctldbg-hosts")
            .join(Uuid::new_v4().to_string());
        let host_dir = path.join(host);
        std::fs::create_dir_all(&host_dir)?;
        let body = format!(
            "server = \"https://{host}\"\n\n[host.\"https://{host}\"]\n  skip_verify = true\n"
        );
        std::fs::write(host_dir.join("hosts.toml"), body)?;
        Ok(Self { path })
    }

    /// Directory to hand to the registry resolver.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for HostsDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
