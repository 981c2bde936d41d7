//! Image resolution against the containerd content store.
//!
//! The debug container needs two things from its image: the image config
//! (env, working dir) for the OCI spec, and the layer chain ID naming the
//! unpacked snapshot the rootfs is prepared from.

use crate::error::{Result, RuntimeError};
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::{GetImageRequest, ReadContentRequest};
use containerd_client::with_namespace;
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use sha2::{Digest, Sha256};
use tonic::transport::Channel;
use tonic::Request;

/// An image resolved far enough to build a debug container from it.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Image name as stored.
    pub name: String,
    /// Parsed image configuration.
    pub config: ImageConfiguration,
    /// Chain ID of the top layer; parent key for snapshot preparation.
    pub chain_id: String,
}

/// Looks up `image` and reads its config through the content store.
///
/// # Errors
///
/// Returns [`RuntimeError::Pull`] when the image or any referenced blob is
/// missing, and [`RuntimeError::Grpc`] on transport failures.
pub async fn resolve(channel: Channel, namespace: &str, image: &str) -> Result<ResolvedImage> {
    let mut images = ImagesClient::new(channel.clone());
    let req = GetImageRequest {
        name: image.to_string(),
    };
    let resp = images
        .get(with_namespace!(req, namespace))
        .await?
        .into_inner();
    let target = resp
        .image
        .and_then(|i| i.target)
        .ok_or_else(|| RuntimeError::Pull {
            image: image.to_string(),
            reason: "image has no target descriptor".to_string(),
        })?;

    let manifest = read_manifest(channel.clone(), namespace, image, &target.digest).await?;
    let config_bytes =
        read_content(channel, namespace, manifest.config().digest().as_ref()).await?;
    let config: ImageConfiguration =
        serde_json::from_slice(&config_bytes).map_err(|e| RuntimeError::Pull {
            image: image.to_string(),
            reason: format!("unreadable image config: {e}"),
        })?;

    let chain_id = chain_id(config.rootfs().diff_ids()).ok_or_else(|| RuntimeError::Pull {
        image: image.to_string(),
        reason: "image has no layers".to_string(),
    })?;

    Ok(ResolvedImage {
        name: image.to_string(),
        config,
        chain_id,
    })
}

/// Reads the manifest for `digest`, descending through an image index to the
/// manifest matching the local platform.
async fn read_manifest(
    channel: Channel,
    namespace: &str,
    image: &str,
    digest: &str,
) -> Result<ImageManifest> {
    let bytes = read_content(channel.clone(), namespace, digest).await?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Pull {
            image: image.to_string(),
            reason: format!("unreadable manifest: {e}"),
        })?;

    if value.get("manifests").is_some() {
        let index: ImageIndex = serde_json::from_value(value).map_err(|e| RuntimeError::Pull {
            image: image.to_string(),
            reason: format!("unreadable image index: {e}"),
        })?;
        let arch = oci_arch();
        let child = index
            .manifests()
            .iter()
            .find(|d| {
                d.platform().as_ref().is_some_and(|p| {
                    p.os().to_string() == "linux" && p.architecture().to_string() == arch
                })
            })
            .ok_or_else(|| RuntimeError::Pull {
                image: image.to_string(),
                reason: format!("no linux/{arch} manifest in index"),
            })?;
        let bytes = read_content(channel, namespace, child.digest().as_ref()).await?;
        return serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Pull {
            image: image.to_string(),
            reason: format!("unreadable platform manifest: {e}"),
        });
    }

    serde_json::from_value(value).map_err(|e| RuntimeError::Pull {
        image: image.to_string(),
        reason: format!("unreadable manifest: {e}"),
    })
}

/// Streams one blob out of the content store.
///
/// # Errors
///
/// Returns [`RuntimeError::Grpc`] on transport failure or a missing blob.
pub async fn read_content(channel: Channel, namespace: &str, digest: &str) -> Result<Vec<u8>> {
    let mut content = ContentClient::new(channel);
    let req = ReadContentRequest {
        digest: digest.to_string(),
        offset: 0,
        size: 0,
    };
    let mut stream = content
        .read(with_namespace!(req, namespace))
        .await?
        .into_inner();

    let mut data = Vec::new();
    while let Some(chunk) = stream.message().await? {
        data.extend_from_slice(&chunk.data);
    }
    Ok(data)
}

/// Computes the OCI chain ID of the top layer from the config's diff IDs.
///
/// `chain(L0) = diff(L0)`; `chain(Ln) = sha256(chain(Ln-1) + " " + diff(Ln))`.
#[must_use]
pub fn chain_id(diff_ids: &[String]) -> Option<String> {
    let mut ids = diff_ids.iter();
    let mut chain = ids.next()?.clone();
    for diff in ids {
        let digest = Sha256::digest(format!("{chain} {diff}").as_bytes());
        chain = format!("sha256:{digest:x}");
    }
    Some(chain)
}

/// Local architecture in OCI notation.
#[must_use]
pub fn oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_single_layer_is_diff_id() {
        let diff = "sha256:c6f988f4874bb0add23a778f753c65efe992244e148a1d2ec2a8b664fb66bbd1";
        assert_eq!(chain_id(&[diff.to_string()]).unwrap(), diff);
    }

    #[test]
    fn test_chain_id_is_deterministic_and_distinct() {
        let layers = vec![
            "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
        ];
        let first = chain_id(&layers).unwrap();
        let second = chain_id(&layers).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("sha256:"));
        assert_eq!(first.len(), "sha256:".len() + 64);
        // Order matters.
        let swapped = chain_id(&[layers[1].clone(), layers[0].clone()]).unwrap();
        assert_ne!(first, swapped);
    }

    #[test]
    fn test_chain_id_empty() {
        assert!(chain_id(&[]).is_none());
    }

    #[test]
    fn test_oci_arch_known() {
        assert!(["amd64", "arm64"].contains(&oci_arch()) || !oci_arch().is_empty());
    }
}
