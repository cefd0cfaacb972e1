//! OCI registry client.
//!
//! Pulls images from container registries into on-disk OCI layouts and
//! pushes assembled layouts back. Built on the `oci-distribution` crate;
//! authentication is per-registry basic auth or anonymous.

use std::path::Path;

use kiln_core::error::{KilnError, Result};
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::Reference;

use crate::blob::{oci_blob_path, sha256_bytes};
use super::reference::ImageReference;

pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Authentication credentials for a registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous access.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Credentials from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`,
    /// anonymous when unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Registry client for pulling and pushing OCI layouts.
pub struct RegistryClient {
    client: tokio::sync::Mutex<Client>,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: tokio::sync::Mutex::new(Client::new(config)),
            auth,
        }
    }

    /// Pull `reference` and write it as an OCI layout under `target_dir`.
    /// Returns the manifest digest.
    pub async fn pull(&self, reference: &ImageReference, target_dir: &Path) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        tracing::info!(reference = %reference, "pulling image");

        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir)
            .map_err(|e| registry_err(reference, "create layout", e))?;

        let (manifest, manifest_digest) = self
            .client
            .lock()
            .await
            .pull_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| registry_err(reference, "pull manifest", e))?;

        let image_manifest = match manifest {
            OciManifest::Image(m) => m,
            OciManifest::ImageIndex(_) => {
                return Err(KilnError::Runtime(format!(
                    "'{}' resolves to an image index; only single-platform manifests are supported",
                    reference
                )));
            }
        };

        let manifest_json = serde_json::to_vec(&image_manifest)?;
        write_blob(&blobs_dir, &manifest_digest, &manifest_json)
            .map_err(|e| registry_err(reference, "write manifest", e))?;

        // Config, then each layer.
        let mut config_data = Vec::new();
        self.client
            .lock()
            .await
            .pull_blob(&oci_ref, &image_manifest.config.digest, &mut config_data)
            .await
            .map_err(|e| registry_err(reference, "pull config", e))?;
        write_blob(&blobs_dir, &image_manifest.config.digest, &config_data)
            .map_err(|e| registry_err(reference, "write config", e))?;

        for layer in &image_manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "pulling layer");
            let mut layer_data = Vec::new();
            self.client
                .lock()
                .await
                .pull_blob(&oci_ref, &layer.digest, &mut layer_data)
                .await
                .map_err(|e| registry_err(reference, "pull layer", e))?;
            write_blob(&blobs_dir, &layer.digest, &layer_data)
                .map_err(|e| registry_err(reference, "write layer", e))?;
        }

        write_layout_markers(target_dir, &manifest_digest, manifest_json.len())
            .map_err(|e| registry_err(reference, "write layout", e))?;

        tracing::info!(reference = %reference, digest = %manifest_digest, "image pulled");
        Ok(manifest_digest)
    }

    /// Push an on-disk OCI layout to `reference`. Returns the manifest
    /// digest.
    ///
    /// All blobs are uploaded before the manifest itself, so a tag never
    /// points at a half-written image.
    pub async fn push_layout(&self, reference: &ImageReference, layout_dir: &Path) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        let LoadedLayout {
            manifest,
            config_data,
            layer_data,
        } = read_layout(layout_dir)?;

        tracing::info!(reference = %reference, layers = layer_data.len(), "pushing image");

        let config = Config {
            data: config_data,
            media_type: manifest.config.media_type.clone(),
            annotations: None,
        };
        let layers: Vec<ImageLayer> = manifest
            .layers
            .iter()
            .zip(layer_data)
            .map(|(descriptor, data)| ImageLayer {
                data,
                media_type: descriptor.media_type.clone(),
                annotations: None,
            })
            .collect();

        let manifest_json = serde_json::to_vec(&manifest)?;
        let digest = format!("sha256:{}", sha256_bytes(&manifest_json));

        self.client
            .lock()
            .await
            .push(&oci_ref, &layers, config, &auth, Some(manifest))
            .await
            .map_err(|e| registry_err(reference, "push", e))?;

        tracing::info!(reference = %reference, digest = %digest, "image pushed");
        Ok(digest)
    }
}

struct LoadedLayout {
    manifest: OciImageManifest,
    config_data: Vec<u8>,
    layer_data: Vec<Vec<u8>>,
}

/// Read the single manifest, config, and layer blobs of a layout.
fn read_layout(layout_dir: &Path) -> Result<LoadedLayout> {
    let index_data = std::fs::read_to_string(layout_dir.join("index.json"))
        .map_err(|e| KilnError::BadOciLayout(format!("{}: {}", layout_dir.display(), e)))?;
    let index: serde_json::Value = serde_json::from_str(&index_data)?;
    let manifest_digest = index["manifests"][0]["digest"]
        .as_str()
        .ok_or_else(|| {
            KilnError::BadOciLayout(format!("no manifests in {}/index.json", layout_dir.display()))
        })?
        .to_string();

    let manifest_data = std::fs::read(oci_blob_path(layout_dir, &manifest_digest))
        .map_err(|e| KilnError::BadOciLayout(format!("missing manifest blob: {}", e)))?;
    let manifest: OciImageManifest = serde_json::from_slice(&manifest_data)?;

    let config_data = std::fs::read(oci_blob_path(layout_dir, &manifest.config.digest))
        .map_err(|e| KilnError::BadOciLayout(format!("missing config blob: {}", e)))?;

    let mut layer_data = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let data = std::fs::read(oci_blob_path(layout_dir, &layer.digest))
            .map_err(|e| KilnError::BadOciLayout(format!("missing layer {}: {}", layer.digest, e)))?;
        layer_data.push(data);
    }

    Ok(LoadedLayout {
        manifest,
        config_data,
        layer_data,
    })
}

/// Build an image manifest from raw config and layer blobs.
pub fn build_manifest(config_data: &[u8], layers: &[(String, u64)]) -> OciImageManifest {
    OciImageManifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
        config: OciDescriptor {
            media_type: MEDIA_TYPE_CONFIG.to_string(),
            digest: format!("sha256:{}", sha256_bytes(config_data)),
            size: config_data.len() as i64,
            ..Default::default()
        },
        layers: layers
            .iter()
            .map(|(digest, size)| OciDescriptor {
                media_type: MEDIA_TYPE_LAYER_TAR.to_string(),
                digest: digest.clone(),
                size: *size as i64,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn write_blob(blobs_dir: &Path, digest: &str, data: &[u8]) -> std::io::Result<()> {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    std::fs::write(blobs_dir.join(hex), data)
}

/// Write `oci-layout` and `index.json` for a layout holding one manifest.
pub fn write_layout_markers(
    target_dir: &Path,
    manifest_digest: &str,
    manifest_size: usize,
) -> std::io::Result<()> {
    std::fs::write(
        target_dir.join("oci-layout"),
        r#"{"imageLayoutVersion":"1.0.0"}"#,
    )?;
    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [{
            "mediaType": MEDIA_TYPE_MANIFEST,
            "digest": manifest_digest,
            "size": manifest_size
        }]
    });
    std::fs::write(
        target_dir.join("index.json"),
        serde_json::to_string_pretty(&index)?,
    )
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    reference
        .full_reference()
        .parse::<Reference>()
        .map_err(|e| KilnError::Config(format!("invalid OCI reference '{}': {}", reference, e)))
}

fn registry_err(reference: &ImageReference, op: &str, err: impl std::fmt::Display) -> KilnError {
    KilnError::Runtime(format!("{} failed for '{}': {}", op, reference, err))
}
