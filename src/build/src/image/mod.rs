//! Image handles and storage.
//!
//! An [`Image`] is a mutable, in-memory view of a container image:
//! labels, env, config fields, and an ordered layer list. It is backed by
//! nothing until saved: `save` commits an OCI layout into the local
//! [`ImageStore`], `push` uploads it to a registry. The two destinations
//! share one assembly path, so a saved and a pushed image are
//! byte-identical apart from transport.

pub mod fetch;
pub mod reference;
pub mod registry;
pub mod store;

pub use self::fetch::ImageFetcher;
pub use self::reference::ImageReference;
pub use self::registry::{RegistryAuth, RegistryClient};
pub use self::store::{ImageStore, StoredImage};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_core::error::{KilnError, Result};
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use tempfile::TempDir;

use crate::blob::{oci_blob_path, sha256_bytes, sha256_file};

/// Fixed `created` timestamp for assembled image configs, so composing
/// the same inputs twice yields the same image id.
pub const CREATED_AT: &str = "1980-01-01T00:00:01Z";

/// When an image is fetched versus reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Fetch from the registry before every use
    Always,
    /// Fetch only when absent locally
    #[default]
    IfNotPresent,
    /// Never fetch; fail when absent locally
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "if-not-present" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            other => Err(KilnError::Config(format!(
                "invalid pull policy '{}' (expected always, if-not-present, or never)",
                other
            ))),
        }
    }
}

/// One layer of an image: an uncompressed tar blob on disk.
#[derive(Debug, Clone)]
struct Layer {
    path: PathBuf,
    diff_id: String,
    size: u64,
}

/// Mutable image handle.
#[derive(Debug, Clone)]
pub struct Image {
    reference: ImageReference,
    os: String,
    architecture: String,
    labels: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    workdir: Option<String>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    layers: Vec<Layer>,
}

impl Image {
    /// A new empty image.
    pub fn new(reference: ImageReference) -> Self {
        Self {
            reference,
            os: "linux".to_string(),
            architecture: default_architecture().to_string(),
            labels: BTreeMap::new(),
            env: BTreeMap::new(),
            workdir: None,
            entrypoint: None,
            cmd: None,
            layers: Vec::new(),
        }
    }

    /// Load an image handle from an OCI layout on disk.
    pub fn from_layout(reference: ImageReference, layout_dir: &Path) -> Result<Self> {
        crate::blob::validate_oci_layout(layout_dir)?;

        let index: ImageIndex = read_json(&layout_dir.join("index.json"))?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| {
                KilnError::BadOciLayout(format!("no manifests in {}", layout_dir.display()))
            })?
            .digest()
            .to_string();

        let manifest: ImageManifest =
            read_json(&oci_blob_path(layout_dir, &manifest_digest))?;
        let config: ImageConfiguration =
            read_json(&oci_blob_path(layout_dir, manifest.config().digest()))?;

        let diff_ids = config.rootfs().diff_ids().clone();
        if diff_ids.len() != manifest.layers().len() {
            return Err(KilnError::BadOciLayout(format!(
                "{}: {} diff ids but {} layers",
                layout_dir.display(),
                diff_ids.len(),
                manifest.layers().len()
            )));
        }

        let layers = manifest
            .layers()
            .iter()
            .zip(diff_ids)
            .map(|(descriptor, diff_id)| Layer {
                path: oci_blob_path(layout_dir, descriptor.digest()),
                diff_id,
                size: descriptor.size() as u64,
            })
            .collect();

        let inner = config.config().as_ref();
        let labels = inner
            .and_then(|c| c.labels().clone())
            .unwrap_or_default()
            .into_iter()
            .collect();
        let env = inner
            .and_then(|c| c.env().clone())
            .unwrap_or_default()
            .iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            reference,
            os: config.os().to_string(),
            architecture: config.architecture().to_string(),
            labels,
            env,
            workdir: inner.and_then(|c| c.working_dir().clone()),
            entrypoint: inner.and_then(|c| c.entrypoint().clone()),
            cmd: inner.and_then(|c| c.cmd().clone()),
            layers,
        })
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: ImageReference) {
        self.reference = reference;
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn set_os(&mut self, os: impl Into<String>) {
        self.os = os.into();
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn set_workdir(&mut self, workdir: impl Into<String>) {
        self.workdir = Some(workdir.into());
    }

    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) {
        self.entrypoint = Some(entrypoint);
    }

    pub fn set_cmd(&mut self, cmd: Vec<String>) {
        self.cmd = Some(cmd);
    }

    /// DiffIDs of all layers, bottom to top.
    pub fn diff_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.diff_id.clone()).collect()
    }

    /// DiffID of the topmost layer.
    pub fn top_layer_diff_id(&self) -> Option<&str> {
        self.layers.last().map(|l| l.diff_id.as_str())
    }

    /// Append a layer from an uncompressed tar file. Returns its DiffID.
    pub fn append_layer(&mut self, tar_path: &Path) -> Result<String> {
        let diff_id = format!("sha256:{}", sha256_file(tar_path)?);
        let size = std::fs::metadata(tar_path)
            .map_err(|e| {
                KilnError::Runtime(format!("failed to stat layer {}: {}", tar_path.display(), e))
            })?
            .len();
        self.layers.push(Layer {
            path: tar_path.to_path_buf(),
            diff_id: diff_id.clone(),
            size,
        });
        Ok(diff_id)
    }

    /// Replace this image's base-layer chain with `new_base`'s.
    ///
    /// Every layer of `old_base` up to and including its top layer is
    /// swapped for `new_base`'s layers; app and buildpack layers above are
    /// preserved. Fails when `old_base`'s top layer is not part of this
    /// image's ancestry.
    pub fn rebase(&mut self, old_base: &Image, new_base: &Image) -> Result<()> {
        let old_top = old_base.top_layer_diff_id().ok_or_else(|| {
            KilnError::Runtime(format!(
                "cannot rebase: old base '{}' has no layers",
                old_base.reference()
            ))
        })?;

        let position = self
            .layers
            .iter()
            .position(|l| l.diff_id == old_top)
            .ok_or_else(|| {
                KilnError::Runtime(format!(
                    "cannot rebase '{}': top layer of '{}' is not in its ancestry",
                    self.reference(),
                    old_base.reference()
                ))
            })?;

        let preserved: Vec<Layer> = self.layers.split_off(position + 1);
        self.layers = new_base.layers.clone();
        self.layers.extend(preserved);
        self.os = new_base.os.clone();
        Ok(())
    }

    /// Assemble the image as an OCI layout under `target_dir`.
    /// Returns the manifest digest.
    pub fn write_layout(&self, target_dir: &Path) -> Result<String> {
        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            KilnError::Runtime(format!(
                "failed to create layout {}: {}",
                target_dir.display(),
                e
            ))
        })?;

        let mut layer_descriptors = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let hex = layer.diff_id.trim_start_matches("sha256:");
            let blob_path = blobs_dir.join(hex);
            if !blob_path.exists() {
                std::fs::copy(&layer.path, &blob_path).map_err(|e| {
                    KilnError::Runtime(format!("failed to copy layer {}: {}", layer.diff_id, e))
                })?;
            }
            layer_descriptors.push((layer.diff_id.clone(), layer.size));
        }

        let config_bytes = serde_json::to_vec_pretty(&self.build_config_json())?;
        let config_digest = sha256_bytes(&config_bytes);
        std::fs::write(blobs_dir.join(&config_digest), &config_bytes)
            .map_err(|e| KilnError::Runtime(format!("failed to write config blob: {}", e)))?;

        let manifest = registry::build_manifest(&config_bytes, &layer_descriptors);
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        let manifest_digest = format!("sha256:{}", sha256_bytes(&manifest_bytes));
        std::fs::write(
            blobs_dir.join(manifest_digest.trim_start_matches("sha256:")),
            &manifest_bytes,
        )
        .map_err(|e| KilnError::Runtime(format!("failed to write manifest blob: {}", e)))?;

        registry::write_layout_markers(target_dir, &manifest_digest, manifest_bytes.len())
            .map_err(|e| KilnError::Runtime(format!("failed to write layout markers: {}", e)))?;

        Ok(manifest_digest)
    }

    /// Save into the local store under this image's reference.
    pub async fn save(&self, store: &ImageStore) -> Result<StoredImage> {
        let staging = TempDir::new()
            .map_err(|e| KilnError::Runtime(format!("failed to create staging dir: {}", e)))?;
        let digest = self.write_layout(staging.path())?;
        store
            .put(&self.reference.full_reference(), &digest, staging.path())
            .await
    }

    /// Push to a registry under this image's reference.
    pub async fn push(&self, client: &RegistryClient) -> Result<String> {
        let staging = TempDir::new()
            .map_err(|e| KilnError::Runtime(format!("failed to create staging dir: {}", e)))?;
        self.write_layout(staging.path())?;
        client.push_layout(&self.reference, staging.path()).await
    }

    fn build_config_json(&self) -> serde_json::Value {
        let env_list: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut config = serde_json::Map::new();
        if !env_list.is_empty() {
            config.insert("Env".to_string(), serde_json::json!(env_list));
        }
        if !self.labels.is_empty() {
            config.insert("Labels".to_string(), serde_json::json!(self.labels));
        }
        if let Some(workdir) = &self.workdir {
            config.insert("WorkingDir".to_string(), serde_json::json!(workdir));
        }
        if let Some(entrypoint) = &self.entrypoint {
            config.insert("Entrypoint".to_string(), serde_json::json!(entrypoint));
        }
        if let Some(cmd) = &self.cmd {
            config.insert("Cmd".to_string(), serde_json::json!(cmd));
        }

        serde_json::json!({
            "architecture": self.architecture,
            "os": self.os,
            "created": CREATED_AT,
            "config": config,
            "rootfs": {
                "type": "layers",
                "diff_ids": self.diff_ids(),
            },
        })
    }
}

fn default_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| KilnError::BadOciLayout(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&data)
        .map_err(|e| KilnError::BadOciLayout(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{write_file_layer, LayerTar};

    fn test_ref(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    fn layer_with(content: &str, dir: &Path) -> LayerTar {
        write_file_layer(
            content.as_bytes(),
            Path::new("content.txt"),
            &dir.join(format!("{}.tar", sha256_bytes(content.as_bytes()))),
        )
        .unwrap()
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!(
            "if-not-present".parse::<PullPolicy>().unwrap(),
            PullPolicy::IfNotPresent
        );
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }

    #[test]
    fn test_labels_env_and_config_fields() {
        let mut image = Image::new(test_ref("example/builder:test"));
        image.set_label("io.buildpacks.stack.id", "test.stack");
        image.set_env("CNB_USER_ID", "1000");
        image.set_workdir("/workspace");
        image.set_entrypoint(vec!["/cnb/lifecycle/launcher".to_string()]);

        assert_eq!(image.label("io.buildpacks.stack.id"), Some("test.stack"));
        assert_eq!(image.env("CNB_USER_ID"), Some("1000"));
        assert!(image.label("absent").is_none());
    }

    #[test]
    fn test_append_layer_returns_diff_id() {
        let tmp = TempDir::new().unwrap();
        let layer = layer_with("hello", tmp.path());

        let mut image = Image::new(test_ref("example/app"));
        let diff_id = image.append_layer(&layer.path).unwrap();

        assert_eq!(diff_id, layer.diff_id);
        assert_eq!(image.diff_ids(), vec![layer.diff_id.clone()]);
        assert_eq!(image.top_layer_diff_id(), Some(layer.diff_id.as_str()));
    }

    #[test]
    fn test_write_layout_and_reload() {
        let tmp = TempDir::new().unwrap();
        let layer = layer_with("app data", tmp.path());

        let mut image = Image::new(test_ref("example/app:latest"));
        image.set_label("key", "value");
        image.set_env("PATH", "/cnb/bin");
        image.append_layer(&layer.path).unwrap();

        let layout = tmp.path().join("layout");
        let digest = image.write_layout(&layout).unwrap();
        assert!(digest.starts_with("sha256:"));

        let reloaded = Image::from_layout(test_ref("example/app:latest"), &layout).unwrap();
        assert_eq!(reloaded.label("key"), Some("value"));
        assert_eq!(reloaded.env("PATH"), Some("/cnb/bin"));
        assert_eq!(reloaded.diff_ids(), image.diff_ids());
        assert_eq!(reloaded.os(), "linux");
    }

    #[test]
    fn test_write_layout_deterministic() {
        let tmp = TempDir::new().unwrap();
        let layer = layer_with("stable", tmp.path());

        let mut image = Image::new(test_ref("example/app"));
        image.append_layer(&layer.path).unwrap();

        let first = image.write_layout(&tmp.path().join("l1")).unwrap();
        let second = image.write_layout(&tmp.path().join("l2")).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_save_commits_to_store() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(&tmp.path().join("store")).unwrap();
        let layer = layer_with("content", tmp.path());

        let mut image = Image::new(test_ref("example/app:v1"));
        image.append_layer(&layer.path).unwrap();

        let stored = image.save(&store).await.unwrap();
        assert_eq!(stored.reference, "docker.io/example/app:v1");

        let reloaded = Image::from_layout(image.reference().clone(), &stored.path).unwrap();
        assert_eq!(reloaded.diff_ids(), image.diff_ids());
    }

    #[test]
    fn test_rebase_swaps_base_layers() {
        let tmp = TempDir::new().unwrap();

        let base_layer = layer_with("old base", tmp.path());
        let app_layer = layer_with("app", tmp.path());
        let new_base_layer = layer_with("new base", tmp.path());
        let extra_base_layer = layer_with("new base extra", tmp.path());

        let mut old_base = Image::new(test_ref("example/run:old"));
        old_base.append_layer(&base_layer.path).unwrap();

        let mut new_base = Image::new(test_ref("example/run:new"));
        new_base.append_layer(&new_base_layer.path).unwrap();
        new_base.append_layer(&extra_base_layer.path).unwrap();

        let mut app = Image::new(test_ref("example/app"));
        app.append_layer(&base_layer.path).unwrap();
        app.append_layer(&app_layer.path).unwrap();

        app.rebase(&old_base, &new_base).unwrap();
        assert_eq!(
            app.diff_ids(),
            vec![
                new_base_layer.diff_id.clone(),
                extra_base_layer.diff_id.clone(),
                app_layer.diff_id.clone(),
            ]
        );
    }

    #[test]
    fn test_rebase_idempotent() {
        let tmp = TempDir::new().unwrap();
        let base_layer = layer_with("base", tmp.path());
        let app_layer = layer_with("app", tmp.path());
        let new_base_layer = layer_with("new", tmp.path());

        let mut old_base = Image::new(test_ref("example/run:old"));
        old_base.append_layer(&base_layer.path).unwrap();
        let mut new_base = Image::new(test_ref("example/run:new"));
        new_base.append_layer(&new_base_layer.path).unwrap();

        let mut app = Image::new(test_ref("example/app"));
        app.append_layer(&base_layer.path).unwrap();
        app.append_layer(&app_layer.path).unwrap();

        app.rebase(&old_base, &new_base).unwrap();
        let once = app.write_layout(&tmp.path().join("once")).unwrap();

        // Second rebase onto the same new base changes nothing.
        app.rebase(&new_base, &new_base).unwrap();
        let twice = app.write_layout(&tmp.path().join("twice")).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rebase_missing_ancestry_fails() {
        let tmp = TempDir::new().unwrap();
        let unrelated = layer_with("unrelated", tmp.path());
        let app_layer = layer_with("app", tmp.path());

        let mut old_base = Image::new(test_ref("example/run:old"));
        old_base.append_layer(&unrelated.path).unwrap();

        let mut app = Image::new(test_ref("example/app"));
        app.append_layer(&app_layer.path).unwrap();

        let err = app.rebase(&old_base, &old_base).unwrap_err();
        assert!(err.to_string().contains("ancestry"));
    }
}
