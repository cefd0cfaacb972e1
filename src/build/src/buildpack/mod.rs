//! Buildpack model.
//!
//! A [`Buildpack`] pairs a parsed descriptor with the blob holding its
//! files. The descriptor may sit at the blob's root (a buildpack
//! directory or archive) or nested under `<id>/<version>/` (a
//! buildpackage layer); materializing the buildpack re-roots it at the
//! canonical `/cnb/buildpacks/<id>/<version>/` path.

pub mod api;
pub mod descriptor;
pub mod download;
pub mod registry;

pub use self::api::ApiVersion;
pub use self::descriptor::{
    missing_mixins, parse_mixins_label, BuildpackDescriptor, BuildpackInfo, BuildpackRef,
    MixinStage, OrderEntry, Stack, STACK_ANY,
};
pub use self::download::{BuildpackDownloader, BuildpackReference, DownloadOptions};

use std::io::Read;
use std::path::{Path, PathBuf};

use kiln_core::error::{KilnError, Result};

use crate::blob::{retar_under_prefix, Blob, LayerTar};

/// Root path of buildpacks inside builder and buildpackage images.
pub const BUILDPACKS_DIR: &str = "cnb/buildpacks";

/// A buildpack: descriptor plus content blob.
#[derive(Debug, Clone)]
pub struct Buildpack {
    descriptor: BuildpackDescriptor,
    blob: Blob,
    /// Path inside the blob's tar where the buildpack root sits.
    root: PathBuf,
}

impl Buildpack {
    /// Read a buildpack out of a blob by locating its `buildpack.toml`.
    ///
    /// The descriptor may sit at the tar root, under `<id>/<version>/`,
    /// or under the canonical `cnb/buildpacks/...` prefix of a
    /// buildpackage layer; the shallowest match wins.
    pub fn from_blob(blob: Blob) -> Result<Self> {
        let mut archive = tar::Archive::new(blob.open()?);

        let mut found: Option<(PathBuf, String)> = None;
        for entry in archive
            .entries()
            .map_err(|e| KilnError::NotArchive(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| KilnError::NotArchive(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| KilnError::NotArchive(e.to_string()))?
                .into_owned();

            if path.file_name().and_then(|n| n.to_str()) != Some("buildpack.toml") {
                continue;
            }
            let depth = path.components().count();
            let shallower = found
                .as_ref()
                .map(|(root, _)| depth < root.components().count() + 1)
                .unwrap_or(true);
            if shallower {
                let mut contents = String::new();
                entry
                    .read_to_string(&mut contents)
                    .map_err(|e| KilnError::NotArchive(e.to_string()))?;
                let root = path.parent().unwrap_or(Path::new("")).to_path_buf();
                found = Some((root, contents));
            }
        }

        let (root, contents) = found.ok_or_else(|| {
            KilnError::Config(format!(
                "no buildpack.toml found in {}",
                blob.path().display()
            ))
        })?;

        let descriptor = BuildpackDescriptor::parse(&contents)?;
        Ok(Self {
            descriptor,
            blob,
            root,
        })
    }

    pub fn descriptor(&self) -> &BuildpackDescriptor {
        &self.descriptor
    }

    pub fn info(&self) -> &BuildpackInfo {
        &self.descriptor.info
    }

    pub fn blob(&self) -> &Blob {
        &self.blob
    }

    /// The in-image directory for this buildpack.
    pub fn target_dir(&self) -> PathBuf {
        Path::new(BUILDPACKS_DIR)
            .join(escape_id(&self.descriptor.info.id))
            .join(&self.descriptor.info.version)
    }

    /// Materialize the buildpack as a deterministic layer tar rooted at
    /// `/cnb/buildpacks/<id>/<version>/`.
    pub fn layer(&self, out_dir: &Path) -> Result<LayerTar> {
        let out_path = out_dir.join(format!(
            "{}-{}.tar",
            escape_id(&self.descriptor.info.id),
            self.descriptor.info.version
        ));
        let strip = if self.root.as_os_str().is_empty() {
            None
        } else {
            Some(self.root.as_path())
        };
        retar_under_prefix(self.blob.open()?, strip, &self.target_dir(), &out_path)
    }
}

/// Filesystem-safe form of a buildpack id (`simple/layers` →
/// `simple_layers`).
pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) const SIMPLE_DESCRIPTOR: &str = r#"api = "0.6"

[buildpack]
id = "simple/layers"
version = "0.0.1"

[[stacks]]
id = "pack.test.stack"
"#;

    pub(crate) fn write_buildpack_dir(dir: &Path, descriptor: &str) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("buildpack.toml"), descriptor).unwrap();
        fs::write(dir.join("bin/detect"), "#!/bin/sh\nexit 0\n").unwrap();
        fs::write(dir.join("bin/build"), "#!/bin/sh\nexit 0\n").unwrap();
    }

    fn tar_entry_names(path: &Path) -> Vec<String> {
        let file = fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(file);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_from_blob_root_descriptor() {
        let dir = TempDir::new().unwrap();
        write_buildpack_dir(dir.path(), SIMPLE_DESCRIPTOR);

        let bp = Buildpack::from_blob(Blob::from_dir(dir.path()).unwrap()).unwrap();
        assert_eq!(bp.info().id, "simple/layers");
        assert_eq!(bp.info().version, "0.0.1");
    }

    #[test]
    fn test_from_blob_nested_descriptor() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("simple_layers/0.0.1");
        write_buildpack_dir(&nested, SIMPLE_DESCRIPTOR);

        let bp = Buildpack::from_blob(Blob::from_dir(dir.path()).unwrap()).unwrap();
        assert_eq!(bp.info().id, "simple/layers");
    }

    #[test]
    fn test_from_blob_missing_descriptor() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README.md"), "not a buildpack").unwrap();

        let err = Buildpack::from_blob(Blob::from_dir(dir.path()).unwrap()).unwrap_err();
        assert!(err.to_string().contains("buildpack.toml"));
    }

    #[test]
    fn test_layer_is_rooted_at_canonical_path() {
        let dir = TempDir::new().unwrap();
        write_buildpack_dir(dir.path(), SIMPLE_DESCRIPTOR);

        let bp = Buildpack::from_blob(Blob::from_dir(dir.path()).unwrap()).unwrap();
        let out = TempDir::new().unwrap();
        let layer = bp.layer(out.path()).unwrap();

        let names = tar_entry_names(&layer.path);
        assert!(names.contains(&"cnb/buildpacks/simple_layers/0.0.1/buildpack.toml".to_string()));
        assert!(names.contains(&"cnb/buildpacks/simple_layers/0.0.1/bin/detect".to_string()));
    }

    #[test]
    fn test_layer_strips_nested_root() {
        let dir = TempDir::new().unwrap();
        write_buildpack_dir(&dir.path().join("simple_layers/0.0.1"), SIMPLE_DESCRIPTOR);

        let bp = Buildpack::from_blob(Blob::from_dir(dir.path()).unwrap()).unwrap();
        let out = TempDir::new().unwrap();
        let layer = bp.layer(out.path()).unwrap();

        let names = tar_entry_names(&layer.path);
        // No double nesting: the old root is replaced, not appended.
        assert!(names.contains(&"cnb/buildpacks/simple_layers/0.0.1/buildpack.toml".to_string()));
        assert!(!names
            .iter()
            .any(|n| n.contains("0.0.1/simple_layers/0.0.1")));
    }

    #[test]
    fn test_identical_content_yields_identical_layers() {
        let out = TempDir::new().unwrap();

        let dir_a = TempDir::new().unwrap();
        write_buildpack_dir(dir_a.path(), SIMPLE_DESCRIPTOR);
        let dir_b = TempDir::new().unwrap();
        write_buildpack_dir(dir_b.path(), SIMPLE_DESCRIPTOR);

        let bp_a = Buildpack::from_blob(Blob::from_dir(dir_a.path()).unwrap()).unwrap();
        let bp_b = Buildpack::from_blob(Blob::from_dir(dir_b.path()).unwrap()).unwrap();

        let side_a = out.path().join("a");
        let side_b = out.path().join("b");
        fs::create_dir_all(&side_a).unwrap();
        fs::create_dir_all(&side_b).unwrap();

        let layer_a = bp_a.layer(&side_a).unwrap();
        let layer_b = bp_b.layer(&side_b).unwrap();
        assert_eq!(layer_a.diff_id, layer_b.diff_id);
    }

    #[test]
    fn test_escape_id() {
        assert_eq!(escape_id("simple/layers"), "simple_layers");
        assert_eq!(escape_id("plain"), "plain");
    }
}
