//! Lifecycle archives and descriptors.
//!
//! A lifecycle archive carries the phase binaries under `lifecycle/` and
//! a `lifecycle.toml` descriptor naming its release version and the
//! buildpack/platform API versions it speaks.

use std::io::Read;
use std::path::{Path, PathBuf};

use kiln_core::error::{KilnError, Result};
use semver::Version;
use serde::Deserialize;

use crate::blob::{retar_under_prefix, Blob, LayerTar};
use crate::buildpack::ApiVersion;
use crate::labels::{ApiSetMetadata, ApisMetadata};

/// Lifecycle version used when neither a version nor a URI is configured.
pub const DEFAULT_LIFECYCLE_VERSION: &str = "0.11.3";

/// In-image directory holding the lifecycle binaries.
pub const LIFECYCLE_DIR: &str = "cnb/lifecycle";

/// How a lifecycle relates to one API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiSupport {
    Supported,
    Deprecated,
    Unsupported,
}

/// Parsed `lifecycle.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleDescriptor {
    pub version: Version,
    pub buildpack_apis: ApiSet,
    pub platform_apis: ApiSet,
}

/// Deprecated and supported versions of one API surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiSet {
    #[serde(default)]
    pub deprecated: Vec<ApiVersion>,
    #[serde(default)]
    pub supported: Vec<ApiVersion>,
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    lifecycle: VersionTable,
    apis: ApisTable,
}

#[derive(Debug, Deserialize)]
struct VersionTable {
    version: Version,
}

#[derive(Debug, Deserialize)]
struct ApisTable {
    buildpack: ApiSet,
    platform: ApiSet,
}

impl LifecycleDescriptor {
    /// Parse a `lifecycle.toml` document.
    pub fn parse(toml_str: &str) -> Result<Self> {
        let file: DescriptorFile = toml::from_str(toml_str)
            .map_err(|e| KilnError::Config(format!("invalid lifecycle.toml: {}", e)))?;
        if file.apis.buildpack.supported.is_empty() {
            return Err(KilnError::Config(
                "lifecycle.toml: apis.buildpack.supported must not be empty".to_string(),
            ));
        }
        Ok(Self {
            version: file.lifecycle.version,
            buildpack_apis: file.apis.buildpack,
            platform_apis: file.apis.platform,
        })
    }

    /// How this lifecycle relates to a buildpack API version.
    pub fn buildpack_api_support(&self, api: ApiVersion) -> ApiSupport {
        if self.buildpack_apis.supported.contains(&api) {
            ApiSupport::Supported
        } else if self.buildpack_apis.deprecated.contains(&api) {
            ApiSupport::Deprecated
        } else {
            ApiSupport::Unsupported
        }
    }

    /// The metadata representation written into builder labels.
    pub fn apis_metadata(&self) -> ApisMetadata {
        ApisMetadata {
            buildpack: ApiSetMetadata {
                deprecated: self.buildpack_apis.deprecated.clone(),
                supported: self.buildpack_apis.supported.clone(),
            },
            platform: ApiSetMetadata {
                deprecated: self.platform_apis.deprecated.clone(),
                supported: self.platform_apis.supported.clone(),
            },
        }
    }
}

/// A lifecycle archive: descriptor plus binary blob.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    descriptor: LifecycleDescriptor,
    blob: Blob,
    /// Prefix inside the blob's tar where the binaries live.
    binaries_root: PathBuf,
}

impl Lifecycle {
    /// Read a lifecycle out of an archive blob by locating its
    /// `lifecycle.toml` and sibling `lifecycle/` directory.
    pub fn from_blob(blob: Blob) -> Result<Self> {
        let mut archive = tar::Archive::new(blob.open()?);

        let mut descriptor_toml: Option<(PathBuf, String)> = None;
        for entry in archive
            .entries()
            .map_err(|e| KilnError::NotArchive(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| KilnError::NotArchive(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| KilnError::NotArchive(e.to_string()))?
                .into_owned();
            if path.file_name().and_then(|n| n.to_str()) != Some("lifecycle.toml") {
                continue;
            }
            let shallower = descriptor_toml
                .as_ref()
                .map(|(existing, _)| path.components().count() < existing.components().count())
                .unwrap_or(true);
            if shallower {
                let mut contents = String::new();
                entry
                    .read_to_string(&mut contents)
                    .map_err(|e| KilnError::NotArchive(e.to_string()))?;
                descriptor_toml = Some((path, contents));
            }
        }

        let (toml_path, contents) = descriptor_toml.ok_or_else(|| {
            KilnError::Config(format!(
                "no lifecycle.toml found in {}",
                blob.path().display()
            ))
        })?;
        let descriptor = LifecycleDescriptor::parse(&contents)?;

        let binaries_root = toml_path
            .parent()
            .unwrap_or(Path::new(""))
            .join("lifecycle");

        Ok(Self {
            descriptor,
            blob,
            binaries_root,
        })
    }

    pub fn descriptor(&self) -> &LifecycleDescriptor {
        &self.descriptor
    }

    /// Materialize the binaries as a deterministic layer at
    /// `/cnb/lifecycle/`.
    pub fn layer(&self, out_dir: &Path) -> Result<LayerTar> {
        let out_path = out_dir.join(format!("lifecycle-{}.tar", self.descriptor.version));
        retar_under_prefix(
            self.blob.open()?,
            Some(self.binaries_root.as_path()),
            Path::new(LIFECYCLE_DIR),
            &out_path,
        )
    }
}

/// Canonical download URL for a lifecycle release.
///
/// Windows lifecycles exist but sit behind the experimental gate, which
/// the composer enforces before calling this.
pub fn lifecycle_url(version: &str, os: &str) -> Result<String> {
    let suffix = match os {
        "linux" => "linux.x86-64",
        "windows" => "windows.x86-64",
        other => {
            return Err(KilnError::Config(format!(
                "no lifecycle distribution for OS '{}'",
                other
            )))
        }
    };
    Ok(format!(
        "https://github.com/buildpacks/lifecycle/releases/download/v{version}/lifecycle-v{version}+{suffix}.tgz",
        version = version,
        suffix = suffix
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) const LIFECYCLE_TOML: &str = r#"[lifecycle]
version = "0.11.3"

[apis.buildpack]
deprecated = ["0.2"]
supported = ["0.3", "0.4", "0.5", "0.6"]

[apis.platform]
deprecated = []
supported = ["0.5", "0.6"]
"#;

    pub(crate) fn write_lifecycle_dir(dir: &Path) {
        fs::create_dir_all(dir.join("lifecycle")).unwrap();
        fs::write(dir.join("lifecycle.toml"), LIFECYCLE_TOML).unwrap();
        for binary in ["detector", "analyzer", "restorer", "builder", "exporter", "creator", "launcher"] {
            fs::write(dir.join("lifecycle").join(binary), format!("#!{}", binary)).unwrap();
        }
    }

    #[test]
    fn test_parse_descriptor() {
        let d = LifecycleDescriptor::parse(LIFECYCLE_TOML).unwrap();
        assert_eq!(d.version, Version::new(0, 11, 3));
        assert_eq!(d.buildpack_apis.supported.len(), 4);
        assert_eq!(d.platform_apis.supported.len(), 2);
    }

    #[test]
    fn test_parse_descriptor_requires_supported_apis() {
        let toml = r#"
            [lifecycle]
            version = "0.11.3"
            [apis.buildpack]
            supported = []
            [apis.platform]
            supported = ["0.6"]
        "#;
        assert!(LifecycleDescriptor::parse(toml).is_err());
    }

    #[test]
    fn test_api_support_levels() {
        let d = LifecycleDescriptor::parse(LIFECYCLE_TOML).unwrap();
        assert_eq!(
            d.buildpack_api_support("0.6".parse().unwrap()),
            ApiSupport::Supported
        );
        assert_eq!(
            d.buildpack_api_support("0.2".parse().unwrap()),
            ApiSupport::Deprecated
        );
        assert_eq!(
            d.buildpack_api_support("0.9".parse().unwrap()),
            ApiSupport::Unsupported
        );
    }

    #[test]
    fn test_from_blob_and_layer() {
        let dir = TempDir::new().unwrap();
        write_lifecycle_dir(dir.path());

        let lifecycle = Lifecycle::from_blob(Blob::from_dir(dir.path()).unwrap()).unwrap();
        assert_eq!(lifecycle.descriptor().version, Version::new(0, 11, 3));

        let out = TempDir::new().unwrap();
        let layer = lifecycle.layer(out.path()).unwrap();

        let file = fs::File::open(&layer.path).unwrap();
        let mut archive = tar::Archive::new(file);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"cnb/lifecycle/detector".to_string()));
        assert!(names.contains(&"cnb/lifecycle/creator".to_string()));
        assert!(!names.iter().any(|n| n.contains("lifecycle.toml")));
    }

    #[test]
    fn test_from_blob_missing_descriptor() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("random.txt"), "nope").unwrap();
        assert!(Lifecycle::from_blob(Blob::from_dir(dir.path()).unwrap()).is_err());
    }

    #[test]
    fn test_lifecycle_url() {
        let url = lifecycle_url("0.11.3", "linux").unwrap();
        assert!(url.contains("v0.11.3"));
        assert!(url.contains("linux.x86-64"));
        assert!(lifecycle_url("0.11.3", "plan9").is_err());
    }

    #[test]
    fn test_apis_metadata() {
        let d = LifecycleDescriptor::parse(LIFECYCLE_TOML).unwrap();
        let metadata = d.apis_metadata();
        assert_eq!(metadata.buildpack.deprecated.len(), 1);
        assert_eq!(metadata.platform.supported.len(), 2);
    }
}
