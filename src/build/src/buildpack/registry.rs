//! Buildpack registry index.
//!
//! Resolves `urn:cnb:registry:<namespace>/<name>@<version>` references
//! against an on-disk index: one TOML file per published version at
//! `<root>/<namespace>/<name>/<version>.toml`, naming the buildpackage
//! image that holds the release.

use std::path::PathBuf;

use kiln_core::error::{KilnError, Result};
use serde::Deserialize;

const URN_PREFIX: &str = "urn:cnb:registry:";

/// A parsed registry URN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryUrn {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl RegistryUrn {
    /// Parse `urn:cnb:registry:<namespace>/<name>@<version>`.
    pub fn parse(urn: &str) -> Result<Self> {
        let rest = urn.strip_prefix(URN_PREFIX).ok_or_else(|| KilnError::Resolution {
            reference: urn.to_string(),
            message: format!("expected prefix '{}'", URN_PREFIX),
        })?;

        let (full_name, version) = rest.split_once('@').ok_or_else(|| KilnError::Resolution {
            reference: urn.to_string(),
            message: "missing '@<version>'".to_string(),
        })?;
        let (namespace, name) = full_name.split_once('/').ok_or_else(|| KilnError::Resolution {
            reference: urn.to_string(),
            message: "expected '<namespace>/<name>'".to_string(),
        })?;

        if namespace.is_empty() || name.is_empty() || version.is_empty() {
            return Err(KilnError::Resolution {
                reference: urn.to_string(),
                message: "namespace, name, and version must be non-empty".to_string(),
            });
        }

        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    pub fn to_urn(&self) -> String {
        format!(
            "{}{}/{}@{}",
            URN_PREFIX, self.namespace, self.name, self.version
        )
    }
}

/// Whether a reference string looks like a registry URN.
pub fn is_registry_urn(reference: &str) -> bool {
    reference.starts_with(URN_PREFIX)
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    image: String,
}

/// An on-disk buildpack registry index.
#[derive(Debug, Clone)]
pub struct RegistryIndex {
    root: PathBuf,
}

impl RegistryIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a URN to the buildpackage image reference it names.
    pub fn lookup(&self, urn: &RegistryUrn) -> Result<String> {
        let path = self
            .root
            .join(&urn.namespace)
            .join(&urn.name)
            .join(format!("{}.toml", urn.version));

        let data = std::fs::read_to_string(&path).map_err(|_| KilnError::Resolution {
            reference: urn.to_urn(),
            message: format!("no registry entry at {}", path.display()),
        })?;

        let entry: IndexEntry = toml::from_str(&data).map_err(|e| KilnError::Resolution {
            reference: urn.to_urn(),
            message: format!("invalid registry entry: {}", e),
        })?;

        Ok(entry.image)
    }
}
