//! Persistent user configuration.
//!
//! Stored as TOML under `$KILN_HOME/config.toml` (default `~/.kiln`).
//! The engine only ever sees the parsed struct; loading and saving are
//! done here with atomic writes (write to tmp file, then rename).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Run-image mirror list for a single named run image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunImageConfig {
    /// The run image these mirrors substitute for
    pub image: String,
    /// Mirror references, preferred in order
    #[serde(default)]
    pub mirrors: Vec<String>,
}

/// Parsed user configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    /// Builder used when none is given on the command line
    #[serde(default, rename = "default-builder", skip_serializing_if = "Option::is_none")]
    pub default_builder: Option<String>,

    /// Builders allowed to run the single-container creator
    #[serde(default, rename = "trusted-builders")]
    pub trusted_builders: Vec<String>,

    /// User-configured run-image mirrors; take precedence over
    /// mirrors declared by the builder
    #[serde(default, rename = "run-images")]
    pub run_images: Vec<RunImageConfig>,

    /// Lifecycle image used for the separate-phases mode
    #[serde(default, rename = "lifecycle-image", skip_serializing_if = "Option::is_none")]
    pub lifecycle_image: Option<String>,

    /// Gate for windows builders and other experimental surfaces
    #[serde(default)]
    pub experimental: bool,
}

impl UserConfig {
    /// Load the configuration from a TOML file.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;

        toml::from_str(&data)
            .map_err(|e| KilnError::Config(format!("failed to parse config {}: {}", path.display(), e)))
    }

    /// Save the configuration (atomic write).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KilnError::Config(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let data = toml::to_string_pretty(self)?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, &data).map_err(|e| {
            KilnError::Config(format!("failed to write {}: {}", tmp_path.display(), e))
        })?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            KilnError::Config(format!(
                "failed to rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Whether the named builder may run the single-container creator.
    pub fn is_trusted_builder(&self, name: &str) -> bool {
        self.default_builder.as_deref() == Some(name)
            || self.trusted_builders.iter().any(|b| b == name)
    }

    /// Mark a builder as trusted (idempotent).
    pub fn trust_builder(&mut self, name: &str) {
        if !self.trusted_builders.iter().any(|b| b == name) {
            self.trusted_builders.push(name.to_string());
        }
    }

    /// User-configured mirrors for a run image, if any.
    pub fn mirrors_for(&self, run_image: &str) -> Option<&[String]> {
        self.run_images
            .iter()
            .find(|r| r.image == run_image)
            .map(|r| r.mirrors.as_slice())
    }
}

/// The kiln home directory (`$KILN_HOME` or `~/.kiln`).
pub fn kiln_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("KILN_HOME") {
        return Ok(PathBuf::from(home));
    }
    let home = std::env::var("HOME")
        .map_err(|_| KilnError::Config("HOME environment variable not set".to_string()))?;
    Ok(PathBuf::from(home).join(".kiln"))
}

/// Default path of the user configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(kiln_home()?.join("config.toml"))
}
