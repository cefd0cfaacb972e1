//! Builder configuration (`builder.toml`).

use std::path::Path;

use kiln_core::error::{KilnError, Result};
use serde::Deserialize;

use crate::buildpack::OrderEntry;

/// One buildpack entry of a builder or package config: an identity plus
/// the place to get it from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub image: String,
}

impl ModuleConfig {
    /// The reference string to resolve (uri or image).
    pub fn source(&self) -> Result<&str> {
        match (self.uri.is_empty(), self.image.is_empty()) {
            (false, true) => Ok(&self.uri),
            (true, false) => Ok(&self.image),
            (false, false) => Err(KilnError::Config(format!(
                "buildpack '{}' cannot declare both uri and image",
                self.display_name()
            ))),
            (true, true) => Err(KilnError::Config(format!(
                "buildpack '{}' must declare a uri or an image",
                self.display_name()
            ))),
        }
    }

    fn display_name(&self) -> String {
        if self.id.is_empty() {
            "<unnamed>".to_string()
        } else {
            self.id.clone()
        }
    }
}

/// `[stack]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StackConfig {
    pub id: String,
    #[serde(rename = "build-image")]
    pub build_image: String,
    #[serde(rename = "run-image")]
    pub run_image: String,
    #[serde(default, rename = "run-image-mirrors")]
    pub run_image_mirrors: Vec<String>,
}

/// `[lifecycle]` table: at most one of version and uri.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uri: String,
}

/// Parsed `builder.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuilderConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub buildpacks: Vec<ModuleConfig>,
    #[serde(default)]
    pub order: Vec<OrderEntry>,
    pub stack: StackConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl BuilderConfig {
    /// Load and validate a `builder.toml` file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: BuilderConfig = toml::from_str(&data)
            .map_err(|e| KilnError::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack.id.is_empty() {
            return Err(KilnError::Config(
                "builder.toml: stack.id is required".to_string(),
            ));
        }
        if self.stack.build_image.is_empty() || self.stack.run_image.is_empty() {
            return Err(KilnError::Config(
                "builder.toml: stack.build-image and stack.run-image are required".to_string(),
            ));
        }
        if !self.lifecycle.version.is_empty() && !self.lifecycle.uri.is_empty() {
            return Err(KilnError::Config(
                "builder.toml: lifecycle cannot declare both version and uri".to_string(),
            ));
        }
        for buildpack in &self.buildpacks {
            buildpack.source()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const BUILDER_TOML: &str = r#"description = "test builder"

[[buildpacks]]
id = "simple/layers"
version = "0.0.1"
uri = "simple-layers"

[[order]]
[[order.group]]
id = "simple/layers"
version = "0.0.1"

[stack]
id = "pack.test.stack"
build-image = "example/build:latest"
run-image = "example/run:latest"
run-image-mirrors = ["registry.local/example/run:latest"]

[lifecycle]
version = "0.11.3"
"#;

    #[test]
    fn test_parse_builder_toml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        std::fs::write(&path, BUILDER_TOML).unwrap();

        let config = BuilderConfig::from_path(&path).unwrap();
        assert_eq!(config.description, "test builder");
        assert_eq!(config.stack.id, "pack.test.stack");
        assert_eq!(config.stack.run_image_mirrors.len(), 1);
        assert_eq!(config.buildpacks[0].source().unwrap(), "simple-layers");
        assert_eq!(config.order[0].group[0].id, "simple/layers");
        assert_eq!(config.lifecycle.version, "0.11.3");
    }

    #[test]
    fn test_missing_stack_id() {
        let toml = r#"
            [stack]
            id = ""
            build-image = "b"
            run-image = "r"
        "#;
        let config: BuilderConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_images() {
        let toml = r#"
            [stack]
            id = "some.stack"
            build-image = "b"
            run-image = ""
        "#;
        let config: BuilderConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lifecycle_version_and_uri_conflict() {
        let toml = r#"
            [stack]
            id = "some.stack"
            build-image = "b"
            run-image = "r"
            [lifecycle]
            version = "0.11.3"
            uri = "https://example.test/lifecycle.tgz"
        "#;
        let config: BuilderConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_module_config_source() {
        let both = ModuleConfig {
            id: "x".into(),
            uri: "u".into(),
            image: "i".into(),
            ..Default::default()
        };
        assert!(both.source().is_err());

        let neither = ModuleConfig {
            id: "x".into(),
            ..Default::default()
        };
        assert!(neither.source().is_err());

        let image_only = ModuleConfig {
            id: "x".into(),
            image: "ghcr.io/example/bp:1".into(),
            ..Default::default()
        };
        assert_eq!(image_only.source().unwrap(), "ghcr.io/example/bp:1");
    }

    #[test]
    fn test_invalid_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        std::fs::write(&path, "not == toml").unwrap();
        assert!(BuilderConfig::from_path(&path).is_err());
    }
}
