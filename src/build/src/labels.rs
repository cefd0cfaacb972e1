//! Image label schema.
//!
//! All coordination between builders, buildpackages, and app images
//! happens through labels in the `io.buildpacks.*` namespace. This module
//! holds the label keys and their serde representations.
//!
//! ## Builder images
//! - `io.buildpacks.builder.metadata`: stack, lifecycle, contained buildpacks
//! - `io.buildpacks.buildpack.order`: detection order
//! - `io.buildpacks.buildpack.layers`: id to version to layer info
//!
//! ## Stack images
//! - `io.buildpacks.stack.id`: stack identity
//! - `io.buildpacks.stack.mixins`: JSON list of provided mixins
//!
//! ## Buildpackages
//! - `io.buildpacks.buildpackage.metadata`: root id/version and stacks

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::buildpack::{ApiVersion, BuildpackInfo, OrderEntry, Stack};

pub const BUILDER_METADATA_LABEL: &str = "io.buildpacks.builder.metadata";
pub const BUILDPACK_ORDER_LABEL: &str = "io.buildpacks.buildpack.order";
pub const BUILDPACK_LAYERS_LABEL: &str = "io.buildpacks.buildpack.layers";
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";
pub const STACK_MIXINS_LABEL: &str = "io.buildpacks.stack.mixins";
pub const BUILDPACKAGE_METADATA_LABEL: &str = "io.buildpacks.buildpackage.metadata";
pub const LIFECYCLE_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";
pub const BUILD_METADATA_LABEL: &str = "io.buildpacks.build.metadata";
pub const PROJECT_METADATA_LABEL: &str = "io.buildpacks.project.metadata";

/// `io.buildpacks.builder.metadata`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuilderMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stack: StackMetadata,
    #[serde(default)]
    pub lifecycle: LifecycleMetadata,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackInfo>,
    #[serde(default, rename = "createdBy")]
    pub created_by: CreatedBy,
}

/// Tool identity recorded in builder metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedBy {
    pub name: String,
    pub version: String,
}

impl Default for CreatedBy {
    fn default() -> Self {
        Self {
            name: "kiln".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Run-image half of the stack metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackMetadata {
    #[serde(default, rename = "runImage")]
    pub run_image: RunImageMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

/// Lifecycle block of the builder metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleMetadata {
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "api")]
    pub apis: ApisMetadata,
    /// Image the separate-phases mode runs from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApisMetadata {
    #[serde(default)]
    pub buildpack: ApiSetMetadata,
    #[serde(default)]
    pub platform: ApiSetMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSetMetadata {
    #[serde(default)]
    pub deprecated: Vec<ApiVersion>,
    #[serde(default)]
    pub supported: Vec<ApiVersion>,
}

/// One entry of `io.buildpacks.buildpack.layers`:
/// id → version → layer info.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildpackLayerInfo {
    pub api: ApiVersion,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacks: Vec<Stack>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<OrderEntry>,
    #[serde(rename = "layerDiffID")]
    pub layer_diff_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

/// The full layers label: id → version → info.
pub type BuildpackLayers = BTreeMap<String, BTreeMap<String, BuildpackLayerInfo>>;

/// `io.buildpacks.buildpackage.metadata`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildpackageMetadata {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub stacks: Vec<Stack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

/// Insert one buildpack into a layers map.
pub fn add_layer_info(
    layers: &mut BuildpackLayers,
    info: &BuildpackInfo,
    api: ApiVersion,
    stacks: Vec<Stack>,
    order: Vec<OrderEntry>,
    diff_id: &str,
) {
    layers.entry(info.id.clone()).or_default().insert(
        info.version.clone(),
        BuildpackLayerInfo {
            api,
            stacks,
            order,
            layer_diff_id: diff_id.to_string(),
            homepage: info.homepage.clone(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_metadata_roundtrip() {
        let metadata = BuilderMetadata {
            description: "test builder".to_string(),
            stack: StackMetadata {
                run_image: RunImageMetadata {
                    image: "example/run".to_string(),
                    mirrors: vec!["mirror.local/run".to_string()],
                },
            },
            lifecycle: LifecycleMetadata {
                version: "0.11.3".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("runImage"));
        assert!(json.contains("createdBy"));

        let parsed: BuilderMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.stack.run_image.image, "example/run");
        assert_eq!(parsed.lifecycle.version, "0.11.3");
        assert_eq!(parsed.created_by.name, "kiln");
    }

    #[test]
    fn test_layer_info_diff_id_key() {
        let info = BuildpackLayerInfo {
            api: "0.6".parse().unwrap(),
            layer_diff_id: "sha256:abc".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("layerDiffID"));
    }

    #[test]
    fn test_add_layer_info_groups_versions() {
        let mut layers = BuildpackLayers::new();
        let info_v1 = BuildpackInfo {
            id: "example/bp".to_string(),
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        let info_v2 = BuildpackInfo {
            version: "2.0.0".to_string(),
            ..info_v1.clone()
        };

        add_layer_info(&mut layers, &info_v1, "0.6".parse().unwrap(), vec![], vec![], "sha256:a");
        add_layer_info(&mut layers, &info_v2, "0.6".parse().unwrap(), vec![], vec![], "sha256:b");

        assert_eq!(layers.len(), 1);
        assert_eq!(layers["example/bp"].len(), 2);
        assert_eq!(layers["example/bp"]["1.0.0"].layer_diff_id, "sha256:a");
    }

    #[test]
    fn test_buildpackage_metadata_parse() {
        let json = r#"{"id":"simple/layers","version":"0.0.1","stacks":[{"id":"pack.test.stack"}]}"#;
        let metadata: BuildpackageMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.id, "simple/layers");
        assert_eq!(metadata.stacks[0].id, "pack.test.stack");
    }
}
