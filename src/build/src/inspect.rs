//! Builder and buildpackage inspection.
//!
//! Reads only image labels; nothing is extracted. Detection order can
//! be rendered with meta-buildpack groups expanded to a bounded depth.

use kiln_core::config::UserConfig;
use kiln_core::error::{KilnError, Result};

use crate::buildpack::{BuildpackInfo, OrderEntry};
use crate::image::{ImageFetcher, ImageReference, PullPolicy};
use crate::labels::{
    BuilderMetadata, BuildpackLayers, BuildpackageMetadata, BUILDER_METADATA_LABEL,
    BUILDPACKAGE_METADATA_LABEL, BUILDPACK_LAYERS_LABEL, BUILDPACK_ORDER_LABEL, STACK_ID_LABEL,
    STACK_MIXINS_LABEL,
};

/// Structure of a builder image.
#[derive(Debug, Clone)]
pub struct BuilderInspection {
    pub description: String,
    pub stack_id: String,
    pub mixins: Vec<String>,
    pub run_image: String,
    pub run_image_mirrors: Vec<String>,
    pub lifecycle_version: String,
    pub buildpacks: Vec<BuildpackInfo>,
    pub order: Vec<OrderEntry>,
    pub trusted: bool,
}

/// Structure of a buildpackage image.
#[derive(Debug, Clone)]
pub struct BuildpackInspection {
    pub metadata: BuildpackageMetadata,
    /// Every `(id, version)` contained in the package
    pub buildpacks: Vec<BuildpackInfo>,
}

/// Inspect a builder by its labels.
pub async fn inspect_builder(
    fetcher: &ImageFetcher,
    name: &str,
    policy: PullPolicy,
    config: &UserConfig,
) -> Result<BuilderInspection> {
    let reference = ImageReference::parse(name)?;
    let image = fetcher.fetch(&reference, policy).await?;

    let metadata: BuilderMetadata = match image.label(BUILDER_METADATA_LABEL) {
        Some(label) => serde_json::from_str(label)?,
        None => {
            return Err(KilnError::Config(format!(
                "'{}' is not a builder: missing {} label",
                name, BUILDER_METADATA_LABEL
            )))
        }
    };
    let order: Vec<OrderEntry> = match image.label(BUILDPACK_ORDER_LABEL) {
        Some(label) => serde_json::from_str(label)?,
        None => Vec::new(),
    };
    let mixins: Vec<String> = match image.label(STACK_MIXINS_LABEL) {
        Some(label) => serde_json::from_str(label)?,
        None => Vec::new(),
    };

    Ok(BuilderInspection {
        description: metadata.description,
        stack_id: image.label(STACK_ID_LABEL).unwrap_or_default().to_string(),
        mixins,
        run_image: metadata.stack.run_image.image,
        run_image_mirrors: metadata.stack.run_image.mirrors,
        lifecycle_version: metadata.lifecycle.version,
        buildpacks: metadata.buildpacks,
        order,
        trusted: config.is_trusted_builder(name),
    })
}

/// Inspect a buildpackage by its labels.
pub async fn inspect_buildpack(
    fetcher: &ImageFetcher,
    name: &str,
    policy: PullPolicy,
) -> Result<BuildpackInspection> {
    let reference = ImageReference::parse(name)?;
    let image = fetcher.fetch(&reference, policy).await?;

    let metadata: BuildpackageMetadata = match image.label(BUILDPACKAGE_METADATA_LABEL) {
        Some(label) => serde_json::from_str(label)?,
        None => {
            return Err(KilnError::Config(format!(
                "'{}' is not a buildpackage: missing {} label",
                name, BUILDPACKAGE_METADATA_LABEL
            )))
        }
    };
    let layers: BuildpackLayers = match image.label(BUILDPACK_LAYERS_LABEL) {
        Some(label) => serde_json::from_str(label)?,
        None => BuildpackLayers::new(),
    };

    let mut buildpacks = Vec::new();
    for (id, versions) in &layers {
        for (version, info) in versions {
            buildpacks.push(BuildpackInfo {
                id: id.clone(),
                version: version.clone(),
                homepage: info.homepage.clone(),
                description: None,
            });
        }
    }

    Ok(BuildpackInspection {
        metadata,
        buildpacks,
    })
}

/// Render a detection order as indented lines, expanding meta-buildpack
/// groups (from the layers label) down to `depth` levels. A depth of
/// zero prints only the top-level groups.
pub fn render_order(order: &[OrderEntry], layers: &BuildpackLayers, depth: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, entry) in order.iter().enumerate() {
        lines.push(format!("Group #{}:", index + 1));
        for reference in &entry.group {
            render_ref(&mut lines, layers, &reference.id, &reference.version, reference.optional, 1, depth);
        }
    }
    lines
}

fn render_ref(
    lines: &mut Vec<String>,
    layers: &BuildpackLayers,
    id: &str,
    version: &str,
    optional: bool,
    indent: usize,
    depth: usize,
) {
    let suffix = if optional { " (optional)" } else { "" };
    lines.push(format!("{}{}@{}{}", "  ".repeat(indent), id, version, suffix));

    if depth == 0 {
        return;
    }
    let nested = layers
        .get(id)
        .and_then(|versions| versions.get(version))
        .map(|info| info.order.as_slice())
        .unwrap_or(&[]);
    for entry in nested {
        for reference in &entry.group {
            render_ref(
                lines,
                layers,
                &reference.id,
                &reference.version,
                reference.optional,
                indent + 1,
                depth - 1,
            );
        }
    }
}
