//! Buildpack descriptor (`buildpack.toml`) parsing and validation.
//!
//! A component buildpack declares the stacks it supports (optionally with
//! required mixins); a meta-buildpack declares an order of groups instead.
//! Exactly one of the two must be present.

use std::collections::BTreeSet;

use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};

use super::api::ApiVersion;

/// Stack id wildcard: matches any stack and may require no mixins.
pub const STACK_ANY: &str = "*";

/// Identity block of a buildpack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackInfo {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl BuildpackInfo {
    /// `id@version`, the display form used in errors and logs.
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }
}

/// One stack a component buildpack supports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mixins: Vec<String>,
}

/// A reference to a buildpack inside an order group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// One detection group: buildpacks evaluated together, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    #[serde(default)]
    pub group: Vec<BuildpackRef>,
}

/// Parsed `buildpack.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildpackDescriptor {
    pub api: ApiVersion,
    pub info: BuildpackInfo,
    pub stacks: Vec<Stack>,
    pub order: Vec<OrderEntry>,
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    api: Option<ApiVersion>,
    buildpack: BuildpackInfo,
    #[serde(default)]
    stacks: Vec<Stack>,
    #[serde(default)]
    order: Vec<OrderEntry>,
}

impl BuildpackDescriptor {
    /// Parse and validate a `buildpack.toml` document.
    pub fn parse(toml_str: &str) -> Result<Self> {
        let file: DescriptorFile = toml::from_str(toml_str)
            .map_err(|e| KilnError::Config(format!("invalid buildpack.toml: {}", e)))?;

        let descriptor = Self {
            api: file.api.unwrap_or(ApiVersion::new(0, 1)),
            info: file.buildpack,
            stacks: file.stacks,
            order: file.order,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<()> {
        if self.info.id.is_empty() {
            return Err(KilnError::Config(
                "buildpack.toml: buildpack id is required".to_string(),
            ));
        }
        if self.info.version.is_empty() {
            return Err(KilnError::Config(format!(
                "buildpack.toml: version is required for buildpack '{}'",
                self.info.id
            )));
        }
        match (self.stacks.is_empty(), self.order.is_empty()) {
            (true, true) => Err(KilnError::Config(format!(
                "buildpack '{}' must declare either stacks or an order",
                self.info.id
            ))),
            (false, false) => Err(KilnError::Config(format!(
                "buildpack '{}' cannot declare both stacks and an order",
                self.info.id
            ))),
            _ => {
                for stack in &self.stacks {
                    if stack.id == STACK_ANY && !stack.mixins.is_empty() {
                        return Err(KilnError::Config(format!(
                            "buildpack '{}': the '{}' stack cannot require mixins",
                            self.info.id, STACK_ANY
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// A meta-buildpack declares an order instead of stacks.
    pub fn is_meta(&self) -> bool {
        !self.order.is_empty()
    }

    /// Whether this buildpack supports `stack_id` at all.
    ///
    /// Meta-buildpacks are never matched against stacks directly.
    pub fn supports_stack(&self, stack_id: &str) -> bool {
        !self.is_meta()
            && self
                .stacks
                .iter()
                .any(|s| s.id == stack_id || s.id == STACK_ANY)
    }

    /// Mixins this buildpack requires on `stack_id` (empty for wildcard
    /// matches).
    pub fn required_mixins(&self, stack_id: &str) -> Vec<String> {
        self.stacks
            .iter()
            .find(|s| s.id == stack_id)
            .map(|s| s.mixins.clone())
            .unwrap_or_default()
    }
}

/// Which mixins from `required` are missing from `provided`.
///
/// `provided` holds the image's declared mixins (`X`, `build:Y`,
/// `run:Z`). An unprefixed requirement is satisfied by the same name or
/// by a stage-scoped variant for `stage`; a prefixed requirement must
/// match exactly or be covered by the unprefixed name.
pub fn missing_mixins(
    required: &[String],
    provided: &BTreeSet<String>,
    stage: MixinStage,
) -> Vec<String> {
    required
        .iter()
        .filter(|mixin| !mixin_satisfied(mixin, provided, stage))
        .cloned()
        .collect()
}

/// The image side a mixin check runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixinStage {
    Build,
    Run,
}

impl MixinStage {
    fn prefix(self) -> &'static str {
        match self {
            MixinStage::Build => "build:",
            MixinStage::Run => "run:",
        }
    }
}

fn mixin_satisfied(required: &str, provided: &BTreeSet<String>, stage: MixinStage) -> bool {
    if provided.contains(required) {
        return true;
    }
    match required.split_once(':') {
        // `build:X` is also satisfied by an unscoped `X`.
        Some((_, bare)) => provided.contains(bare),
        // A bare requirement is satisfied by the stage-scoped variant.
        None => provided.contains(&format!("{}{}", stage.prefix(), required)),
    }
}

/// Parse the image mixins label (a JSON string list) into a set.
pub fn parse_mixins_label(label: &str) -> Result<BTreeSet<String>> {
    let mixins: Vec<String> = serde_json::from_str(label)
        .map_err(|e| KilnError::Config(format!("invalid mixins label: {}", e)))?;
    Ok(mixins.into_iter().collect())
}
