//! Builder composition.
//!
//! Fuses buildpacks, a lifecycle, and a stack's build image into a
//! builder image: one layer per unique buildpack under
//! `/cnb/buildpacks/`, the lifecycle under `/cnb/lifecycle/`, plus
//! `stack.toml` and `order.toml` layers and the three builder metadata
//! labels. Composition is all-or-nothing: the image is tagged only by
//! the final save or push, so a failed step leaves nothing behind.

pub mod config;
pub mod lifecycle;

pub use self::config::{BuilderConfig, LifecycleConfig, ModuleConfig, StackConfig};
pub use self::lifecycle::{
    lifecycle_url, ApiSupport, Lifecycle, LifecycleDescriptor, DEFAULT_LIFECYCLE_VERSION,
};

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::error::{KilnError, Result};
use serde::Serialize;
use tempfile::TempDir;

use crate::blob::{write_file_layer, Blob};
use crate::buildpack::{
    missing_mixins, parse_mixins_label, Buildpack, BuildpackDownloader, BuildpackInfo,
    BuildpackReference, DownloadOptions, MixinStage, OrderEntry,
};
use crate::image::{Image, ImageFetcher, ImageReference, PullPolicy};
use crate::labels::{
    add_layer_info, BuilderMetadata, BuildpackLayers, CreatedBy, LifecycleMetadata,
    RunImageMetadata, StackMetadata, BUILDER_METADATA_LABEL, BUILDPACK_LAYERS_LABEL,
    BUILDPACK_ORDER_LABEL, STACK_ID_LABEL, STACK_MIXINS_LABEL,
};

/// Env vars a build image must provide for the lifecycle to run as the
/// right user.
pub const ENV_USER_ID: &str = "CNB_USER_ID";
pub const ENV_GROUP_ID: &str = "CNB_GROUP_ID";

const ORDER_PATH: &str = "cnb/order.toml";
const STACK_PATH: &str = "cnb/stack.toml";

/// Options for one builder creation.
#[derive(Debug, Clone)]
pub struct CreateBuilderOptions {
    /// Reference the builder is saved or pushed under
    pub builder_name: String,
    pub config: BuilderConfig,
    /// Base directory for relative buildpack URIs
    pub base_dir: PathBuf,
    /// Push to the registry instead of saving locally
    pub publish: bool,
    pub pull_policy: PullPolicy,
    /// Allows windows builders and windows lifecycles
    pub experimental: bool,
}

/// The saved or pushed builder.
#[derive(Debug, Clone)]
pub struct CreatedBuilder {
    pub reference: String,
    pub digest: String,
}

/// Composes builder images.
pub struct BuilderComposer {
    fetcher: Arc<ImageFetcher>,
    downloader: BuildpackDownloader,
}

impl BuilderComposer {
    pub fn new(fetcher: Arc<ImageFetcher>, downloader: BuildpackDownloader) -> Self {
        Self {
            fetcher,
            downloader,
        }
    }

    /// Run the full composition sequence.
    pub async fn create(&self, opts: &CreateBuilderOptions) -> Result<CreatedBuilder> {
        opts.config.validate()?;
        let work = TempDir::new()
            .map_err(|e| KilnError::Runtime(format!("failed to create work dir: {}", e)))?;

        // Build image first: it is the layer base and the source of
        // stack identity.
        let build_ref = ImageReference::parse(&opts.config.stack.build_image)?;
        let mut builder = self.fetcher.fetch(&build_ref, opts.pull_policy).await?;
        tracing::debug!(image = %build_ref, "build image fetched");

        if builder.os() == "windows" && !opts.experimental {
            return Err(KilnError::Config(
                "windows builders are only supported with the experimental flag enabled"
                    .to_string(),
            ));
        }

        let image_stack_id = builder
            .label(STACK_ID_LABEL)
            .ok_or_else(|| {
                KilnError::Compatibility(format!(
                    "build image '{}' is missing the {} label",
                    build_ref, STACK_ID_LABEL
                ))
            })?
            .to_string();
        if image_stack_id != opts.config.stack.id {
            return Err(KilnError::Compatibility(format!(
                "stack '{}' from builder config is incompatible with stack '{}' from build image '{}'",
                opts.config.stack.id, image_stack_id, build_ref
            )));
        }

        let build_mixins: BTreeSet<String> = match builder.label(STACK_MIXINS_LABEL) {
            Some(label) => parse_mixins_label(label)?,
            None => BTreeSet::new(),
        };

        for env in [ENV_USER_ID, ENV_GROUP_ID] {
            if builder.env(env).is_none() {
                return Err(KilnError::Config(format!(
                    "build image '{}' is missing required env var '{}'",
                    build_ref, env
                )));
            }
        }

        let lifecycle = self
            .resolve_lifecycle(&opts.config.lifecycle, builder.os(), opts.experimental)
            .await?;
        tracing::debug!(version = %lifecycle.descriptor().version, "lifecycle resolved");

        let buildpacks = self.resolve_buildpacks(opts).await?;
        validate_buildpacks(
            &buildpacks,
            &opts.config.stack.id,
            &build_mixins,
            lifecycle.descriptor(),
        )?;
        validate_order(&opts.config.order, &buildpacks)?;
        tracing::debug!(count = buildpacks.len(), "buildpacks validated");

        self.validate_run_images(opts).await?;

        // Layers: unique buildpacks in declaration order, deduplicated
        // by tar digest, then lifecycle, stack.toml, and order.toml.
        let mut layers_label = BuildpackLayers::new();
        let mut appended: HashSet<String> = HashSet::new();
        for buildpack in &buildpacks {
            let layer = buildpack.layer(work.path())?;
            let descriptor = buildpack.descriptor();
            add_layer_info(
                &mut layers_label,
                buildpack.info(),
                descriptor.api,
                descriptor.stacks.clone(),
                descriptor.order.clone(),
                &layer.diff_id,
            );
            if !appended.insert(layer.diff_id.clone()) {
                tracing::debug!(
                    buildpack = %buildpack.info().full_name(),
                    diff_id = %layer.diff_id,
                    "buildpack layer already present, reusing"
                );
                continue;
            }
            builder.append_layer(&layer.path)?;
        }

        let lifecycle_layer = lifecycle.layer(work.path())?;
        builder.append_layer(&lifecycle_layer.path)?;

        let stack_toml = render_stack_toml(&opts.config.stack)?;
        let stack_layer = write_file_layer(
            stack_toml.as_bytes(),
            Path::new(STACK_PATH),
            &work.path().join("stack.tar"),
        )?;
        builder.append_layer(&stack_layer.path)?;

        let order_toml = render_order_toml(&opts.config.order)?;
        let order_layer = write_file_layer(
            order_toml.as_bytes(),
            Path::new(ORDER_PATH),
            &work.path().join("order.tar"),
        )?;
        builder.append_layer(&order_layer.path)?;

        // Metadata labels.
        let metadata = BuilderMetadata {
            description: opts.config.description.clone(),
            stack: StackMetadata {
                run_image: RunImageMetadata {
                    image: opts.config.stack.run_image.clone(),
                    mirrors: opts.config.stack.run_image_mirrors.clone(),
                },
            },
            lifecycle: LifecycleMetadata {
                version: lifecycle.descriptor().version.to_string(),
                apis: lifecycle.descriptor().apis_metadata(),
                image: None,
            },
            buildpacks: buildpacks.iter().map(|b| b.info().clone()).collect(),
            created_by: CreatedBy::default(),
        };
        builder.set_label(BUILDER_METADATA_LABEL, serde_json::to_string(&metadata)?);
        builder.set_label(
            BUILDPACK_ORDER_LABEL,
            serde_json::to_string(&opts.config.order)?,
        );
        builder.set_label(
            BUILDPACK_LAYERS_LABEL,
            serde_json::to_string(&layers_label)?,
        );

        let builder_ref = ImageReference::parse(&opts.builder_name)?;
        builder.set_reference(builder_ref.clone());

        let digest = if opts.publish {
            builder.push(self.fetcher.registry()).await?
        } else {
            builder.save(self.fetcher.store()).await?.digest
        };

        tracing::info!(reference = %builder_ref, digest = %digest, "builder created");
        Ok(CreatedBuilder {
            reference: builder_ref.full_reference(),
            digest,
        })
    }

    async fn resolve_lifecycle(
        &self,
        config: &LifecycleConfig,
        os: &str,
        experimental: bool,
    ) -> Result<Lifecycle> {
        let blob = if !config.uri.is_empty() {
            if config.uri.starts_with("http://") || config.uri.starts_with("https://") {
                let path = self.downloader.download_archive(&config.uri).await?;
                Blob::from_archive(path)?
            } else if Path::new(&config.uri).is_dir() {
                Blob::from_dir(&config.uri)?
            } else {
                Blob::from_archive(&config.uri)?
            }
        } else {
            if os == "windows" && !experimental {
                return Err(KilnError::Config(
                    "downloading a windows lifecycle requires the experimental flag".to_string(),
                ));
            }
            let version = if config.version.is_empty() {
                DEFAULT_LIFECYCLE_VERSION
            } else {
                &config.version
            };
            let url = lifecycle_url(version, os)?;
            let path = self.downloader.download_archive(&url).await?;
            Blob::from_archive(path)?
        };

        Lifecycle::from_blob(blob)
    }

    /// Resolve every configured buildpack (plus package dependencies)
    /// into a unique, declaration-ordered list. Downloads fan out
    /// concurrently; the downloader bounds how many run at once.
    async fn resolve_buildpacks(&self, opts: &CreateBuilderOptions) -> Result<Vec<Buildpack>> {
        let mut downloads = Vec::with_capacity(opts.config.buildpacks.len());
        for module in &opts.config.buildpacks {
            let reference = BuildpackReference::parse(module.source()?, &opts.base_dir)?;
            let declared = if module.id.is_empty() {
                None
            } else {
                Some(BuildpackInfo {
                    id: module.id.clone(),
                    version: module.version.clone(),
                    ..Default::default()
                })
            };
            let options = DownloadOptions {
                declared,
                pull_policy: opts.pull_policy,
            };
            downloads.push(async move { self.downloader.download(&reference, &options).await });
        }
        let downloaded = futures::future::try_join_all(downloads).await?;

        // Dedup preserves declaration order; the first occurrence wins.
        let mut unique: Vec<Buildpack> = Vec::new();
        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
        for result in downloaded {
            for buildpack in
                std::iter::once(result.buildpack).chain(result.dependencies.into_iter())
            {
                let key = (
                    buildpack.info().id.clone(),
                    buildpack.info().version.clone(),
                );
                if seen.insert(key) {
                    unique.push(buildpack);
                }
            }
        }

        Ok(unique)
    }

    /// The run image and each mirror must advertise the configured
    /// stack id. An unreachable mirror is only a warning.
    async fn validate_run_images(&self, opts: &CreateBuilderOptions) -> Result<()> {
        let run_ref = ImageReference::parse(&opts.config.stack.run_image)?;
        let run_image = self.fetcher.fetch(&run_ref, opts.pull_policy).await?;
        check_stack_label(&run_image, &opts.config.stack.id)?;

        for mirror in &opts.config.stack.run_image_mirrors {
            let mirror_ref = ImageReference::parse(mirror)?;
            match self.fetcher.fetch(&mirror_ref, opts.pull_policy).await {
                Ok(image) => check_stack_label(&image, &opts.config.stack.id)?,
                Err(err) => {
                    tracing::warn!(mirror = %mirror_ref, error = %err, "run-image mirror unavailable");
                }
            }
        }
        Ok(())
    }
}

fn check_stack_label(image: &Image, expected: &str) -> Result<()> {
    let actual = image.label(STACK_ID_LABEL).unwrap_or_default();
    if actual != expected {
        return Err(KilnError::Compatibility(format!(
            "stack '{}' from builder config is incompatible with stack '{}' from run image '{}'",
            expected,
            actual,
            image.reference()
        )));
    }
    Ok(())
}

/// Component buildpacks must support the stack and find their mixins on
/// the build image; every buildpack's API must be one the lifecycle
/// accepts (deprecated APIs warn, unsupported APIs fail).
fn validate_buildpacks(
    buildpacks: &[Buildpack],
    stack_id: &str,
    build_mixins: &BTreeSet<String>,
    lifecycle: &LifecycleDescriptor,
) -> Result<()> {
    for buildpack in buildpacks {
        let descriptor = buildpack.descriptor();
        let name = buildpack.info().full_name();

        match lifecycle.buildpack_api_support(descriptor.api) {
            ApiSupport::Supported => {}
            ApiSupport::Deprecated => {
                tracing::warn!(
                    buildpack = %name,
                    api = %descriptor.api,
                    "buildpack API is deprecated in lifecycle {}",
                    lifecycle.version
                );
            }
            ApiSupport::Unsupported => {
                return Err(KilnError::ApiUnsupported {
                    api: descriptor.api.to_string(),
                    lifecycle: lifecycle.version.to_string(),
                });
            }
        }

        if descriptor.is_meta() {
            continue;
        }

        if !descriptor.supports_stack(stack_id) {
            return Err(KilnError::Compatibility(format!(
                "buildpack '{}' does not support stack '{}'",
                name, stack_id
            )));
        }

        let missing = missing_mixins(
            &descriptor.required_mixins(stack_id),
            build_mixins,
            MixinStage::Build,
        );
        if !missing.is_empty() {
            return Err(KilnError::Compatibility(format!(
                "buildpack '{}' requires missing mixin(s): {}",
                name,
                missing.join(", ")
            )));
        }
    }
    Ok(())
}

/// Every order entry must name a buildpack present in the builder.
fn validate_order(order: &[OrderEntry], buildpacks: &[Buildpack]) -> Result<()> {
    for entry in order {
        for reference in &entry.group {
            let found = buildpacks.iter().any(|b| {
                b.info().id == reference.id
                    && (reference.version.is_empty() || b.info().version == reference.version)
            });
            if !found {
                return Err(KilnError::Config(format!(
                    "no versions of buildpack '{}' were found on the builder",
                    reference.id
                )));
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StackToml {
    #[serde(rename = "run-image")]
    run_image: RunImageToml,
}

#[derive(Serialize)]
struct RunImageToml {
    image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    mirrors: Vec<String>,
}

fn render_stack_toml(stack: &StackConfig) -> Result<String> {
    Ok(toml::to_string_pretty(&StackToml {
        run_image: RunImageToml {
            image: stack.run_image.clone(),
            mirrors: stack.run_image_mirrors.clone(),
        },
    })?)
}

#[derive(Serialize)]
struct OrderToml<'a> {
    order: &'a [OrderEntry],
}

fn render_order_toml(order: &[OrderEntry]) -> Result<String> {
    Ok(toml::to_string_pretty(&OrderToml { order })?)
}
