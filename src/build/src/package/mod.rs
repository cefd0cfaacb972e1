//! Buildpackage construction.
//!
//! Packages one root buildpack plus its declared dependencies into a
//! single distributable: either an image (one layer per unique
//! buildpack, metadata in config labels) or a `.cnb` file holding the
//! same OCI layout serialized into a gzipped tarball.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_core::error::{KilnError, Result};
use serde::Deserialize;
use tempfile::TempDir;

use crate::buildpack::{
    Buildpack, BuildpackDownloader, BuildpackReference, DownloadOptions, Stack, STACK_ANY,
};
use crate::builder::ModuleConfig;
use crate::image::{Image, ImageFetcher, ImageReference, PullPolicy};
use crate::labels::{
    add_layer_info, BuildpackLayers, BuildpackageMetadata, BUILDPACKAGE_METADATA_LABEL,
    BUILDPACK_LAYERS_LABEL,
};

/// Parsed `package.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageConfig {
    pub buildpack: BuildpackUri,
    #[serde(default)]
    pub dependencies: Vec<ModuleConfig>,
    #[serde(default)]
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildpackUri {
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_os")]
    pub os: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self { os: default_os() }
    }
}

fn default_os() -> String {
    "linux".to_string()
}

impl PackageConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: PackageConfig = toml::from_str(&data)
            .map_err(|e| KilnError::Config(format!("invalid {}: {}", path.display(), e)))?;
        if config.buildpack.uri.is_empty() {
            return Err(KilnError::Config(format!(
                "{}: buildpack.uri is required",
                path.display()
            )));
        }
        Ok(config)
    }
}

/// Output shape of a package operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    Image,
    File,
}

impl std::str::FromStr for PackageFormat {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(PackageFormat::Image),
            "file" => Ok(PackageFormat::File),
            other => Err(KilnError::Config(format!(
                "invalid package format '{}' (expected image or file)",
                other
            ))),
        }
    }
}

/// Options for one package operation.
#[derive(Debug, Clone)]
pub struct PackageOptions {
    /// Destination image reference, or file path for `file` format
    pub name: String,
    pub config: PackageConfig,
    /// Base directory for relative URIs
    pub base_dir: PathBuf,
    pub format: PackageFormat,
    pub publish: bool,
    pub pull_policy: PullPolicy,
}

/// The produced package.
#[derive(Debug, Clone)]
pub struct PackagedBuildpack {
    /// Image reference or on-disk path
    pub location: String,
    /// Manifest digest for image-format packages
    pub digest: Option<String>,
}

/// Builds buildpackages.
pub struct BuildpackPackager {
    fetcher: Arc<ImageFetcher>,
    downloader: BuildpackDownloader,
}

impl BuildpackPackager {
    pub fn new(fetcher: Arc<ImageFetcher>, downloader: BuildpackDownloader) -> Self {
        Self {
            fetcher,
            downloader,
        }
    }

    pub async fn package(&self, opts: &PackageOptions) -> Result<PackagedBuildpack> {
        let work = TempDir::new()
            .map_err(|e| KilnError::Runtime(format!("failed to create work dir: {}", e)))?;

        let buildpacks = self.resolve(opts).await?;
        let root_info = buildpacks[0].info().clone();
        let stacks = stack_intersection(&buildpacks)?;

        // One layer per unique buildpack, content-deduplicated.
        let mut image = Image::new(package_reference(opts)?);
        let mut layers_label = BuildpackLayers::new();
        let mut appended: BTreeSet<String> = BTreeSet::new();
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
            if appended.insert(layer.diff_id.clone()) {
                image.append_layer(&layer.path)?;
            }
        }

        let metadata = BuildpackageMetadata {
            id: root_info.id.clone(),
            version: root_info.version.clone(),
            stacks,
            homepage: root_info.homepage.clone(),
        };
        image.set_label(BUILDPACKAGE_METADATA_LABEL, serde_json::to_string(&metadata)?);
        image.set_label(BUILDPACK_LAYERS_LABEL, serde_json::to_string(&layers_label)?);

        match opts.format {
            PackageFormat::Image => {
                let digest = if opts.publish {
                    image.push(self.fetcher.registry()).await?
                } else {
                    image.save(self.fetcher.store()).await?.digest
                };
                tracing::info!(reference = %image.reference(), digest = %digest, "buildpackage created");
                Ok(PackagedBuildpack {
                    location: image.reference().full_reference(),
                    digest: Some(digest),
                })
            }
            PackageFormat::File => {
                let dest = normalize_cnb_extension(Path::new(&opts.name));
                let layout = work.path().join("layout");
                image.write_layout(&layout)?;
                write_layout_archive(&layout, &dest)?;
                tracing::info!(path = %dest.display(), "buildpackage file created");
                Ok(PackagedBuildpack {
                    location: dest.display().to_string(),
                    digest: None,
                })
            }
        }
    }

    /// Root buildpack first, then dependencies, unique by identity.
    /// All references download concurrently under the downloader's
    /// parallelism bound.
    async fn resolve(&self, opts: &PackageOptions) -> Result<Vec<Buildpack>> {
        let download_opts = DownloadOptions {
            declared: None,
            pull_policy: opts.pull_policy,
        };

        let mut references =
            vec![BuildpackReference::parse(&opts.config.buildpack.uri, &opts.base_dir)?];
        for dependency in &opts.config.dependencies {
            references.push(BuildpackReference::parse(dependency.source()?, &opts.base_dir)?);
        }

        let downloads = references.into_iter().map(|reference| {
            let options = download_opts.clone();
            async move { self.downloader.download(&reference, &options).await }
        });
        let downloaded = futures::future::try_join_all(downloads).await?;

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
}

fn package_reference(opts: &PackageOptions) -> Result<ImageReference> {
    match opts.format {
        PackageFormat::Image => ImageReference::parse(&opts.name),
        // File packages never hit a registry; the reference is only a
        // config identity.
        PackageFormat::File => ImageReference::parse("kiln/package"),
    }
}

/// Stack ids supported by every component buildpack. A wildcard entry
/// places no constraint; mixins for a surviving id are the union of all
/// declarations.
fn stack_intersection(buildpacks: &[Buildpack]) -> Result<Vec<Stack>> {
    let components: Vec<&Buildpack> = buildpacks
        .iter()
        .filter(|b| !b.descriptor().is_meta())
        .collect();
    if components.is_empty() {
        return Ok(Vec::new());
    }

    let mut ids: Option<BTreeSet<String>> = None;
    for buildpack in &components {
        let declared: BTreeSet<String> = buildpack
            .descriptor()
            .stacks
            .iter()
            .map(|s| s.id.clone())
            .collect();
        if declared.contains(STACK_ANY) {
            continue;
        }
        ids = Some(match ids {
            None => declared,
            Some(existing) => existing.intersection(&declared).cloned().collect(),
        });
    }

    let ids = match ids {
        // Every buildpack declared the wildcard.
        None => return Ok(vec![Stack {
            id: STACK_ANY.to_string(),
            mixins: Vec::new(),
        }]),
        Some(ids) => ids,
    };
    if ids.is_empty() {
        return Err(KilnError::IncompatibleStacks);
    }

    Ok(ids
        .into_iter()
        .map(|id| {
            let mut mixins: BTreeSet<String> = BTreeSet::new();
            for buildpack in &components {
                mixins.extend(
                    buildpack
                        .descriptor()
                        .required_mixins(&id)
                        .into_iter(),
                );
            }
            Stack {
                id,
                mixins: mixins.into_iter().collect(),
            }
        })
        .collect())
}

/// `.cnb` is the canonical extension: an empty extension becomes `.cnb`,
/// anything else is kept with a warning.
fn normalize_cnb_extension(path: &Path) -> PathBuf {
    match path.extension() {
        None => path.with_extension("cnb"),
        Some(ext) if ext == "cnb" => path.to_path_buf(),
        Some(ext) => {
            tracing::warn!(
                path = %path.display(),
                extension = %ext.to_string_lossy(),
                "buildpackage files conventionally use the .cnb extension"
            );
            path.to_path_buf()
        }
    }
}

/// Serialize an OCI layout directory into a gzipped tarball.
fn write_layout_archive(layout: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KilnError::Runtime(format!("failed to create {}: {}", parent.display(), e)))?;
        }
    }

    let staging = tempfile::NamedTempFile::new()
        .map_err(|e| KilnError::Runtime(format!("failed to stage package file: {}", e)))?;
    crate::blob::write_dir_layer(layout, Path::new(""), staging.path())?;

    let out = std::fs::File::create(dest)
        .map_err(|e| KilnError::Runtime(format!("failed to create {}: {}", dest.display(), e)))?;
    let mut encoder = GzEncoder::new(out, Compression::default());
    let mut tar_file = std::fs::File::open(staging.path())
        .map_err(|e| KilnError::Runtime(format!("failed to read staged package: {}", e)))?;
    std::io::copy(&mut tar_file, &mut encoder)
        .map_err(|e| KilnError::Runtime(format!("failed to compress package: {}", e)))?;
    encoder
        .finish()
        .and_then(|mut f| f.flush().map(|_| ()))
        .map_err(|e| KilnError::Runtime(format!("failed to finalize {}: {}", dest.display(), e)))?;

    Ok(())
}
