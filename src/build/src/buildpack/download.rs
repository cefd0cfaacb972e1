//! Buildpack reference resolution.
//!
//! A reference names a buildpack by local directory, local archive, URL,
//! image, or registry URN. Image-shaped sources (including `.cnb` files,
//! which are OCI layouts in a tarball) may hold several buildpacks; the
//! downloader yields the top-level one plus every contained dependency.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::error::{KilnError, Result};
use tokio::sync::Semaphore;

use crate::blob::{sha256_bytes, Blob};
use crate::image::{ImageFetcher, ImageReference, PullPolicy};
use crate::labels::{BuildpackageMetadata, BUILDPACKAGE_METADATA_LABEL};
use crate::memo::{task_key, TaskMemoizer};

use super::registry::{is_registry_urn, RegistryIndex, RegistryUrn};
use super::{Buildpack, BuildpackInfo};

/// Concurrent downloads allowed per downloader.
const DEFAULT_PARALLELISM: usize = 4;

/// A resolvable buildpack reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildpackReference {
    /// A buildpack directory on disk
    Dir(PathBuf),
    /// A `.tgz`/`.tar` archive, or a `.cnb` file
    Archive(PathBuf),
    /// An archive behind a URL
    Http(String),
    /// A buildpackage image
    Image(String),
    /// A registry URN (`urn:cnb:registry:...`)
    RegistryUrn(RegistryUrn),
}

impl BuildpackReference {
    /// Classify a raw reference string. Relative paths are resolved
    /// against `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        if raw.is_empty() {
            return Err(KilnError::Config("empty buildpack reference".to_string()));
        }
        if is_registry_urn(raw) {
            return Ok(Self::RegistryUrn(RegistryUrn::parse(raw)?));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Self::Http(raw.to_string()));
        }

        let path = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            base_dir.join(raw)
        };
        if path.is_dir() {
            return Ok(Self::Dir(path));
        }
        if path.is_file() {
            return Ok(Self::Archive(path));
        }

        // Not on disk; must be an image reference.
        Ok(Self::Image(raw.to_string()))
    }
}

impl std::fmt::Display for BuildpackReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dir(path) | Self::Archive(path) => write!(f, "{}", path.display()),
            Self::Http(url) => write!(f, "{}", url),
            Self::Image(image) => write!(f, "{}", image),
            Self::RegistryUrn(urn) => write!(f, "{}", urn.to_urn()),
        }
    }
}

/// Options for one download.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Identity the caller declared; mismatch with the downloaded
    /// buildpack is an error
    pub declared: Option<BuildpackInfo>,
    /// Pull policy for image-shaped references
    pub pull_policy: PullPolicy,
}

/// A resolved buildpack with its transitive dependencies.
#[derive(Debug)]
pub struct DownloadedBuildpack {
    pub buildpack: Buildpack,
    pub dependencies: Vec<Buildpack>,
}

/// Resolves buildpack references to concrete buildpacks.
pub struct BuildpackDownloader {
    fetcher: Arc<ImageFetcher>,
    http: reqwest::Client,
    registry_index: Option<RegistryIndex>,
    /// Downloaded archives and extracted layouts live here; the caller
    /// owns the directory's lifetime.
    work_dir: PathBuf,
    semaphore: Arc<Semaphore>,
    /// Deduplicates archive transfers across concurrent callers and
    /// collects cleanup for extracted package layouts.
    memo: Arc<TaskMemoizer>,
}

impl BuildpackDownloader {
    pub fn new(fetcher: Arc<ImageFetcher>, work_dir: PathBuf) -> Self {
        Self {
            fetcher,
            http: reqwest::Client::new(),
            registry_index: None,
            work_dir,
            semaphore: Arc::new(Semaphore::new(DEFAULT_PARALLELISM)),
            memo: Arc::new(TaskMemoizer::new()),
        }
    }

    /// Configure a buildpack registry index for URN resolution.
    pub fn with_registry_index(mut self, index: RegistryIndex) -> Self {
        self.registry_index = Some(index);
        self
    }

    /// Share a memoizer owned by the caller, so cleanup hooks run at a
    /// well-defined shutdown point.
    pub fn with_memoizer(mut self, memo: Arc<TaskMemoizer>) -> Self {
        self.memo = memo;
        self
    }

    pub fn memoizer(&self) -> &Arc<TaskMemoizer> {
        &self.memo
    }

    /// Resolve a reference to a buildpack (plus contained dependencies
    /// for image-shaped sources).
    pub async fn download(
        &self,
        reference: &BuildpackReference,
        opts: &DownloadOptions,
    ) -> Result<DownloadedBuildpack> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| KilnError::Cancelled)?;

        tracing::debug!(reference = %reference, "resolving buildpack");

        let downloaded = match reference {
            BuildpackReference::Dir(path) => {
                let buildpack = Buildpack::from_blob(Blob::from_dir(path)?)?;
                DownloadedBuildpack {
                    buildpack,
                    dependencies: Vec::new(),
                }
            }
            BuildpackReference::Archive(path) => self.from_archive(path)?,
            BuildpackReference::Http(url) => {
                let path = self.download_archive(url).await?;
                self.from_archive(&path)?
            }
            BuildpackReference::Image(image) => {
                self.from_image(image, opts.pull_policy).await?
            }
            BuildpackReference::RegistryUrn(urn) => {
                let index = self.registry_index.as_ref().ok_or_else(|| {
                    KilnError::Resolution {
                        reference: urn.to_urn(),
                        message: "no buildpack registry configured".to_string(),
                    }
                })?;
                let image = index.lookup(urn)?;
                self.from_image(&image, opts.pull_policy).await?
            }
        };

        if let Some(declared) = &opts.declared {
            let actual = downloaded.buildpack.info();
            let id_differs = actual.id != declared.id;
            let version_differs =
                !declared.version.is_empty() && actual.version != declared.version;
            if id_differs || version_differs {
                return Err(KilnError::IdVersionMismatch {
                    declared: declared.full_name(),
                    actual: actual.full_name(),
                });
            }
        }

        Ok(downloaded)
    }

    /// An archive is either a plain buildpack tarball or a `.cnb` file
    /// (an OCI layout in a tarball).
    fn from_archive(&self, path: &Path) -> Result<DownloadedBuildpack> {
        let blob = Blob::from_archive(path)?;
        if archive_holds_oci_layout(&blob)? {
            let layout_dir = self
                .work_dir
                .join(format!("layout-{}", blob.raw_digest()?));
            if !layout_dir.exists() {
                std::fs::create_dir_all(&layout_dir).map_err(|e| {
                    KilnError::Runtime(format!("failed to extract package: {}", e))
                })?;
                let mut archive = tar::Archive::new(blob.open()?);
                archive
                    .unpack(&layout_dir)
                    .map_err(|e| KilnError::BadOciLayout(format!("{}: {}", path.display(), e)))?;

                // Extracted layouts are working state; drop them at
                // shutdown.
                let cleanup_dir = layout_dir.clone();
                self.memo.defer(
                    format!("extracted layout {}", cleanup_dir.display()),
                    move || match std::fs::remove_dir_all(&cleanup_dir) {
                        Ok(()) => Ok(()),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(err) => Err(KilnError::Io(err)),
                    },
                );
            }
            return self.from_layout(&layout_dir, &path.display().to_string());
        }

        Ok(DownloadedBuildpack {
            buildpack: Buildpack::from_blob(blob)?,
            dependencies: Vec::new(),
        })
    }

    async fn from_image(&self, image: &str, policy: PullPolicy) -> Result<DownloadedBuildpack> {
        let reference = ImageReference::parse(image)?;
        let stored = self.fetcher.fetch_stored(&reference, policy).await?;
        self.from_layout(&stored.path, image)
    }

    /// Pull every buildpack out of a buildpackage layout. The one named
    /// by the package metadata is the top-level buildpack; the rest are
    /// dependencies.
    fn from_layout(&self, layout: &Path, origin: &str) -> Result<DownloadedBuildpack> {
        let image = crate::image::Image::from_layout(ImageReference::parse("kiln/package")?, layout)?;
        let metadata_label =
            image
                .label(BUILDPACKAGE_METADATA_LABEL)
                .ok_or_else(|| KilnError::Resolution {
                    reference: origin.to_string(),
                    message: format!("image has no {} label", BUILDPACKAGE_METADATA_LABEL),
                })?;
        let metadata: BuildpackageMetadata = serde_json::from_str(metadata_label)?;

        let mut main = None;
        let mut dependencies = Vec::new();
        for digest in layer_digests(layout)? {
            let blob = Blob::from_oci_blob(layout, &digest)?;
            let buildpack = Buildpack::from_blob(blob)?;
            if buildpack.info().id == metadata.id && buildpack.info().version == metadata.version {
                main = Some(buildpack);
            } else {
                dependencies.push(buildpack);
            }
        }

        let buildpack = main.ok_or_else(|| KilnError::Resolution {
            reference: origin.to_string(),
            message: format!(
                "package metadata names '{}@{}' but no layer holds it",
                metadata.id, metadata.version
            ),
        })?;

        Ok(DownloadedBuildpack {
            buildpack,
            dependencies,
        })
    }

    /// Download a URL into the work directory. Repeated and concurrent
    /// requests for the same URL share a single transfer through the
    /// memoizer. Also used for lifecycle archives.
    pub async fn download_archive(&self, url: &str) -> Result<PathBuf> {
        let key = task_key("archive", &[url]);
        let path = self
            .memo
            .run_once(&key, || async {
                let target = self
                    .work_dir
                    .join(format!("download-{}", sha256_bytes(url.as_bytes())));
                if !target.exists() {
                    self.fetch_archive(url, &target).await?;
                }
                Ok(target.display().to_string())
            })
            .await?;
        Ok(PathBuf::from(path))
    }

    async fn fetch_archive(&self, url: &str, target: &Path) -> Result<()> {
        tracing::info!(url = %url, "downloading buildpack archive");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| KilnError::Resolution {
                reference: url.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(KilnError::Resolution {
                reference: url.to_string(),
                message: format!("server returned {}", response.status()),
            });
        }
        let body = response.bytes().await.map_err(|e| KilnError::Resolution {
            reference: url.to_string(),
            message: e.to_string(),
        })?;

        std::fs::write(target, &body)
            .map_err(|e| KilnError::Runtime(format!("failed to write download: {}", e)))?;
        Ok(())
    }
}

/// Whether an archive's root holds an OCI layout marker.
fn archive_holds_oci_layout(blob: &Blob) -> Result<bool> {
    let mut archive = tar::Archive::new(blob.open()?);
    for entry in archive
        .entries()
        .map_err(|e| KilnError::NotArchive(e.to_string()))?
    {
        let entry = entry.map_err(|e| KilnError::NotArchive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| KilnError::NotArchive(e.to_string()))?;
        if path.as_ref() == Path::new("oci-layout") || path.as_ref() == Path::new("./oci-layout") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Layer blob digests of the single manifest in a layout.
fn layer_digests(layout: &Path) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(layout.join("index.json"))
            .map_err(|e| KilnError::BadOciLayout(format!("{}: {}", layout.display(), e)))?,
    )?;
    let manifest_digest = index["manifests"][0]["digest"]
        .as_str()
        .ok_or_else(|| KilnError::BadOciLayout(format!("no manifests in {}", layout.display())))?;

    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(crate::blob::oci_blob_path(layout, manifest_digest))
            .map_err(|e| KilnError::BadOciLayout(format!("missing manifest blob: {}", e)))?,
    )?;

    manifest["layers"]
        .as_array()
        .ok_or_else(|| KilnError::BadOciLayout("manifest has no layers".to_string()))?
        .iter()
        .map(|layer| {
            layer["digest"]
                .as_str()
                .map(String::from)
                .ok_or_else(|| KilnError::BadOciLayout("layer without digest".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::write_file_layer;
    use crate::image::{Image, ImageStore, RegistryAuth, RegistryClient};
    use tempfile::TempDir;

    fn downloader(tmp: &TempDir) -> BuildpackDownloader {
        let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
        let fetcher = Arc::new(ImageFetcher::new(
            store,
            RegistryClient::new(RegistryAuth::anonymous()),
        ));
        let work_dir = tmp.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        BuildpackDownloader::new(fetcher, work_dir)
    }

    fn write_simple_buildpack(dir: &Path) {
        crate::buildpack::tests::write_buildpack_dir(
            dir,
            crate::buildpack::tests::SIMPLE_DESCRIPTOR,
        );
    }

    #[test]
    fn test_parse_reference_kinds() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("bp");
        std::fs::create_dir_all(&dir).unwrap();
        let archive = tmp.path().join("bp.tgz");
        std::fs::write(&archive, "x").unwrap();

        assert!(matches!(
            BuildpackReference::parse("bp", tmp.path()).unwrap(),
            BuildpackReference::Dir(_)
        ));
        assert!(matches!(
            BuildpackReference::parse("bp.tgz", tmp.path()).unwrap(),
            BuildpackReference::Archive(_)
        ));
        assert!(matches!(
            BuildpackReference::parse("https://example.test/bp.tgz", tmp.path()).unwrap(),
            BuildpackReference::Http(_)
        ));
        assert!(matches!(
            BuildpackReference::parse("urn:cnb:registry:example/bp@1.0.0", tmp.path()).unwrap(),
            BuildpackReference::RegistryUrn(_)
        ));
        assert!(matches!(
            BuildpackReference::parse("ghcr.io/example/bp:1.0.0", tmp.path()).unwrap(),
            BuildpackReference::Image(_)
        ));
        assert!(BuildpackReference::parse("", tmp.path()).is_err());
    }

    #[tokio::test]
    async fn test_download_from_dir() {
        let tmp = TempDir::new().unwrap();
        let bp_dir = tmp.path().join("bp");
        write_simple_buildpack(&bp_dir);

        let downloader = downloader(&tmp);
        let downloaded = downloader
            .download(
                &BuildpackReference::Dir(bp_dir),
                &DownloadOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(downloaded.buildpack.info().id, "simple/layers");
        assert!(downloaded.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_download_id_version_mismatch() {
        let tmp = TempDir::new().unwrap();
        let bp_dir = tmp.path().join("bp");
        write_simple_buildpack(&bp_dir);

        let downloader = downloader(&tmp);
        let opts = DownloadOptions {
            declared: Some(BuildpackInfo {
                id: "simple/layers".to_string(),
                version: "9.9.9".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = downloader
            .download(&BuildpackReference::Dir(bp_dir), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::IdVersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_download_declared_without_version_matches() {
        let tmp = TempDir::new().unwrap();
        let bp_dir = tmp.path().join("bp");
        write_simple_buildpack(&bp_dir);

        let downloader = downloader(&tmp);
        let opts = DownloadOptions {
            declared: Some(BuildpackInfo {
                id: "simple/layers".to_string(),
                version: String::new(),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(downloader
            .download(&BuildpackReference::Dir(bp_dir), &opts)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_download_from_package_image() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());

        // Bake a buildpackage layout by hand: one buildpack layer plus
        // the metadata label.
        let bp_dir = tmp.path().join("bp");
        write_simple_buildpack(&bp_dir);
        let bp = Buildpack::from_blob(Blob::from_dir(&bp_dir).unwrap()).unwrap();
        let layer_dir = tmp.path().join("layers");
        std::fs::create_dir_all(&layer_dir).unwrap();
        let layer = bp.layer(&layer_dir).unwrap();

        let reference = ImageReference::parse("example/package:1.0").unwrap();
        let mut image = Image::new(reference.clone());
        image.append_layer(&layer.path).unwrap();
        image.set_label(
            BUILDPACKAGE_METADATA_LABEL,
            r#"{"id":"simple/layers","version":"0.0.1","stacks":[{"id":"pack.test.stack"}]}"#,
        );
        image.save(&store).await.unwrap();

        let fetcher = Arc::new(ImageFetcher::new(
            store,
            RegistryClient::new(RegistryAuth::anonymous()),
        ));
        let work_dir = tmp.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        let downloader = BuildpackDownloader::new(fetcher, work_dir);

        let opts = DownloadOptions {
            pull_policy: PullPolicy::Never,
            ..Default::default()
        };
        let downloaded = downloader
            .download(
                &BuildpackReference::Image("example/package:1.0".to_string()),
                &opts,
            )
            .await
            .unwrap();

        assert_eq!(downloaded.buildpack.info().id, "simple/layers");
        assert!(downloaded.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_download_urn_without_index_fails() {
        let tmp = TempDir::new().unwrap();
        let downloader = downloader(&tmp);
        let urn = RegistryUrn::parse("urn:cnb:registry:example/bp@1.0.0").unwrap();

        let err = downloader
            .download(
                &BuildpackReference::RegistryUrn(urn),
                &DownloadOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_downloads_resolve_under_the_bound() {
        let tmp = TempDir::new().unwrap();
        let bp_dir = tmp.path().join("bp");
        write_simple_buildpack(&bp_dir);
        let downloader = downloader(&tmp);

        // More callers than permits; all resolve.
        let reference = BuildpackReference::Dir(bp_dir);
        let opts = DownloadOptions::default();
        let results = futures::future::try_join_all(
            (0..8).map(|_| downloader.download(&reference, &opts)),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 8);
        for downloaded in &results {
            assert_eq!(downloaded.buildpack.info().id, "simple/layers");
        }
    }

    #[tokio::test]
    async fn test_cnb_extraction_cleaned_up_by_memoizer() {
        let tmp = TempDir::new().unwrap();

        // Bake a .cnb: an OCI layout with one buildpack layer, tarred.
        let bp_dir = tmp.path().join("bp");
        write_simple_buildpack(&bp_dir);
        let bp = Buildpack::from_blob(Blob::from_dir(&bp_dir).unwrap()).unwrap();
        let layer_dir = tmp.path().join("layers");
        std::fs::create_dir_all(&layer_dir).unwrap();
        let layer = bp.layer(&layer_dir).unwrap();

        let mut image = Image::new(ImageReference::parse("example/package:1.0").unwrap());
        image.append_layer(&layer.path).unwrap();
        image.set_label(
            BUILDPACKAGE_METADATA_LABEL,
            r#"{"id":"simple/layers","version":"0.0.1","stacks":[{"id":"pack.test.stack"}]}"#,
        );
        let layout = tmp.path().join("layout");
        image.write_layout(&layout).unwrap();
        let cnb = tmp.path().join("package.cnb");
        crate::blob::write_dir_layer(&layout, Path::new(""), &cnb).unwrap();

        let downloader = downloader(&tmp);
        let downloaded = downloader
            .download(
                &BuildpackReference::Archive(cnb),
                &DownloadOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(downloaded.buildpack.info().id, "simple/layers");

        let extracted_count = || {
            std::fs::read_dir(tmp.path().join("work"))
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("layout-"))
                .count()
        };
        assert_eq!(extracted_count(), 1);

        // The deferred hook removes the extracted layout exactly once.
        downloader.memoizer().cleanup().unwrap();
        assert_eq!(extracted_count(), 0);
        downloader.memoizer().cleanup().unwrap();
    }

    #[test]
    fn test_archive_holds_oci_layout() {
        let tmp = TempDir::new().unwrap();

        // A plain buildpack archive does not.
        let plain = tmp.path().join("plain.tar");
        write_file_layer(b"api = \"0.6\"", Path::new("buildpack.toml"), &plain).unwrap();
        assert!(!archive_holds_oci_layout(&Blob::from_archive(&plain).unwrap()).unwrap());

        // A cnb-style archive does.
        let cnb = tmp.path().join("package.cnb");
        write_file_layer(
            br#"{"imageLayoutVersion":"1.0.0"}"#,
            Path::new("oci-layout"),
            &cnb,
        )
        .unwrap();
        assert!(archive_holds_oci_layout(&Blob::from_archive(&cnb).unwrap()).unwrap());
    }
}
