//! kiln build engine.
//!
//! Constructs reproducible container images from application source
//! trees using a buildpack-based pipeline:
//!
//! - [`builder`] fuses buildpacks, a lifecycle, and stack images into a
//!   builder image;
//! - [`package`] turns buildpacks into distributable buildpackages
//!   (images or `.cnb` files);
//! - [`lifecycle`] drives the detect → analyze → restore → build →
//!   export phases (or the single-container creator) against a
//!   container runtime, with [`cache`] managing build and launch caches
//!   and [`rebase`] swapping run-image layers of finished apps.
//!
//! Supporting layers: [`blob`] (deterministic tar streams), [`image`]
//! (mutable image handles over a local store and registries),
//! [`buildpack`] (descriptors, resolution, materialization), and
//! [`memo`] (single-flight task deduplication).

pub mod blob;
pub mod buildpack;
pub mod builder;
pub mod cache;
pub mod image;
pub mod inspect;
pub mod labels;
pub mod lifecycle;
pub mod memo;
pub mod package;
pub mod project;
pub mod rebase;
pub mod runtime;

pub use blob::Blob;
pub use buildpack::{Buildpack, BuildpackDownloader, BuildpackReference};
pub use builder::{BuilderComposer, BuilderConfig, CreateBuilderOptions, CreatedBuilder};
pub use cache::{Cache, CacheKind, CacheManager};
pub use image::{Image, ImageFetcher, ImageReference, ImageStore, PullPolicy, RegistryAuth};
pub use lifecycle::{BuildOutcome, BuildRequest, LifecycleExecutor, NetworkMode};
pub use memo::TaskMemoizer;
pub use package::{BuildpackPackager, PackageConfig, PackageFormat, PackageOptions};
pub use project::ProjectDescriptor;
pub use rebase::{rebase, RebaseOptions, RebasedImage};
pub use runtime::{CliRuntime, ContainerRuntime};
