//! `kiln build`

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use kiln_build::{
    BuildRequest, CliRuntime, LifecycleExecutor, NetworkMode, ProjectDescriptor, PullPolicy,
};
use kiln_core::error::{KilnError, Result};
use tokio_util::sync::CancellationToken;

use super::Context;

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Name of the app image to produce
    pub image: String,

    /// Path to the application source
    #[arg(short = 'p', long = "path", default_value = ".")]
    pub path: PathBuf,

    /// Builder image
    #[arg(short = 'B', long)]
    pub builder: Option<String>,

    /// Additional buildpacks (id, directory, archive, image, or URN)
    #[arg(long = "buildpack")]
    pub buildpacks: Vec<String>,

    /// Run image override
    #[arg(long = "run-image")]
    pub run_image: Option<String>,

    /// Build-time environment (`K=V`, or `K` to forward the host value)
    #[arg(long = "env", short = 'e')]
    pub env: Vec<String>,

    /// Files of `K=V` lines merged beneath --env
    #[arg(long = "env-file")]
    pub env_files: Vec<PathBuf>,

    /// Mounts for every phase (`SRC:DEST[:ro|:rw]`)
    #[arg(long = "volume")]
    pub volumes: Vec<String>,

    /// Network mode: default, none, or host
    #[arg(long, default_value = "default")]
    pub network: String,

    /// Export to a registry instead of the local runtime
    #[arg(long)]
    pub publish: bool,

    /// Additional tags for the exported image
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Cache image reference instead of a local cache volume
    #[arg(long = "cache-image")]
    pub cache_image: Option<String>,

    /// Drop caches before building
    #[arg(long = "clear-cache")]
    pub clear_cache: bool,

    /// Default process type of the produced image
    #[arg(long = "default-process")]
    pub default_process: Option<String>,

    /// Project descriptor path (default: project.toml in the source)
    #[arg(long)]
    pub descriptor: Option<PathBuf>,

    /// always, if-not-present, or never
    #[arg(long = "pull-policy", default_value = "if-not-present")]
    pub pull_policy: String,

    /// Treat the builder as trusted regardless of configuration
    #[arg(long = "trust-builder")]
    pub trust_builder: bool,
}

pub async fn run(context: Context, args: BuildArgs) -> Result<()> {
    let descriptor = load_descriptor(&args)?;

    let builder = args
        .builder
        .clone()
        .or_else(|| {
            descriptor
                .as_ref()
                .filter(|d| !d.build.builder.is_empty())
                .map(|d| d.build.builder.clone())
        })
        .or_else(|| context.config.default_builder.clone())
        .ok_or_else(|| {
            KilnError::Config(
                "no builder specified and no default builder configured".to_string(),
            )
        })?;

    let mut request = BuildRequest::new(&args.image, &builder, args.path.clone());
    request.run_image = args.run_image;
    request.env = args.env;
    request.env_files = args.env_files;
    request.volumes = args.volumes;
    request.network = args.network.parse::<NetworkMode>()?;
    request.publish = args.publish;
    request.tags = args.tags;
    request.cache_image = args.cache_image;
    request.clear_cache = args.clear_cache;
    request.default_process = args.default_process;
    request.pull_policy = args.pull_policy.parse::<PullPolicy>()?;
    request.trusted = args.trust_builder || context.config.is_trusted_builder(&builder);
    request.descriptor = descriptor;
    if let Some(run_image) = &request.run_image {
        if let Some(mirrors) = context.config.mirrors_for(run_image) {
            request.user_mirrors = mirrors.to_vec();
        }
    }
    request.lifecycle_image = context.config.lifecycle_image.clone();

    let runtime = Arc::new(CliRuntime::default());
    let executor = LifecycleExecutor::new(runtime, context.fetcher.clone());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let outcome = executor.execute(&request, cancel).await?;
    println!("Successfully built image '{}'", outcome.app_image);
    Ok(())
}

fn load_descriptor(args: &BuildArgs) -> Result<Option<ProjectDescriptor>> {
    let path = match &args.descriptor {
        Some(path) => path.clone(),
        None => {
            let default = args.path.join("project.toml");
            if !default.exists() {
                return Ok(None);
            }
            default
        }
    };
    ProjectDescriptor::from_path(&path).map(Some)
}
