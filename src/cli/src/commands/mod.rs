//! Command definitions and dispatch.

mod build;
mod builder;
mod buildpack;
mod rebase;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kiln_build::{BuildpackDownloader, ImageFetcher, ImageStore, RegistryAuth, TaskMemoizer};
use kiln_core::config::{default_config_path, kiln_home, UserConfig};
use kiln_core::error::{KilnError, Result};

pub use self::build::BuildArgs;
pub use self::builder::BuilderCommand;
pub use self::buildpack::BuildpackCommand;
pub use self::rebase::RebaseArgs;

/// Build container images with buildpacks.
#[derive(Debug, Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build an app image from source
    Build(BuildArgs),
    /// Builder operations
    #[command(subcommand)]
    Builder(BuilderCommand),
    /// Buildpack operations
    #[command(subcommand)]
    Buildpack(BuildpackCommand),
    /// Rebase an app image onto a newer run image
    Rebase(RebaseArgs),
}

/// Shared command context: user config plus the image plumbing.
pub(crate) struct Context {
    pub config: UserConfig,
    pub fetcher: Arc<ImageFetcher>,
    pub work_dir: PathBuf,
    /// One memoizer per invocation; its cleanup hooks run when the
    /// command finishes.
    pub memo: Arc<TaskMemoizer>,
}

impl Context {
    pub fn new() -> Result<Self> {
        let home = kiln_home()?;
        let config = UserConfig::load(&default_config_path()?)?;

        let store = Arc::new(ImageStore::new(&home.join("images"))?);
        let fetcher = Arc::new(ImageFetcher::new(
            store,
            kiln_build::image::RegistryClient::new(RegistryAuth::from_env()),
        ));

        let work_dir = home.join("work");
        std::fs::create_dir_all(&work_dir).map_err(|e| {
            KilnError::Config(format!("failed to create {}: {}", work_dir.display(), e))
        })?;

        Ok(Self {
            config,
            fetcher,
            work_dir,
            memo: Arc::new(TaskMemoizer::new()),
        })
    }

    pub fn downloader(&self) -> BuildpackDownloader {
        BuildpackDownloader::new(self.fetcher.clone(), self.work_dir.clone())
            .with_memoizer(self.memo.clone())
    }
}

/// Run the selected command, then release everything the memoizer
/// deferred.
pub async fn dispatch(cli: Cli) -> Result<()> {
    let context = Context::new()?;
    let memo = context.memo.clone();

    let result = match cli.command {
        Commands::Build(args) => build::run(context, args).await,
        Commands::Builder(command) => builder::run(context, command).await,
        Commands::Buildpack(command) => buildpack::run(context, command).await,
        Commands::Rebase(args) => rebase::run(context, args).await,
    };

    let cleanup = memo.cleanup();
    result.and(cleanup)
}
