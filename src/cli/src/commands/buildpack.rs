//! `kiln buildpack`

use std::path::PathBuf;

use clap::{Args, Subcommand};
use kiln_build::inspect::inspect_buildpack;
use kiln_build::package::{BuildpackPackager, PackageConfig, PackageFormat, PackageOptions};
use kiln_build::PullPolicy;
use kiln_core::error::Result;

use super::Context;

#[derive(Debug, Subcommand)]
pub enum BuildpackCommand {
    /// Package a buildpack as an image or a .cnb file
    Package(PackageArgs),
    /// Show the contents of a buildpackage
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
pub struct PackageArgs {
    /// Destination image name, or file path with --format file
    pub name: String,

    /// Path to package.toml
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// image or file
    #[arg(long, default_value = "image")]
    pub format: String,

    /// Push to the registry instead of saving locally
    #[arg(long)]
    pub publish: bool,

    /// always, if-not-present, or never
    #[arg(long = "pull-policy", default_value = "if-not-present")]
    pub pull_policy: String,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Buildpackage image to inspect
    pub name: String,

    /// always, if-not-present, or never
    #[arg(long = "pull-policy", default_value = "if-not-present")]
    pub pull_policy: String,
}

pub async fn run(context: Context, command: BuildpackCommand) -> Result<()> {
    match command {
        BuildpackCommand::Package(args) => package(context, args).await,
        BuildpackCommand::Inspect(args) => inspect(context, args).await,
    }
}

async fn package(context: Context, args: PackageArgs) -> Result<()> {
    let config = PackageConfig::from_path(&args.config)?;
    let base_dir = args
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let packager = BuildpackPackager::new(context.fetcher.clone(), context.downloader());
    let packaged = packager
        .package(&PackageOptions {
            name: args.name,
            config,
            base_dir,
            format: args.format.parse::<PackageFormat>()?,
            publish: args.publish,
            pull_policy: args.pull_policy.parse::<PullPolicy>()?,
        })
        .await?;

    println!("Successfully created package '{}'", packaged.location);
    Ok(())
}

async fn inspect(context: Context, args: InspectArgs) -> Result<()> {
    let inspection = inspect_buildpack(
        &context.fetcher,
        &args.name,
        args.pull_policy.parse::<PullPolicy>()?,
    )
    .await?;

    println!("Buildpackage: {}", args.name);
    println!(
        "Root buildpack: {}@{}",
        inspection.metadata.id, inspection.metadata.version
    );
    if !inspection.metadata.stacks.is_empty() {
        let stacks: Vec<&str> = inspection
            .metadata
            .stacks
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        println!("Stacks: {}", stacks.join(", "));
    }
    println!("Contains:");
    for buildpack in &inspection.buildpacks {
        println!("  {}@{}", buildpack.id, buildpack.version);
    }

    Ok(())
}
