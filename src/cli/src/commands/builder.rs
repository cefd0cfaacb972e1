//! `kiln builder`

use std::path::PathBuf;

use clap::{Args, Subcommand};
use kiln_build::builder::{BuilderComposer, BuilderConfig, CreateBuilderOptions};
use kiln_build::inspect::{inspect_builder, render_order};
use kiln_build::labels::BuildpackLayers;
use kiln_build::PullPolicy;
use kiln_core::error::Result;

use super::Context;

#[derive(Debug, Subcommand)]
pub enum BuilderCommand {
    /// Compose a builder image from a builder.toml
    Create(CreateArgs),
    /// Show the structure of a builder
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Name for the created builder image
    pub name: String,

    /// Path to builder.toml
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Push to the registry instead of saving locally
    #[arg(long)]
    pub publish: bool,

    /// always, if-not-present, or never
    #[arg(long = "pull-policy", default_value = "if-not-present")]
    pub pull_policy: String,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Builder image to inspect
    pub name: String,

    /// Levels of nested detection order to expand
    #[arg(long, default_value_t = 2)]
    pub depth: usize,

    /// always, if-not-present, or never
    #[arg(long = "pull-policy", default_value = "if-not-present")]
    pub pull_policy: String,
}

pub async fn run(context: Context, command: BuilderCommand) -> Result<()> {
    match command {
        BuilderCommand::Create(args) => create(context, args).await,
        BuilderCommand::Inspect(args) => inspect(context, args).await,
    }
}

async fn create(context: Context, args: CreateArgs) -> Result<()> {
    let config = BuilderConfig::from_path(&args.config)?;
    let base_dir = args
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let composer = BuilderComposer::new(context.fetcher.clone(), context.downloader());
    let created = composer
        .create(&CreateBuilderOptions {
            builder_name: args.name,
            config,
            base_dir,
            publish: args.publish,
            pull_policy: args.pull_policy.parse::<PullPolicy>()?,
            experimental: context.config.experimental,
        })
        .await?;

    println!("Successfully created builder image '{}'", created.reference);
    Ok(())
}

async fn inspect(context: Context, args: InspectArgs) -> Result<()> {
    let inspection = inspect_builder(
        &context.fetcher,
        &args.name,
        args.pull_policy.parse::<PullPolicy>()?,
        &context.config,
    )
    .await?;

    println!("Builder: {}", args.name);
    if !inspection.description.is_empty() {
        println!("Description: {}", inspection.description);
    }
    println!("Trusted: {}", if inspection.trusted { "yes" } else { "no" });
    println!("Stack: {}", inspection.stack_id);
    if !inspection.mixins.is_empty() {
        println!("Mixins: {}", inspection.mixins.join(", "));
    }
    println!("Lifecycle version: {}", inspection.lifecycle_version);
    println!("Run image: {}", inspection.run_image);
    for mirror in &inspection.run_image_mirrors {
        println!("  mirror: {}", mirror);
    }

    println!("Buildpacks:");
    for buildpack in &inspection.buildpacks {
        println!("  {}@{}", buildpack.id, buildpack.version);
    }

    println!("Detection order:");
    // Nested order detail comes from the layers label when present.
    let layers = BuildpackLayers::new();
    for line in render_order(&inspection.order, &layers, args.depth) {
        println!("  {}", line);
    }

    Ok(())
}
