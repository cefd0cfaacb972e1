//! `kiln rebase`

use clap::Args;
use kiln_build::rebase::{rebase, RebaseOptions};
use kiln_build::PullPolicy;
use kiln_core::error::Result;

use super::Context;

#[derive(Debug, Args)]
pub struct RebaseArgs {
    /// App image to rebase
    pub image: String,

    /// New run image; defaults to the recorded one (or a mirror)
    #[arg(long = "run-image")]
    pub run_image: Option<String>,

    /// Push the rebased image to the registry
    #[arg(long)]
    pub publish: bool,

    /// always, if-not-present, or never
    #[arg(long = "pull-policy", default_value = "if-not-present")]
    pub pull_policy: String,
}

pub async fn run(context: Context, args: RebaseArgs) -> Result<()> {
    let rebased = rebase(
        &context.fetcher,
        &context.config,
        &RebaseOptions {
            app_image: args.image,
            run_image: args.run_image,
            publish: args.publish,
            pull_policy: args.pull_policy.parse::<PullPolicy>()?,
        },
    )
    .await?;

    println!("Successfully rebased image '{}'", rebased.reference);
    Ok(())
}
