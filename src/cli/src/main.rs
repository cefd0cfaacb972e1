//! kiln CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("ERROR: {err}");
            // Lifecycle phase failures surface their exit code verbatim;
            // everything else is a user or operational error.
            let code = match &err {
                kiln_core::KilnError::PhaseFailed { exit_code, .. } => {
                    i32::try_from(*exit_code).unwrap_or(1)
                }
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}
