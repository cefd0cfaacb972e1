//! App image rebasing.
//!
//! Swaps the run-image layer chain of a previously exported app image
//! for a newer run image's layers, leaving app and buildpack layers
//! untouched. The old run image is discovered from the app image's
//! lifecycle metadata label; the new one comes from an explicit
//! override, a registry-local mirror, or the same reference re-fetched.

use std::sync::Arc;

use kiln_core::config::UserConfig;
use kiln_core::error::{KilnError, Result};

use crate::image::{ImageFetcher, ImageReference, PullPolicy};
use crate::labels::LIFECYCLE_METADATA_LABEL;

/// Options for one rebase.
#[derive(Debug, Clone)]
pub struct RebaseOptions {
    pub app_image: String,
    /// New run image; defaults to the recorded one (or a mirror on the
    /// app's registry)
    pub run_image: Option<String>,
    pub publish: bool,
    pub pull_policy: PullPolicy,
}

/// The rebased image.
#[derive(Debug, Clone)]
pub struct RebasedImage {
    pub reference: String,
    pub digest: String,
}

/// Rebase `opts.app_image` onto a new run image.
pub async fn rebase(
    fetcher: &Arc<ImageFetcher>,
    config: &UserConfig,
    opts: &RebaseOptions,
) -> Result<RebasedImage> {
    let app_ref = ImageReference::parse(&opts.app_image)?;
    let mut app = fetcher.fetch(&app_ref, opts.pull_policy).await?;

    let mut metadata: serde_json::Value = match app.label(LIFECYCLE_METADATA_LABEL) {
        Some(label) => serde_json::from_str(label)?,
        None => {
            return Err(KilnError::Config(format!(
                "'{}' was not built with a lifecycle: missing {} label",
                opts.app_image, LIFECYCLE_METADATA_LABEL
            )))
        }
    };

    let recorded_run = metadata["stack"]["runImage"]["image"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    if recorded_run.is_empty() {
        return Err(KilnError::Config(format!(
            "'{}' records no run image; pass one explicitly",
            opts.app_image
        )));
    }

    let new_run = match &opts.run_image {
        Some(explicit) => explicit.clone(),
        None => select_mirror(&app_ref, &recorded_run, config, &metadata),
    };

    let old_base = fetcher
        .fetch(&ImageReference::parse(&recorded_run)?, opts.pull_policy)
        .await?;
    let new_base = fetcher
        .fetch(&ImageReference::parse(&new_run)?, opts.pull_policy)
        .await?;

    app.rebase(&old_base, &new_base)?;

    // Record the new run image for the next rebase.
    metadata["stack"]["runImage"]["image"] = serde_json::Value::String(new_run.clone());
    app.set_label(LIFECYCLE_METADATA_LABEL, serde_json::to_string(&metadata)?);

    let digest = if opts.publish {
        app.push(fetcher.registry()).await?
    } else {
        app.save(fetcher.store()).await?.digest
    };

    tracing::info!(reference = %app_ref, run_image = %new_run, "image rebased");
    Ok(RebasedImage {
        reference: app_ref.full_reference(),
        digest,
    })
}

/// Prefer a mirror on the app's registry: user-configured mirrors
/// first, then the ones recorded in the image metadata.
fn select_mirror(
    app_ref: &ImageReference,
    recorded_run: &str,
    config: &UserConfig,
    metadata: &serde_json::Value,
) -> String {
    let recorded_mirrors: Vec<String> = metadata["stack"]["runImage"]["mirrors"]
        .as_array()
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let user_mirrors = config.mirrors_for(recorded_run).unwrap_or(&[]);
    for mirror in user_mirrors.iter().chain(recorded_mirrors.iter()) {
        if let Ok(parsed) = ImageReference::parse(mirror) {
            if parsed.registry == app_ref.registry {
                return mirror.clone();
            }
        }
    }
    recorded_run.to_string()
}
