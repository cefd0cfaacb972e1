//! Pull-policy-aware image fetching.
//!
//! One entry point for "give me this image": consults the local store
//! and the registry according to the [`PullPolicy`], committing fresh
//! pulls into the store so later fetches are local.

use std::sync::Arc;

use kiln_core::error::{KilnError, Result};
use tempfile::TempDir;

use super::reference::ImageReference;
use super::registry::RegistryClient;
use super::store::{ImageStore, StoredImage};
use super::{Image, PullPolicy};

/// Fetches images via the store and registry.
pub struct ImageFetcher {
    store: Arc<ImageStore>,
    registry: RegistryClient,
}

impl ImageFetcher {
    pub fn new(store: Arc<ImageStore>, registry: RegistryClient) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    /// Fetch an image handle according to `policy`.
    pub async fn fetch(&self, reference: &ImageReference, policy: PullPolicy) -> Result<Image> {
        let stored = self.fetch_stored(reference, policy).await?;
        Image::from_layout(reference.clone(), &stored.path)
    }

    /// Fetch the stored layout according to `policy`.
    pub async fn fetch_stored(
        &self,
        reference: &ImageReference,
        policy: PullPolicy,
    ) -> Result<StoredImage> {
        let full_ref = reference.full_reference();

        match policy {
            PullPolicy::Never => self
                .store
                .get(&full_ref)
                .await
                .ok_or(KilnError::ImageNotFound(full_ref)),
            PullPolicy::IfNotPresent => {
                if let Some(stored) = self.store.get(&full_ref).await {
                    tracing::debug!(reference = %full_ref, "using stored image");
                    return Ok(stored);
                }
                self.pull_and_store(reference).await
            }
            PullPolicy::Always => self.pull_and_store(reference).await,
        }
    }

    async fn pull_and_store(&self, reference: &ImageReference) -> Result<StoredImage> {
        let staging = TempDir::new()
            .map_err(|e| KilnError::Runtime(format!("failed to create staging dir: {}", e)))?;
        let digest = self.registry.pull(reference, staging.path()).await?;
        self.store
            .put(&reference.full_reference(), &digest, staging.path())
            .await
    }
}
