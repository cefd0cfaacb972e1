//! Disk-backed image store.
//!
//! Holds saved images as OCI layouts keyed by manifest digest, with a
//! reference index persisted to `index.json`. This is the "local daemon"
//! side of the image handle: saving an image commits a layout here and
//! records the tag atomically, so a failed save never leaves a dangling
//! reference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Metadata for a stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Reference string the image was saved under
    pub reference: String,
    /// Manifest digest (`sha256:...`)
    pub digest: String,
    /// Path to the OCI layout on disk
    pub path: PathBuf,
    /// When the image was stored
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-backed image store with an in-memory reference index.
pub struct ImageStore {
    store_dir: PathBuf,
    index: Arc<RwLock<HashMap<String, StoredImage>>>,
}

impl ImageStore {
    /// Open (or create) a store rooted at `store_dir`.
    pub fn new(store_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|e| {
            KilnError::Runtime(format!(
                "failed to create image store {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
        })
    }

    /// Look up an image by reference.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        self.index.read().await.get(reference).cloned()
    }

    /// Look up an image by manifest digest.
    pub async fn get_by_digest(&self, digest: &str) -> Option<StoredImage> {
        self.index
            .read()
            .await
            .values()
            .find(|img| img.digest == digest)
            .cloned()
    }

    /// Commit an OCI layout into the store under `reference`.
    ///
    /// The layout is copied under `sha256/<digest>/` (content-shared when
    /// the digest is already present) and the reference recorded last.
    pub async fn put(&self, reference: &str, digest: &str, layout_dir: &Path) -> Result<StoredImage> {
        let digest_hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let target_dir = self.store_dir.join("sha256").join(digest_hex);

        if !target_dir.exists() {
            copy_dir_recursive(layout_dir, &target_dir).map_err(|e| {
                KilnError::Runtime(format!("failed to copy image into store: {}", e))
            })?;
        }

        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            path: target_dir,
            created_at: Utc::now(),
        };

        {
            let mut index = self.index.write().await;
            index.insert(reference.to_string(), stored.clone());
        }
        self.persist_index().await?;

        Ok(stored)
    }

    /// Record an additional reference for an already-stored digest.
    pub async fn tag(&self, digest: &str, reference: &str) -> Result<StoredImage> {
        let existing = self
            .get_by_digest(digest)
            .await
            .ok_or_else(|| KilnError::ImageNotFound(digest.to_string()))?;

        let stored = StoredImage {
            reference: reference.to_string(),
            digest: existing.digest,
            path: existing.path,
            created_at: Utc::now(),
        };

        {
            let mut index = self.index.write().await;
            index.insert(reference.to_string(), stored.clone());
        }
        self.persist_index().await?;

        Ok(stored)
    }

    /// Remove a reference; the layout is deleted once no reference uses it.
    pub async fn remove(&self, reference: &str) -> Result<()> {
        let removed = {
            let mut index = self.index.write().await;
            let removed = index
                .remove(reference)
                .ok_or_else(|| KilnError::ImageNotFound(reference.to_string()))?;
            let shared = index.values().any(|img| img.digest == removed.digest);
            (removed, shared)
        };

        let (image, digest_shared) = removed;
        if !digest_shared && image.path.exists() {
            std::fs::remove_dir_all(&image.path).map_err(|e| {
                KilnError::Runtime(format!(
                    "failed to remove image layout {}: {}",
                    image.path.display(),
                    e
                ))
            })?;
        }

        self.persist_index().await
    }

    /// All stored images.
    pub async fn list(&self) -> Vec<StoredImage> {
        self.index.read().await.values().cloned().collect()
    }

    /// The store root directory.
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    async fn persist_index(&self) -> Result<()> {
        let images = {
            let index = self.index.read().await;
            index.values().cloned().collect()
        };
        let data = serde_json::to_string_pretty(&StoreIndex { images })?;

        let index_path = self.store_dir.join("index.json");
        let tmp_path = self.store_dir.join("index.json.tmp");
        tokio::fs::write(&tmp_path, data).await.map_err(|e| {
            KilnError::Runtime(format!(
                "failed to write store index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp_path, &index_path).await.map_err(|e| {
            KilnError::Runtime(format!(
                "failed to commit store index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
    let index_path = store_dir.join("index.json");
    if !index_path.exists() {
        return Ok(HashMap::new());
    }

    let data = std::fs::read_to_string(&index_path).map_err(|e| {
        KilnError::Runtime(format!(
            "failed to read store index {}: {}",
            index_path.display(),
            e
        ))
    })?;
    let parsed: StoreIndex = serde_json::from_str(&data)
        .map_err(|e| KilnError::Runtime(format!("failed to parse store index: {}", e)))?;

    // Drop entries whose layouts were removed out from under us.
    Ok(parsed
        .images
        .into_iter()
        .filter(|img| img.path.exists())
        .map(|img| (img.reference.clone(), img))
        .collect())
}

pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
