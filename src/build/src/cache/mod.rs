//! Build and launch cache management.
//!
//! A cache is addressed by `(app reference, kind)` and realized either
//! as a runtime volume (`kiln-cache-<sha256(ref)>.<kind>`) or as a
//! registry image (`<app-ref>-cache`, or an explicit reference). Caches
//! outlive single builds; clearing is explicit and idempotent. An
//! unreadable cache is never fatal: it is cleared and treated as empty.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use kiln_core::error::{KilnError, Result};

use crate::blob::sha256_bytes;
use crate::image::{ImageReference, ImageStore};
use crate::runtime::ContainerRuntime;

/// Volume label marking kiln-managed caches.
pub const CACHE_LABEL: &str = "build.kiln.cache";

/// What a cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Buildpack build-time layers
    Build,
    /// Launch layers kept for export reuse
    Launch,
    /// The generic lifecycle cache directory
    Cache,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Build => "build",
            CacheKind::Launch => "launch",
            CacheKind::Cache => "cache",
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical realization of one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cache {
    Volume { name: String },
    Image { reference: ImageReference },
}

impl Cache {
    /// Volume cache for `(app_ref, kind)`.
    pub fn volume(app_ref: &ImageReference, kind: CacheKind) -> Self {
        let digest = sha256_bytes(app_ref.full_reference().as_bytes());
        Cache::Volume {
            name: format!("kiln-cache-{}.{}", digest, kind),
        }
    }

    /// Image cache: an explicit `--cache-image` reference, or the
    /// `<app-ref>-cache` default.
    pub fn image(app_ref: &ImageReference, explicit: Option<&str>) -> Result<Self> {
        let reference = match explicit {
            Some(explicit) => ImageReference::parse(explicit)?,
            None => app_ref.with_tag_suffix("cache"),
        };
        Ok(Cache::Image { reference })
    }

    /// Volume name or image reference.
    pub fn location(&self) -> String {
        match self {
            Cache::Volume { name } => name.clone(),
            Cache::Image { reference } => reference.full_reference(),
        }
    }
}

/// Held while a build owns a `(app-ref, kind)` cache; dropping releases.
pub struct CacheGuard {
    manager: CacheManager,
    key: String,
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.manager.locks.lock() {
            locks.remove(&self.key);
        }
    }
}

/// Creates, locks, and clears caches.
#[derive(Clone)]
pub struct CacheManager {
    runtime: Arc<dyn ContainerRuntime>,
    /// In-process ownership registry; concurrent builds contending for
    /// the same cache fail fast with `CacheBusy`.
    locks: Arc<Mutex<HashSet<String>>>,
}

impl CacheManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            locks: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim exclusive use of a cache for the duration of a build.
    pub async fn acquire(&self, cache: &Cache) -> Result<CacheGuard> {
        let key = cache.location();
        {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| KilnError::Cache("cache lock poisoned".to_string()))?;
            if !locks.insert(key.clone()) {
                return Err(KilnError::CacheBusy(key));
            }
        }
        Ok(CacheGuard {
            manager: self.clone(),
            key,
        })
    }

    /// Ensure a volume cache exists, creating it lazily.
    pub async fn prepare_volume(&self, cache: &Cache) -> Result<String> {
        let name = match cache {
            Cache::Volume { name } => name,
            Cache::Image { reference } => {
                return Err(KilnError::Cache(format!(
                    "'{}' is an image cache, not a volume",
                    reference
                )))
            }
        };

        if !self.runtime.volume_exists(name).await? {
            let mut labels = HashMap::new();
            labels.insert(CACHE_LABEL.to_string(), "true".to_string());
            self.runtime.create_volume(name, &labels).await?;
            tracing::debug!(volume = %name, "cache volume created");
        }
        Ok(name.clone())
    }

    /// Drop a cache. Absent caches are silently ignored.
    pub async fn clear(&self, cache: &Cache, store: &ImageStore) -> Result<()> {
        match cache {
            Cache::Volume { name } => {
                if self.runtime.volume_exists(name).await? {
                    self.runtime.remove_volume(name).await?;
                    tracing::info!(volume = %name, "cache volume cleared");
                }
            }
            Cache::Image { reference } => {
                let full = reference.full_reference();
                match store.remove(&full).await {
                    Ok(()) => tracing::info!(image = %full, "cache image cleared"),
                    Err(KilnError::ImageNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Reset an unreadable cache: warn, clear, and continue as empty.
    pub async fn reset_corrupt(&self, cache: &Cache, store: &ImageStore, reason: &str) {
        tracing::warn!(cache = %cache.location(), reason = %reason, "cache unreadable, clearing");
        if let Err(err) = self.clear(cache, store).await {
            tracing::warn!(cache = %cache.location(), error = %err, "failed to clear cache");
        }
    }
}
