//! Task memoization with guaranteed cleanup.
//!
//! Expensive setup work (baking ephemeral buildpacks, creating cache
//! volumes, downloading archives) is deduplicated by a content-hashed
//! key: within one process a task body runs at most once, and concurrent
//! callers for the same key await the single in-flight computation.
//! Cleanup hooks registered along the way run LIFO at shutdown, each
//! exactly once, continuing past individual failures.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use kiln_core::error::{KilnError, Result};
use tokio::sync::{Mutex, OnceCell};

use crate::blob::sha256_bytes;

type CleanupFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Build a memoization key from a prefix and the task's inputs.
pub fn task_key(prefix: &str, args: &[&str]) -> String {
    let joined = args.join("\x1f");
    format!("{}-{}", prefix, sha256_bytes(joined.as_bytes()))
}

/// Single-flight task memoizer with a LIFO cleanup list.
#[derive(Default)]
pub struct TaskMemoizer {
    tasks: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
    cleanups: StdMutex<Vec<(String, CleanupFn)>>,
}

impl TaskMemoizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` for `key` unless a result is already recorded.
    ///
    /// The key map lock is held only to look up the cell; task bodies
    /// run outside it, so distinct keys proceed concurrently while
    /// same-key callers share one computation.
    pub async fn run_once<F, Fut>(&self, key: &str, task: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let cell = {
            let mut tasks = self.tasks.lock().await;
            tasks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_try_init(task).await.cloned()
    }

    /// Register a cleanup hook; hooks run LIFO at [`Self::cleanup`].
    pub fn defer(&self, name: impl Into<String>, hook: impl FnOnce() -> Result<()> + Send + 'static) {
        self.cleanups
            .lock()
            .expect("cleanup list poisoned")
            .push((name.into(), Box::new(hook)));
    }

    /// Run all cleanup hooks, newest first. Every hook runs even when
    /// earlier ones fail; the aggregate failure is returned.
    pub fn cleanup(&self) -> Result<()> {
        let mut hooks = {
            let mut cleanups = self.cleanups.lock().expect("cleanup list poisoned");
            std::mem::take(&mut *cleanups)
        };

        let mut failures = Vec::new();
        while let Some((name, hook)) = hooks.pop() {
            if let Err(err) = hook() {
                tracing::warn!(hook = %name, error = %err, "cleanup hook failed");
                failures.push(format!("{}: {}", name, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KilnError::Runtime(format!(
                "cleanup failed: {}",
                failures.join("; ")
            )))
        }
    }
}
