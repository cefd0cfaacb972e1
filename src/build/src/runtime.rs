//! Container runtime abstraction.
//!
//! The lifecycle never talks to a concrete runtime directly; it goes
//! through [`ContainerRuntime`], implemented here by [`CliRuntime`]
//! shelling out to any docker-compatible binary. The trait is the seam
//! test doubles plug into.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::error::{KilnError, Result};
use tokio::process::Command;

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    /// Entrypoint override (a lifecycle binary path)
    pub entrypoint: Option<String>,
    /// Arguments to the entrypoint
    pub command: Vec<String>,
    /// `KEY=VALUE` environment entries
    pub env: Vec<String>,
    /// `SRC:DEST[:ro|:rw]` bind and volume mounts
    pub binds: Vec<String>,
    /// Network mode; `None` inherits the runtime default
    pub network: Option<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
}

/// Operations the lifecycle needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the runtime responds at all.
    async fn is_available(&self) -> bool;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Import an OCI layout directory as `reference`.
    async fn import_image(&self, layout: &Path, reference: &str) -> Result<()>;

    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;

    /// Create a container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Block until the container exits; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// SIGTERM, escalating to SIGKILL after `grace`.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Human-readable runtime name for logs.
    fn name(&self) -> &'static str;
}

/// Runtime driving a docker-compatible CLI binary.
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[&str]) -> Result<std::process::Output> {
        tracing::debug!(binary = %self.binary, ?args, "runtime exec");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KilnError::Runtime(format!("failed to run {}: {}", self.binary, e)))
    }

    async fn exec_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.exec(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KilnError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn is_available(&self) -> bool {
        self.exec(&["version", "--format", "{{.Client.Version}}"])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self
            .exec(&["image", "inspect", image])
            .await?
            .status
            .success())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        tracing::info!(image = %image, "pulling image into runtime");
        self.exec_checked(&["pull", image]).await.map(|_| ())
    }

    async fn import_image(&self, layout: &Path, reference: &str) -> Result<()> {
        // `docker load`-compatible runtimes accept an OCI layout tar on
        // stdin; shipping the directory is simplest via `load -i`.
        let staging = tempfile::NamedTempFile::new()
            .map_err(|e| KilnError::Runtime(format!("failed to stage image tar: {}", e)))?;
        crate::blob::write_dir_layer(layout, Path::new(""), staging.path())?;
        let tar_path = staging.path().display().to_string();
        let loaded = self.exec_checked(&["load", "-i", &tar_path]).await?;
        // `load` prints the imported name; retag it when it differs.
        if let Some(imported) = loaded.rsplit(' ').next() {
            if !imported.is_empty() && imported != reference {
                let _ = self.exec(&["tag", imported, reference]).await;
            }
        }
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        self.exec_checked(&["tag", source, target]).await.map(|_| ())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args: Vec<String> = vec!["create".to_string()];

        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }
        if let Some(user) = &spec.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for bind in &spec.binds {
            args.push("-v".to_string());
            args.push(bind.clone());
        }
        for env in &spec.env {
            args.push("-e".to_string());
            args.push(env.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec_checked(&arg_refs).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.exec_checked(&["start", id]).await.map(|_| ())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let code = self.exec_checked(&["wait", id]).await?;
        code.parse::<i64>()
            .map_err(|_| KilnError::Runtime(format!("unexpected wait output '{}'", code)))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let timeout = grace.as_secs().to_string();
        self.exec_checked(&["stop", "-t", &timeout, id])
            .await
            .map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.exec_checked(&["rm", "-f", id]).await.map(|_| ())
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        let mut args: Vec<String> = vec!["volume".to_string(), "create".to_string()];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec_checked(&arg_refs).await.map(|_| ())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .exec(&["volume", "inspect", name])
            .await?
            .status
            .success())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.exec_checked(&["volume", "rm", name]).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "cli"
    }
}
