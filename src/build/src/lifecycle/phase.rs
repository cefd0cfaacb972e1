//! Phase wiring: mount points, network modes, env and volume parsing.

use std::path::Path;

use kiln_core::error::{KilnError, Result};

use crate::runtime::ContainerSpec;

/// Well-known container paths shared between phases.
pub const APP_DIR: &str = "/workspace";
pub const LAYERS_DIR: &str = "/layers";
pub const PLATFORM_DIR: &str = "/platform";
pub const CACHE_DIR: &str = "/cache";
pub const LAUNCH_CACHE_DIR: &str = "/launch-cache";

/// Lifecycle binaries inside a builder or lifecycle image.
pub const LIFECYCLE_BIN_DIR: &str = "/cnb/lifecycle";

/// Network attachment of phase containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Inherit the runtime default
    #[default]
    Default,
    /// No network
    None,
    /// Bind to the host network (not available on windows)
    Host,
}

impl std::str::FromStr for NetworkMode {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "default" => Ok(NetworkMode::Default),
            "none" => Ok(NetworkMode::None),
            "host" => Ok(NetworkMode::Host),
            other => Err(KilnError::Config(format!(
                "invalid network mode '{}' (expected default, none, or host)",
                other
            ))),
        }
    }
}

impl NetworkMode {
    /// The value handed to the runtime; `None` inherits its default.
    pub fn as_runtime_mode(self) -> Option<&'static str> {
        match self {
            NetworkMode::Default => None,
            NetworkMode::None => Some("none"),
            NetworkMode::Host => Some("host"),
        }
    }
}

/// Validate a `SRC:DEST[:ro|:rw]` volume specification.
///
/// The destination must be absolute; the mode suffix defaults to `rw`
/// and is passed through so read-only mounts stay read-only in every
/// phase.
pub fn parse_volume_spec(raw: &str) -> Result<String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (src, dest, mode) = match parts.as_slice() {
        [src, dest] => (*src, *dest, "rw"),
        [src, dest, mode] => (*src, *dest, *mode),
        _ => {
            return Err(KilnError::Config(format!(
                "invalid volume '{}': expected SRC:DEST[:ro|:rw]",
                raw
            )))
        }
    };

    if src.is_empty() || dest.is_empty() {
        return Err(KilnError::Config(format!(
            "invalid volume '{}': source and destination are required",
            raw
        )));
    }
    if !dest.starts_with('/') {
        return Err(KilnError::Config(format!(
            "invalid volume '{}': destination must be an absolute path",
            raw
        )));
    }
    if mode != "ro" && mode != "rw" {
        return Err(KilnError::Config(format!(
            "invalid volume '{}': mode must be ro or rw",
            raw
        )));
    }

    Ok(format!("{}:{}:{}", src, dest, mode))
}

/// Parse an env file of `KEY=VALUE` lines (blank lines and `#` comments
/// ignored). Keys without `=` forward the host value when set.
pub fn parse_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        KilnError::Config(format!("failed to read env file {}: {}", path.display(), e))
    })?;

    let mut pairs = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = resolve_env_spec(line) {
            pairs.push((key, value));
        }
    }
    Ok(pairs)
}

/// Resolve one `K=V` or bare-`K` env spec; bare keys pull the host
/// value and yield nothing when unset.
pub fn resolve_env_spec(spec: &str) -> Option<(String, String)> {
    match spec.split_once('=') {
        Some((key, value)) => Some((key.to_string(), value.to_string())),
        None => std::env::var(spec).ok().map(|value| (spec.to_string(), value)),
    }
}

/// One lifecycle phase ready to run.
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: &'static str,
    pub spec: ContainerSpec,
}

impl Phase {
    pub fn new(name: &'static str, image: &str) -> Self {
        Self {
            name,
            spec: ContainerSpec {
                image: image.to_string(),
                entrypoint: Some(format!("{}/{}", LIFECYCLE_BIN_DIR, name)),
                ..Default::default()
            },
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.spec.command.extend(args);
        self
    }

    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.spec.binds.push(bind.into());
        self
    }

    pub fn binds(mut self, binds: impl IntoIterator<Item = String>) -> Self {
        self.spec.binds.extend(binds);
        self
    }

    pub fn env(mut self, pairs: &[(String, String)]) -> Self {
        self.spec
            .env
            .extend(pairs.iter().map(|(k, v)| format!("{}={}", k, v)));
        self
    }

    pub fn network(mut self, mode: NetworkMode) -> Self {
        self.spec.network = mode.as_runtime_mode().map(String::from);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.spec.user = Some(user.into());
        self
    }
}
