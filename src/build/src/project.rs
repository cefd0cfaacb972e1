//! Project descriptor (`project.toml`).
//!
//! Lets an application pin its builder, buildpacks (including inline
//! script buildpacks), build-time env, and source filtering without
//! command-line flags.

use std::path::{Path, PathBuf};

use kiln_core::error::{KilnError, Result};
use serde::Deserialize;

/// `[[project.licenses]]` entry; each needs a type or a uri.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct License {
    #[serde(default, rename = "type")]
    pub license_type: String,
    #[serde(default)]
    pub uri: String,
}

/// `[project]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "source-url")]
    pub source_url: String,
    #[serde(default)]
    pub licenses: Vec<License>,
}

/// Inline script buildpack definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub api: String,
    #[serde(default)]
    pub inline: String,
    #[serde(default)]
    pub shell: String,
}

/// One `[[build.buildpacks]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectBuildpack {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub script: Script,
}

/// One `[[build.env]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// `[build]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildSection {
    #[serde(default)]
    pub builder: String,
    #[serde(default)]
    pub buildpacks: Vec<ProjectBuildpack>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Parsed `project.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectDescriptor {
    #[serde(default)]
    pub project: ProjectInfo,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub metadata: toml::value::Table,
}

impl ProjectDescriptor {
    /// Load and validate a `project.toml` file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let descriptor: ProjectDescriptor = toml::from_str(&data)
            .map_err(|e| KilnError::Config(format!("invalid {}: {}", path.display(), e)))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.build.include.is_empty() && !self.build.exclude.is_empty() {
            return Err(KilnError::Config(
                "project.toml: cannot have both include and exclude defined".to_string(),
            ));
        }

        for license in &self.project.licenses {
            if license.license_type.is_empty() && license.uri.is_empty() {
                return Err(KilnError::Config(
                    "project.toml: must have a type or uri defined for each license".to_string(),
                ));
            }
        }

        for buildpack in &self.build.buildpacks {
            let has_script = !buildpack.script.inline.is_empty();
            if buildpack.id.is_empty() && buildpack.uri.is_empty() && !has_script {
                return Err(KilnError::Config(
                    "project.toml: buildpacks must have an id or uri defined".to_string(),
                ));
            }
            if !buildpack.uri.is_empty() && !buildpack.version.is_empty() {
                return Err(KilnError::Config(
                    "project.toml: buildpacks cannot have both uri and version defined"
                        .to_string(),
                ));
            }
            if has_script && buildpack.id.is_empty() {
                return Err(KilnError::Config(
                    "project.toml: script buildpacks must have an id defined".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Build-time env entries as pairs.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.build
            .env
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }
}

/// Materialize an inline script buildpack as a directory usable as a
/// buildpack source.
pub fn write_script_buildpack(buildpack: &ProjectBuildpack, dest: &Path) -> Result<PathBuf> {
    if buildpack.script.inline.is_empty() {
        return Err(KilnError::Config(format!(
            "buildpack '{}' has no inline script",
            buildpack.id
        )));
    }

    let api = if buildpack.script.api.is_empty() {
        "0.6"
    } else {
        &buildpack.script.api
    };
    let shell = if buildpack.script.shell.is_empty() {
        "/bin/sh"
    } else {
        &buildpack.script.shell
    };
    let version = if buildpack.version.is_empty() {
        "0.0.0"
    } else {
        &buildpack.version
    };

    let root = dest.join(crate::buildpack::escape_id(&buildpack.id));
    let bin = root.join("bin");
    std::fs::create_dir_all(&bin)
        .map_err(|e| KilnError::Runtime(format!("failed to create {}: {}", bin.display(), e)))?;

    let descriptor = format!(
        "api = \"{api}\"\n\n[buildpack]\nid = \"{id}\"\nversion = \"{version}\"\n\n[[stacks]]\nid = \"*\"\n",
        api = api,
        id = buildpack.id,
        version = version,
    );
    std::fs::write(root.join("buildpack.toml"), descriptor)
        .map_err(|e| KilnError::Runtime(format!("failed to write buildpack.toml: {}", e)))?;
    std::fs::write(bin.join("detect"), format!("#!{}\nexit 0\n", shell))
        .map_err(|e| KilnError::Runtime(format!("failed to write detect: {}", e)))?;
    std::fs::write(
        bin.join("build"),
        format!("#!{}\n{}\n", shell, buildpack.script.inline),
    )
    .map_err(|e| KilnError::Runtime(format!("failed to write build: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for binary in ["detect", "build"] {
            let path = bin.join(binary);
            let mut perms = std::fs::metadata(&path)
                .map_err(KilnError::Io)?
                .permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).map_err(KilnError::Io)?;
        }
    }

    Ok(root)
}

/// Copy the app source into `dest`, honoring include/exclude filters.
///
/// With `include`, only matching paths are kept; with `exclude`,
/// matching paths are dropped. Patterns match path components relative
/// to the source root, with a leading or trailing `*` as wildcard.
pub fn stage_source(source: &Path, descriptor: Option<&ProjectDescriptor>, dest: &Path) -> Result<()> {
    let (include, exclude) = match descriptor {
        Some(d) => (d.build.include.as_slice(), d.build.exclude.as_slice()),
        None => (&[][..], &[][..]),
    };

    copy_filtered(source, source, dest, include, exclude)
}

fn copy_filtered(
    root: &Path,
    current: &Path,
    dest: &Path,
    include: &[String],
    exclude: &[String],
) -> Result<()> {
    std::fs::create_dir_all(dest)
        .map_err(|e| KilnError::Runtime(format!("failed to create {}: {}", dest.display(), e)))?;

    for entry in std::fs::read_dir(current).map_err(|e| KilnError::UnreadableSource {
        path: current.display().to_string(),
        message: e.to_string(),
    })? {
        let entry = entry.map_err(|e| KilnError::UnreadableSource {
            path: current.display().to_string(),
            message: e.to_string(),
        })?;
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        let is_dir = path.is_dir();
        if !keep_path(&rel_str, is_dir, include, exclude) {
            continue;
        }

        let target = dest.join(entry.file_name());
        if is_dir {
            copy_filtered(root, &path, &target, include, exclude)?;
        } else {
            std::fs::copy(&path, &target).map_err(|e| {
                KilnError::Runtime(format!("failed to copy {}: {}", path.display(), e))
            })?;
        }
    }
    Ok(())
}

fn keep_path(rel: &str, is_dir: bool, include: &[String], exclude: &[String]) -> bool {
    if !exclude.is_empty() {
        return !exclude.iter().any(|p| matches_pattern(rel, p));
    }
    if !include.is_empty() {
        // Directories are kept when any include pattern could match
        // inside them.
        return include
            .iter()
            .any(|p| matches_pattern(rel, p) || (is_dir && p.starts_with(&format!("{}/", rel))));
    }
    true
}

/// Minimal matcher: exact path, directory prefix, leading `*` suffix
/// match, trailing `*` prefix match.
fn matches_pattern(rel: &str, pattern: &str) -> bool {
    let pattern = pattern.trim_end_matches('/');
    if let Some(suffix) = pattern.strip_prefix('*') {
        return rel.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return rel.starts_with(prefix);
    }
    rel == pattern || rel.starts_with(&format!("{}/", pattern))
}
