//! Image reference parsing.
//!
//! Parses references like `registry.local:5000/example/run:v1` into
//! structured components, defaulting registry and tag the way container
//! tooling expects.

use kiln_core::error::{KilnError, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, possibly with port
    pub registry: String,
    /// Repository path
    pub repository: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest (`sha256:...`), if any
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(KilnError::Config("empty image reference".to_string()));
        }

        let (rest, digest) = match reference.rsplit_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    return Err(KilnError::Config(format!(
                        "invalid digest in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(rest);

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                if remainder.is_empty() {
                    return Err(KilnError::Config(format!(
                        "empty repository in reference '{}'",
                        reference
                    )));
                }
                (first.to_string(), remainder.to_string())
            }
            _ => {
                let repository = if name.contains('/') {
                    name.to_string()
                } else {
                    format!("library/{}", name)
                };
                (DEFAULT_REGISTRY.to_string(), repository)
            }
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The fully qualified reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// A sibling reference whose final tag carries `suffix`
    /// (`example/app:latest` → `example/app:latest-cache`).
    pub fn with_tag_suffix(&self, suffix: &str) -> Self {
        let tag = match &self.tag {
            Some(tag) => format!("{}-{}", tag, suffix),
            None => suffix.to_string(),
        };
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag),
            digest: None,
        }
    }
}

/// Split a trailing `:tag`, leaving `registry:port` prefixes alone.
fn split_tag(name: &str) -> (&str, Option<String>) {
    let after_slash = name.rfind('/').map(|i| &name[i + 1..]).unwrap_or(name);
    match after_slash.rfind(':') {
        Some(colon) => {
            let candidate = &after_slash[colon + 1..];
            // A bare host:port with no path keeps its colon.
            if !name.contains('/') && candidate.chars().all(|c| c.is_ascii_digit()) {
                return (name, None);
            }
            let cut = name.len() - after_slash.len() + colon;
            (&name[..cut], Some(candidate.to_string()))
        }
        None => (name, None),
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
