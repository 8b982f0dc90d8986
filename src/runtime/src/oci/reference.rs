//! Image reference parsing.
//!
//! Turns the short forms found in `FROM` lines (`alpine`, `user/app:1.0`)
//! into fully qualified registry references.

use distbuild_core::error::{BuildError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with a port
    pub registry: String,
    /// Repository path (`library/alpine`)
    pub repository: String,
    pub tag: Option<String>,
    /// `algorithm:hex`
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference.
    ///
    /// `alpine` becomes `docker.io/library/alpine:latest`; a reference with
    /// a digest and no tag keeps no tag.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BuildError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(BuildError::InvalidReference(format!(
                        "invalid digest in '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = split_registry(name, reference)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Whether `reference` looks like a bare image id rather than a name.
    pub fn is_image_id(reference: &str) -> bool {
        let hex = reference.strip_prefix("sha256:").unwrap_or(reference);
        hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// `registry/repository[:tag][@digest]`
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split `name[:tag]`. A colon before the last `/` belongs to a registry
/// port; a bare `host:5000` has no tag.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map_or(0, |i| i + 1);
    match name_tag[last_segment_start..].rfind(':') {
        Some(colon) => {
            let at = last_segment_start + colon;
            let tag = &name_tag[at + 1..];
            if last_segment_start == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
                (name_tag, None)
            } else {
                (&name_tag[..at], Some(tag))
            }
        }
        None => (name_tag, None),
    }
}

/// Split a name into registry and repository.
///
/// The first component is a registry when it contains a dot or a colon or
/// is `localhost`.
fn split_registry(name: &str, original: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(BuildError::InvalidReference(format!(
                    "empty repository in '{}'",
                    original
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{}", name)))
}
