//! Image reference parsing and normalization.
//!
//! `alpine`, `library/alpine:latest` and `docker.io/library/alpine:latest`
//! all normalize to the same reference, which is the key used for image
//! tags and pull coalescing.

use andock_core::digest::parse_sha256;
use andock_core::error::{AndockError, Result};

use crate::mirror::DOCKER_HUB_REGISTRY;

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, with port if any (`docker.io`, `localhost:5000`)
    pub registry: String,
    /// Repository path (`library/alpine`)
    pub repository: String,
    pub tag: Option<String>,
    /// Manifest digest (`sha256:...`)
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference such as `nginx`, `nginx:1.25`, `user/app`,
    /// `ghcr.io/org/app:v1` or `repo@sha256:...`.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(AndockError::InvalidRequest(
                "Empty image reference".to_string(),
            ));
        }
        if reference.chars().any(|c| c.is_whitespace() || c.is_ascii_uppercase()) {
            return Err(AndockError::InvalidRequest(format!(
                "Invalid reference format: {}",
                reference
            )));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                parse_sha256(digest)?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag is a colon after the last slash; earlier colons are ports.
        let last_slash = name_tag.rfind('/').map_or(0, |p| p + 1);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if tag.as_deref() == Some("") {
            return Err(AndockError::InvalidRequest(format!(
                "Empty tag in reference: {}",
                reference
            )));
        }

        let (registry, repository) = split_registry(name)?;
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Build a reference from the `fromImage` and `tag` query parameters of
    /// an image create request. `tag` may also carry a digest.
    pub fn from_parts(from_image: &str, tag: Option<&str>) -> Result<Self> {
        match tag.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) if t.starts_with("sha256:") => Self::parse(&format!("{}@{}", from_image, t)),
            Some(t) => {
                let mut parsed = Self::parse(from_image)?;
                parsed.tag = Some(t.to_string());
                Ok(parsed)
            }
            None => Self::parse(from_image),
        }
    }

    /// Manifest reference to request: the digest if pinned, else the tag.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
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

    /// Docker-style short form (`alpine:3.19`, `user/app:v1`, `ghcr.io/o/a:v1`).
    pub fn familiar(&self) -> String {
        let full = self.full_reference();
        match full.strip_prefix("docker.io/library/") {
            Some(rest) => rest.to_string(),
            None => full
                .strip_prefix("docker.io/")
                .map(str::to_string)
                .unwrap_or(full),
        }
    }
}

fn split_registry(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(AndockError::InvalidRequest(format!(
                    "Empty repository in reference: {}",
                    name
                )));
            }
            let registry = match first {
                "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB_REGISTRY,
                other => other,
            };
            let repository = if registry == DOCKER_HUB_REGISTRY && !rest.contains('/') {
                format!("library/{}", rest)
            } else {
                rest.to_string()
            };
            return Ok((registry.to_string(), repository));
        }
    }

    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return Err(AndockError::InvalidRequest(format!(
            "Invalid repository name: {}",
            name
        )));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DOCKER_HUB_REGISTRY.to_string(), repository))
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
