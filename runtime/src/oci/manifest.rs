//! Registry manifest documents.

use andock_core::error::Result;
use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Accept header for manifest requests.
pub const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

/// Single-platform image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    /// Base layer first.
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Sum of compressed layer sizes.
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Multi-platform manifest list or OCI index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub manifests: Vec<PlatformManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    /// Absent on attestation entries.
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// A fetched manifest document, either kind.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Manifest(ImageManifest),
    Index(ManifestIndex),
}

impl ManifestDocument {
    /// Parse a manifest body. The media type comes from the Content-Type
    /// header, falling back to the document's own `mediaType` and finally
    /// to the presence of a `manifests` array.
    pub fn parse(content_type: &str, body: &[u8]) -> Result<Self> {
        let is_index = |media_type: &str| {
            media_type.contains("manifest.list") || media_type.contains("image.index")
        };

        if is_index(content_type) {
            return Ok(ManifestDocument::Index(serde_json::from_slice(body)?));
        }

        let value: serde_json::Value = serde_json::from_slice(body)?;
        let declared = value
            .get("mediaType")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if is_index(declared) || value.get("manifests").is_some() {
            Ok(ManifestDocument::Index(serde_json::from_value(value)?))
        } else {
            Ok(ManifestDocument::Manifest(serde_json::from_value(value)?))
        }
    }
}

/// Docker/OCI name for the host architecture.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        a => a,
    }
}

/// Images are always Linux, whatever the host OS.
pub const TARGET_OS: &str = "linux";

/// Pick the index entry matching `architecture`/`os`.
pub fn select_platform<'a>(
    index: &'a ManifestIndex,
    architecture: &str,
    os: &str,
) -> Option<&'a PlatformManifest> {
    index.manifests.iter().find(|m| {
        m.platform
            .as_ref()
            .map_or(false, |p| p.architecture == architecture && p.os == os)
    })
}
