//! Image and layer records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Runtime defaults an image carries in its config blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub exposed_ports: HashMap<String, serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: HashMap<String, String>,
}

/// Registries commonly send `null` where an empty list or map is meant.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The image config blob as served by a registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: Option<ImageConfig>,
}

/// A fully pulled image. Immutable apart from its tag list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Manifest digest, also the image id.
    pub id: String,
    /// Normalized references (`docker.io/library/alpine:3.19`).
    pub repo_tags: Vec<String>,
    pub config_digest: String,
    /// Base layer first.
    pub layers: Vec<String>,
    /// Sum of compressed layer sizes.
    pub size: u64,
    pub created: DateTime<Utc>,
    pub architecture: String,
    pub os: String,
    pub config: ImageConfig,
}

impl Image {
    pub fn manifest_digest(&self) -> &str {
        &self.id
    }

    /// First 12 hex chars of the id, as shown by `docker images`.
    pub fn short_id(&self) -> &str {
        let hex = self.id.strip_prefix("sha256:").unwrap_or(&self.id);
        &hex[..hex.len().min(12)]
    }

    pub fn has_tag(&self, reference: &str) -> bool {
        self.repo_tags.iter().any(|t| t == reference)
    }
}

/// A content-addressed layer shared between images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub digest: String,
    pub media_type: String,
    pub compressed_size: u64,
    /// Filled in after extraction.
    #[serde(default)]
    pub uncompressed_size: Option<u64>,
    pub blob_path: PathBuf,
    pub tree_path: PathBuf,
    /// Number of images referencing this layer.
    pub ref_count: u32,
}
