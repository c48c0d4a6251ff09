//! Registry mirror record.

use serde::{Deserialize, Serialize};

/// Default priority for user-added mirrors.
pub const DEFAULT_MIRROR_PRIORITY: i32 = 50;

/// A registry endpoint usable for Docker Hub pulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    /// Normalized url, the record key.
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_built_in: bool,
    #[serde(default)]
    pub is_selected: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Sent as `Authorization: Bearer` instead of the token exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

fn default_priority() -> i32 {
    DEFAULT_MIRROR_PRIORITY
}

/// Trim whitespace and trailing slashes.
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
