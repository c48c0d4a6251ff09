//! Per-layer pull progress.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerStatus {
    Waiting,
    Downloading,
    Extracting,
    Done,
    Error,
}

impl LayerStatus {
    /// Docker-style status text for the progress stream.
    pub fn docker_status(&self) -> &'static str {
        match self {
            LayerStatus::Waiting => "Waiting",
            LayerStatus::Downloading => "Downloading",
            LayerStatus::Extracting => "Extracting",
            LayerStatus::Done => "Pull complete",
            LayerStatus::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LayerStatus::Done | LayerStatus::Error)
    }
}

/// Progress of one layer within a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    pub digest: String,
    pub current: u64,
    pub total: u64,
    pub status: LayerStatus,
}

impl PullProgress {
    pub fn waiting(digest: &str, total: u64) -> Self {
        Self {
            digest: digest.to_string(),
            current: 0,
            total,
            status: LayerStatus::Waiting,
        }
    }

    /// 12-char layer id used by Docker clients.
    pub fn short_digest(&self) -> &str {
        let hex = self.digest.strip_prefix("sha256:").unwrap_or(&self.digest);
        &hex[..hex.len().min(12)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_digest() {
        let p = PullProgress::waiting("sha256:0123456789abcdef0123", 10);
        assert_eq!(p.short_digest(), "0123456789ab");
        assert_eq!(p.status, LayerStatus::Waiting);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(LayerStatus::Done.is_terminal());
        assert!(LayerStatus::Error.is_terminal());
        assert!(!LayerStatus::Extracting.is_terminal());
    }
}
