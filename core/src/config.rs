use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{AndockError, Result};
use crate::log::LogConfig;

/// Docker Hub registry endpoint.
pub const DOCKER_HUB_ENDPOINT: &str = "https://registry-1.docker.io";

/// Docker Hub search API.
pub const DOCKER_HUB_SEARCH_URL: &str = "https://hub.docker.com/v2/search/repositories/";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root directory for images, layers, containers and state
    pub data_dir: PathBuf,

    /// Unix socket path (defaults to `{data_dir}/andock.sock`)
    pub socket_path: Option<PathBuf>,

    /// TCP loopback listener; `None` disables it
    pub tcp_addr: Option<SocketAddr>,

    /// Log level used when RUST_LOG is unset
    pub log_level: String,

    /// Built-in registry mirrors, always appended to the fallback list
    pub builtin_mirrors: Vec<MirrorSeed>,

    /// Repository search endpoint
    pub search_url: String,

    /// Seconds between mirror health checks; 0 disables them
    pub mirror_check_interval_secs: u64,

    /// Worker pool size for layer downloads within one pull
    pub max_concurrent_downloads: usize,

    /// Timeout for auth and manifest calls in seconds
    pub request_timeout_secs: u64,

    /// Timeout for one blob download in seconds
    pub blob_timeout_secs: u64,

    /// Retries per registry call on network errors
    pub max_retries: u32,

    /// Base backoff between retries in milliseconds (doubles per attempt)
    pub retry_backoff_ms: u64,

    /// Bounded buffer size for streamed responses and progress fan-out
    pub stream_buffer: usize,

    /// What a streaming producer does when the buffer is full
    pub stream_policy: StreamPolicy,

    /// Grace period between SIGTERM and SIGKILL on stop
    pub stop_grace_secs: u64,

    /// Sandbox launcher settings
    pub sandbox: SandboxConfig,

    /// Container log settings
    pub log: LogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::home_dir()
                .map(|h| h.join(".andock"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/andock")),
            socket_path: None,
            tcp_addr: Some(SocketAddr::from(([127, 0, 0, 1], 2375))),
            log_level: "info".to_string(),
            builtin_mirrors: MirrorSeed::defaults(),
            search_url: DOCKER_HUB_SEARCH_URL.to_string(),
            mirror_check_interval_secs: 300,
            max_concurrent_downloads: 3,
            request_timeout_secs: 30,
            blob_timeout_secs: 300,
            max_retries: 2,
            retry_backoff_ms: 200,
            stream_buffer: 64,
            stream_policy: StreamPolicy::Block,
            stop_grace_secs: 10,
            sandbox: SandboxConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a YAML file, falling back to defaults for
    /// any missing field.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AndockError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: DaemonConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Check that values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(AndockError::Config("data_dir must not be empty".to_string()));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(AndockError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(AndockError::Config(
                "stream_buffer must be at least 1".to_string(),
            ));
        }
        if let Some(addr) = self.tcp_addr {
            // The API is unauthenticated and can run commands
            if !addr.ip().is_loopback() {
                return Err(AndockError::Config(format!(
                    "tcp_addr must be a loopback address, got {}",
                    addr
                )));
            }
        }
        Ok(())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("andock.sock"))
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.data_dir.join("layers")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }
}

/// A built-in mirror entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorSeed {
    pub url: String,
    pub name: String,
    #[serde(default = "default_seed_priority")]
    pub priority: i32,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_seed_priority() -> i32 {
    100
}

impl MirrorSeed {
    pub fn new(url: &str, name: &str) -> Self {
        Self {
            url: url.to_string(),
            name: name.to_string(),
            priority: default_seed_priority(),
            is_default: false,
            bearer_token: None,
        }
    }

    /// Docker Hub (default) followed by the public Docker Hub mirrors.
    pub fn defaults() -> Vec<MirrorSeed> {
        let with_priority = |url: &str, name: &str, priority: i32| MirrorSeed {
            priority,
            ..MirrorSeed::new(url, name)
        };
        vec![
            MirrorSeed {
                is_default: true,
                ..MirrorSeed::new(DOCKER_HUB_ENDPOINT, "Docker Hub")
            },
            MirrorSeed::new("https://docker.m.daocloud.io", "DaoCloud"),
            with_priority("https://docker.xuanyuan.me", "Xuanyuan", 90),
            with_priority("https://registry.cn-hangzhou.aliyuncs.com", "Aliyun", 80),
            with_priority("https://mirrors.huaweicloud.com", "Huawei Cloud", 70),
        ]
    }
}

/// Backpressure policy for bounded streaming buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamPolicy {
    /// Producer waits for the consumer.
    Block,
    /// Oldest buffered event is discarded to make room.
    DropOldest,
}

impl std::str::FromStr for StreamPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "drop-oldest" => Ok(Self::DropOldest),
            _ => Err(format!(
                "unknown stream policy: '{}' (supported: block, drop-oldest)",
                s
            )),
        }
    }
}

/// Sandbox launcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Launcher binary (`proot` by default). `none` runs commands directly.
    pub launcher: String,

    /// Extra arguments placed before the rootfs arguments
    pub extra_args: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            launcher: "proot".to_string(),
            extra_args: Vec::new(),
        }
    }
}
