//! andockd - the andock container daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use andock_core::config::{DaemonConfig, StreamPolicy};
use andock_runtime::Runtime;
use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Docker-compatible container daemon
#[derive(Parser, Debug)]
#[command(name = "andockd", version, about = "Docker-compatible container daemon")]
struct Cli {
    /// YAML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Root directory for images, layers, containers and state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Unix socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// TCP listen address (loopback only)
    #[arg(long, conflicts_with = "no_tcp")]
    tcp: Option<SocketAddr>,

    /// Serve on the Unix socket only
    #[arg(long)]
    no_tcp: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Parallel layer downloads per pull
    #[arg(long)]
    max_concurrent_downloads: Option<usize>,

    /// Streamed response policy when the client is slow (block, drop-oldest)
    #[arg(long)]
    stream_policy: Option<StreamPolicy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    fn load_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(socket) = &self.socket {
            config.socket_path = Some(socket.clone());
        }
        if let Some(addr) = self.tcp {
            config.tcp_addr = Some(addr);
        }
        if self.no_tcp {
            config.tcp_addr = None;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(n) = self.max_concurrent_downloads {
            config.max_concurrent_downloads = n;
        }
        if let Some(policy) = self.stream_policy {
            config.stream_policy = policy;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config.log_level, cli.log_format);

    tracing::info!(
        version = andock_core::VERSION,
        data_dir = %config.data_dir.display(),
        socket = %config.socket_path().display(),
        tcp = ?config.tcp_addr,
        "Starting andockd"
    );

    let runtime = Arc::new(
        Runtime::open(config.clone())
            .await
            .context("Failed to open runtime")?,
    );
    let router = andock_daemon::create_router(runtime);
    andock_daemon::serve(router, &config)
        .await
        .context("Server failed")?;
    Ok(())
}
