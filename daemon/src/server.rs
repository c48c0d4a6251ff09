//! Listener setup.
//!
//! The same router is served on a Unix socket and, unless disabled, on a
//! loopback TCP port. Both stop on Ctrl-C or SIGTERM.

use std::io;
use std::path::Path;

use andock_core::config::DaemonConfig;
use axum::Router;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

/// Serve `router` until a shutdown signal arrives.
pub async fn serve(router: Router, config: &DaemonConfig) -> io::Result<()> {
    let socket_path = config.socket_path();
    let unix = bind_unix(&socket_path)?;
    tracing::info!(socket = %socket_path.display(), "Listening on Unix socket");

    let tcp = match config.tcp_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            tracing::info!(addr = %listener.local_addr()?, "Listening on TCP");
            Some(listener)
        }
        None => None,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let unix_server = {
        let shutdown = shutdown.clone();
        axum::serve(unix, router.clone()).with_graceful_shutdown(async move {
            shutdown.cancelled().await
        })
    };
    let tcp_server = async {
        match tcp {
            Some(listener) => {
                let shutdown = shutdown.clone();
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            }
            None => Ok(()),
        }
    };

    let result = tokio::try_join!(async { unix_server.await }, tcp_server).map(|_| ());

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!(socket = %socket_path.display(), error = %e, "Socket already gone");
    }
    tracing::info!("Server stopped");
    result
}

/// Bind the Unix socket, replacing a stale socket file.
fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run").join("andock.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let listener = bind_unix(&path).unwrap();
        assert_eq!(
            listener.local_addr().unwrap().as_pathname(),
            Some(path.as_path())
        );
    }

    #[tokio::test]
    async fn test_bind_creates_parent_dir() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("dir").join("andock.sock");
        bind_unix(&path).unwrap();
        assert!(path.exists());
    }
}
