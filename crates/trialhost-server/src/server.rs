//! HTTP server implementation.
//!
//! This module provides the main [`TrialServer`] struct for running
//! the provisioning API.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use trialhost_common::ServerConfigFile;

use crate::router::build_router;
use crate::state::AppState;

/// Errors raised while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid bind address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Build from the `[server]` section of the config file.
    pub fn from_file(file: &ServerConfigFile) -> Result<Self, ServerError> {
        let bind_addr = file
            .bind_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ServerError::InvalidAddress {
                addr: file.bind_addr.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            bind_addr,
            request_timeout_secs: file.request_timeout_secs,
            graceful_shutdown: file.graceful_shutdown,
        })
    }

    /// Create a new server config with custom bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Provisioning API server.
pub struct TrialServer {
    state: AppState,
    config: ServerConfig,
}

impl TrialServer {
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// Jobs still running at shutdown are cancelled, and this returns only
    /// after each has rolled back. The job table itself is not persisted.
    pub async fn run(self) -> Result<(), ServerError> {
        let app = build_router(self.state.clone(), self.config.request_timeout());

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr,
                source,
            })?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(ServerError::Serve)?;
        } else {
            axum::serve(listener, app)
                .await
                .map_err(ServerError::Serve)?;
        }

        let running = self.state.running_jobs();
        if running > 0 {
            warn!(running, "Cancelling running provisioning jobs");
        }
        self.state.shutdown().await;
        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server on an ephemeral port and return a handle for testing.
    pub async fn start_test(state: AppState) -> Result<TestHandle, ServerError> {
        let app = build_router(state.clone(), Duration::from_secs(30));

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let addr = listener.local_addr().map_err(ServerError::Serve)?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use trialhost_common::{PoolConfig, ProvisionerConfig};
    use trialhost_core::{Provisioner, SimulatedCloud};

    use super::*;

    fn state() -> AppState {
        let cloud = Arc::new(SimulatedCloud::new().with_template(8011));
        let backends = cloud.backends(PoolConfig::default());
        AppState::new(Provisioner::new(ProvisionerConfig::default(), backends), None)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8000);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.graceful_shutdown);
    }

    #[test]
    fn test_server_config_from_file() {
        let file = ServerConfigFile {
            bind_addr: "127.0.0.1:3000".into(),
            request_timeout_secs: 60,
            graceful_shutdown: false,
        };
        let config = ServerConfig::from_file(&file).unwrap();

        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert!(!config.graceful_shutdown);
    }

    #[test]
    fn test_server_config_invalid_addr() {
        let file = ServerConfigFile {
            bind_addr: "localhost".into(),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::from_file(&file),
            Err(ServerError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_test_serves_health() {
        let handle = TrialServer::start_test(state()).await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(handle.addr()).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        handle.shutdown().await;
    }
}
