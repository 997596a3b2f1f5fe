//! IPC server implementation
//!
//! Listens on localhost TCP, one JSON request and one JSON response per line.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use sg_core::ipc::{DaemonRequest, DaemonResponse};
use sg_core::DAEMON_VERSION;

use crate::state::GatewayState;

/// IPC server for host processes
///
/// Listens on localhost (127.0.0.1) only - not accessible from network.
pub struct DaemonIpcServer {
    listener: TcpListener,
    state: Arc<GatewayState>,
}

impl DaemonIpcServer {
    pub async fn bind(address: &str, state: Arc<GatewayState>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind IPC server to {}", address))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the daemon's root token is cancelled
    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening on {}", self.listener.local_addr()?);
        let cancel = self.state.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("IPC server shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if !peer_addr.ip().is_loopback() {
                                tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                                continue;
                            }

                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state).await {
                                    tracing::warn!("IPC client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept IPC connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_client(stream: TcpStream, state: Arc<GatewayState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<DaemonRequest>(trimmed) {
            Ok(request) => handle_request(request, &state).await,
            Err(e) => DaemonResponse::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn handle_request(request: DaemonRequest, state: &GatewayState) -> DaemonResponse {
    match request {
        DaemonRequest::Active { host_id } => {
            state.brokers.register(host_id).await;
            DaemonResponse::Ok
        }

        DaemonRequest::Inactive { host_id } => {
            state.brokers.deregister(&host_id, "host deactivated").await;
            DaemonResponse::Ok
        }

        DaemonRequest::Ping => DaemonResponse::Pong,

        DaemonRequest::GetDaemonVersion => DaemonResponse::Version {
            version: DAEMON_VERSION.to_string(),
        },

        DaemonRequest::GetStatus => DaemonResponse::Status(state.status().await),

        DaemonRequest::Shutdown => {
            tracing::info!("Shutdown requested over IPC");
            state.cancel.cancel();
            DaemonResponse::Ok
        }
    }
}
