//! SSH gateway listener
//!
//! Accepts local connections and runs a [`GatewayHandler`] for each.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::bridge::{CloseKind, CloseReason};
use crate::server::handler::{GatewayHandler, ServerConfig};
use crate::state::GatewayState;

/// The listener could not be started
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// SSH server facing local clients
pub struct GatewayServer {
    listener: TcpListener,
    config: ServerConfig,
    state: Arc<GatewayState>,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Bind the listening socket
    pub async fn bind(
        address: &str,
        host_key: KeyPair,
        state: Arc<GatewayState>,
        cancel: CancellationToken,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ListenerError::Bind {
                address: address.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            config: ServerConfig::new(host_key),
            state,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled
    pub async fn run(self) -> Result<()> {
        let local_addr = self.listener.local_addr()?;
        tracing::info!("SSH gateway listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH gateway shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let config = Arc::clone(&self.config.ssh_config);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let conn_id = uuid::Uuid::new_v4();

        tracing::info!(%conn_id, "New connection from {}", peer_addr);

        tokio::spawn(async move {
            state.connection_opened();

            let inbound = Arc::new(OnceLock::new());
            let bridge = Arc::new(OnceLock::new());
            let handler = GatewayHandler::new(
                Arc::clone(&state),
                peer_addr,
                Arc::clone(&inbound),
                Arc::clone(&bridge),
            );

            let reason = match russh::server::run_stream(config, socket, handler).await {
                Ok(running) => {
                    let handle = running.handle();
                    let _ = inbound.set(handle.clone());

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let reason = CloseReason::normal("gateway shutting down");
                            let _ = handle
                                .disconnect(
                                    russh::Disconnect::ByApplication,
                                    reason.description.clone(),
                                    "en".to_string(),
                                )
                                .await;
                            reason
                        }
                        result = running => match result {
                            Ok(()) => CloseReason::normal("client disconnected"),
                            Err(e) => CloseReason::error(e.to_string()),
                        },
                    }
                }
                Err(e) => CloseReason::error(e.to_string()),
            };

            match reason.kind {
                CloseKind::Normal => {
                    tracing::info!(%conn_id, "Connection from {} closed: {}", peer_addr, reason.description);
                }
                CloseKind::Error => {
                    tracing::warn!(%conn_id, "Connection from {} closed with error: {}", peer_addr, reason.description);
                }
            }

            if let Some(bridge) = bridge.get() {
                bridge.inbound_closed(reason).await;
            }

            state.connection_closed();
        });
    }
}

/// Load the host key from `path`, or generate one kept in memory
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;
    match key.clone_public_key() {
        Ok(public) => tracing::info!(
            "No host key at {:?}, using a generated Ed25519 key ({})",
            path,
            public.fingerprint()
        ),
        Err(_) => tracing::info!("No host key at {:?}, using a generated Ed25519 key", path),
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_key_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let key = load_or_generate_host_key(&dir.path().join("missing_key")).unwrap();
        assert_eq!(key.name(), "ssh-ed25519");
    }

    #[test]
    fn test_garbage_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        std::fs::write(&path, "not a key").unwrap();
        assert!(load_or_generate_host_key(&path).is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let state = Arc::new(GatewayState::new(
            Default::default(),
            Arc::new(crate::broker::TcpBrokerConnector::new(std::time::Duration::from_secs(1))),
            CancellationToken::new(),
        ));
        let key = KeyPair::generate_ed25519().unwrap();

        let result = GatewayServer::bind(&address, key, state, CancellationToken::new()).await;

        assert!(matches!(result, Err(ListenerError::Bind { .. })));
    }
}
