//! Tunnel path: SSH carried inside a WebSocket to the workspace supervisor

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use sg_core::config::StrategyKind;
use sg_core::FailureCode;

use super::{
    UpstreamError, UpstreamHandler, UpstreamSession, UpstreamStrategy, UpstreamTarget,
    WsByteStream,
};

/// Header carrying the owner token on the WebSocket upgrade
pub const OWNER_TOKEN_HEADER: &str = "x-gitpod-owner-token";

pub struct TunnelStrategy {
    ssh_config: Arc<client::Config>,
    user: String,
    tunnel_path: String,
    timeout: Duration,
}

impl TunnelStrategy {
    pub fn new(
        ssh_config: Arc<client::Config>,
        user: String,
        tunnel_path: String,
        timeout: Duration,
    ) -> Self {
        Self {
            ssh_config,
            user,
            tunnel_path,
            timeout,
        }
    }
}

#[async_trait]
impl UpstreamStrategy<UpstreamSession> for TunnelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Tunnel
    }

    async fn attempt(&self, target: &UpstreamTarget<'_>) -> Result<UpstreamSession, UpstreamError> {
        // Key first: nothing is opened if it is unusable
        let key = target.info.ssh_key.as_deref().ok_or_else(|| {
            UpstreamError::new(FailureCode::TunnelKeyFailed, "workspace did not provide a key")
        })?;
        let key = russh_keys::decode_secret_key(key, None).map_err(|e| {
            UpstreamError::new(
                FailureCode::TunnelKeyFailed,
                format!("failed to decode workspace key: {}", e),
            )
        })?;

        let url = target.tunnel_url(&self.tunnel_path);
        let mut request = url.as_str().into_client_request().map_err(|e| {
            UpstreamError::new(
                FailureCode::TunnelWebsocketFailed,
                format!("invalid tunnel url {}: {}", url, e),
            )
        })?;
        let token = HeaderValue::from_str(&target.info.owner_token).map_err(|_| {
            UpstreamError::new(
                FailureCode::TunnelWebsocketFailed,
                "owner token is not a valid header value",
            )
        })?;
        request.headers_mut().insert(OWNER_TOKEN_HEADER, token);

        tracing::debug!("Opening tunnel to {}", url);
        let (socket, _response) =
            tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    UpstreamError::new(
                        FailureCode::TunnelWebsocketFailed,
                        "websocket handshake timed out",
                    )
                })?
                .map_err(|e| {
                    UpstreamError::new(
                        FailureCode::TunnelWebsocketFailed,
                        format!("websocket to {} failed: {}", url, e),
                    )
                })?;

        // From here on the socket is owned by the SSH session; an error
        // drops it and closes the connection.
        let (handler, events, closed) = UpstreamHandler::new(url.clone());
        let mut handle = tokio::time::timeout(
            self.timeout,
            client::connect_stream(
                Arc::clone(&self.ssh_config),
                WsByteStream::new(socket),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            UpstreamError::new(FailureCode::TunnelChannelFailed, "ssh handshake timed out")
        })?
        .map_err(|e| {
            UpstreamError::new(
                FailureCode::TunnelChannelFailed,
                format!("ssh handshake over tunnel failed: {}", e),
            )
        })?;

        let auth = tokio::time::timeout(
            self.timeout,
            handle.authenticate_publickey(self.user.as_str(), Arc::new(key)),
        )
        .await;

        let error = match auth {
            Ok(Ok(true)) => {
                return Ok(UpstreamSession {
                    kind: StrategyKind::Tunnel,
                    handle,
                    events,
                    closed,
                })
            }
            Ok(Ok(false)) => {
                UpstreamError::new(FailureCode::TunnelAuthFailed, "workspace key rejected")
            }
            Ok(Err(e)) => UpstreamError::new(
                FailureCode::TunnelAuthFailed,
                format!("authentication error: {}", e),
            ),
            Err(_) => UpstreamError::new(
                FailureCode::TunnelChannelFailed,
                "authentication timed out",
            ),
        };

        let _ = handle
            .disconnect(Disconnect::ByApplication, "authentication failed", "en")
            .await;
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_core::{WorkspaceAuthInfo, WorkspaceId, WorkspacePhase};

    fn strategy() -> TunnelStrategy {
        TunnelStrategy::new(
            Arc::new(client::Config::default()),
            "gitpod".to_string(),
            "tunnel/ssh".to_string(),
            Duration::from_secs(1),
        )
    }

    fn info(ssh_key: Option<&str>) -> WorkspaceAuthInfo {
        WorkspaceAuthInfo {
            gitpod_host: "https://gitpod.io".to_string(),
            user_id: "user-1".to_string(),
            workspace_id: WorkspaceId::new("ws-abc123"),
            instance_id: "inst-1".to_string(),
            // never resolved: the key check fails first
            workspace_host: "ws.invalid".to_string(),
            owner_token: "token".to_string(),
            ssh_key: ssh_key.map(str::to_string),
            phase: WorkspacePhase::Running,
        }
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_connecting() {
        let info = info(None);
        let err = strategy()
            .attempt(&UpstreamTarget::new(&info, false))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, FailureCode::TunnelKeyFailed);
    }

    #[tokio::test]
    async fn test_garbage_key_fails_before_connecting() {
        let info = info(Some("not a private key"));
        let err = strategy()
            .attempt(&UpstreamTarget::new(&info, false))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, FailureCode::TunnelKeyFailed);
    }
}
