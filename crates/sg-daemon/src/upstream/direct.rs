//! Direct SSH path: TCP to the workspace's SSH endpoint, owner token as
//! password

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;

use sg_core::config::StrategyKind;
use sg_core::FailureCode;

use super::{UpstreamError, UpstreamHandler, UpstreamSession, UpstreamStrategy, UpstreamTarget};

pub struct DirectStrategy {
    ssh_config: Arc<client::Config>,
    port: u16,
    timeout: Duration,
}

impl DirectStrategy {
    pub fn new(ssh_config: Arc<client::Config>, port: u16, timeout: Duration) -> Self {
        Self {
            ssh_config,
            port,
            timeout,
        }
    }
}

#[async_trait]
impl UpstreamStrategy<UpstreamSession> for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    async fn attempt(&self, target: &UpstreamTarget<'_>) -> Result<UpstreamSession, UpstreamError> {
        let host = target.direct_host();
        let (handler, events, closed) = UpstreamHandler::new(host.clone());

        tracing::debug!("Connecting directly to {}:{}", host, self.port);
        let mut handle = tokio::time::timeout(
            self.timeout,
            client::connect(
                Arc::clone(&self.ssh_config),
                (host.as_str(), self.port),
                handler,
            ),
        )
        .await
        .map_err(|_| UpstreamError::new(FailureCode::SshTransportFailed, "connection timed out"))?
        .map_err(|e| {
            UpstreamError::new(
                FailureCode::SshTransportFailed,
                format!("failed to connect to {}: {}", host, e),
            )
        })?;

        let user = target.info.workspace_id.as_str();
        let auth = tokio::time::timeout(
            self.timeout,
            handle.authenticate_password(user, target.info.owner_token.as_str()),
        )
        .await;

        let error = match auth {
            Ok(Ok(true)) => {
                return Ok(UpstreamSession {
                    kind: StrategyKind::Direct,
                    handle,
                    events,
                    closed,
                })
            }
            Ok(Ok(false)) => {
                UpstreamError::new(FailureCode::SshAuthFailed, "owner token rejected")
            }
            Ok(Err(e)) => UpstreamError::new(
                FailureCode::SshAuthFailed,
                format!("authentication error: {}", e),
            ),
            Err(_) => UpstreamError::new(
                FailureCode::SshTransportFailed,
                "authentication timed out",
            ),
        };

        let _ = handle
            .disconnect(Disconnect::ByApplication, "authentication failed", "en")
            .await;
        Err(error)
    }
}
