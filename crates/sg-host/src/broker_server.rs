//! Broker server run by each editor host
//!
//! Answers the daemon's credential lookups and collects its telemetry.
//! The bound address doubles as the host's id towards the daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use sg_core::ipc::{
    read_message, write_message, BrokerRequest, BrokerResponse, ErrorReport, UserFlowStatus,
};
use sg_core::{FailureCode, HostId, IpcError, WorkspaceAuthInfo, WorkspaceId};

/// A lookup the provider could not answer
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// Well-known failure, if any. `NoRunningInstance` stops the
    /// daemon from retrying.
    pub code: Option<FailureCode>,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: Option<FailureCode>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Source of workspace credentials, backed by the Gitpod API in the editor
#[async_trait]
pub trait AuthInfoProvider: Send + Sync {
    async fn workspace_auth_info(
        &self,
        workspace_id: &WorkspaceId,
        gitpod_host: &str,
    ) -> Result<WorkspaceAuthInfo, ProviderError>;
}

/// Destination of the daemon's telemetry
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn user_flow_status(&self, status: UserFlowStatus);
    async fn error_report(&self, report: ErrorReport);
}

/// Writes telemetry to the log
pub struct LogTelemetry;

#[async_trait]
impl TelemetrySink for LogTelemetry {
    async fn user_flow_status(&self, status: UserFlowStatus) {
        tracing::info!(
            flow = %status.flow,
            status = ?status.status,
            workspace_id = status.workspace_id.as_deref().unwrap_or_default(),
            failure_code = ?status.failure_code,
            "User flow status"
        );
    }

    async fn error_report(&self, report: ErrorReport) {
        tracing::warn!(
            code = %report.code,
            workspace_id = report.workspace_id.as_deref().unwrap_or_default(),
            instance_id = report.instance_id.as_deref().unwrap_or_default(),
            "Gateway error report: {}",
            report.message
        );
    }
}

/// Loopback server speaking the broker interface
pub struct HostBrokerServer {
    listener: TcpListener,
    provider: Arc<dyn AuthInfoProvider>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl HostBrokerServer {
    /// Bind on `127.0.0.1:<port>`; port 0 picks a free one
    pub async fn bind(
        port: u16,
        provider: Arc<dyn AuthInfoProvider>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let address = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind broker server to {}", address))?;
        Ok(Self {
            listener,
            provider,
            telemetry,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Id announced to the daemon with `active`
    pub fn host_id(&self) -> std::io::Result<HostId> {
        Ok(HostId::new(self.local_addr()?.to_string()))
    }

    /// Serve until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Broker server listening on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if !peer_addr.ip().is_loopback() {
                                tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                                continue;
                            }
                            let provider = Arc::clone(&self.provider);
                            let telemetry = Arc::clone(&self.telemetry);
                            tokio::spawn(async move {
                                if let Err(e) = handle_daemon(stream, provider, telemetry).await {
                                    tracing::debug!("Broker connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept broker connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_daemon(
    stream: TcpStream,
    provider: Arc<dyn AuthInfoProvider>,
    telemetry: Arc<dyn TelemetrySink>,
) -> Result<(), IpcError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_message::<_, BrokerRequest>(&mut reader).await? {
        let response = match request {
            BrokerRequest::Ping => BrokerResponse::Pong,

            BrokerRequest::GetWorkspaceAuthInfo {
                workspace_id,
                gitpod_host,
            } => match provider.workspace_auth_info(&workspace_id, &gitpod_host).await {
                Ok(info) => BrokerResponse::AuthInfo(info),
                Err(e) => {
                    tracing::debug!(
                        workspace_id = %workspace_id,
                        code = ?e.code,
                        "Credential lookup failed: {}",
                        e.message
                    );
                    BrokerResponse::Error {
                        code: e.code,
                        message: e.message,
                    }
                }
            },

            BrokerRequest::SendUserFlowStatus(status) => {
                telemetry.user_flow_status(status).await;
                BrokerResponse::Ok
            }

            BrokerRequest::SendErrorReport(report) => {
                telemetry.error_report(report).await;
                BrokerResponse::Ok
            }
        };

        write_message(&mut writer, &response).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_core::WorkspacePhase;
    use std::sync::Mutex;

    struct StoppedWorkspace;

    #[async_trait]
    impl AuthInfoProvider for StoppedWorkspace {
        async fn workspace_auth_info(
            &self,
            workspace_id: &WorkspaceId,
            _gitpod_host: &str,
        ) -> Result<WorkspaceAuthInfo, ProviderError> {
            if workspace_id.as_str() == "ws-gone" {
                return Err(ProviderError::new(
                    Some(FailureCode::NoRunningInstance),
                    "workspace has no running instance",
                ));
            }
            Ok(WorkspaceAuthInfo {
                gitpod_host: "https://gitpod.io".to_string(),
                user_id: "user-1".to_string(),
                workspace_id: workspace_id.clone(),
                instance_id: "inst-1".to_string(),
                workspace_host: "ws-eu.gitpod.io".to_string(),
                owner_token: "token".to_string(),
                ssh_key: None,
                phase: WorkspacePhase::Stopped,
            })
        }
    }

    #[derive(Default)]
    struct RecordingTelemetry {
        reports: Mutex<Vec<ErrorReport>>,
    }

    #[async_trait]
    impl TelemetrySink for RecordingTelemetry {
        async fn user_flow_status(&self, _status: UserFlowStatus) {}

        async fn error_report(&self, report: ErrorReport) {
            self.reports.lock().unwrap().push(report);
        }
    }

    async fn exchange(address: SocketAddr, request: BrokerRequest) -> BrokerResponse {
        let stream = TcpStream::connect(address).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        write_message(&mut writer, &request).await.unwrap();
        read_message(&mut BufReader::new(reader))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_lookups_and_reports() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let server = HostBrokerServer::bind(0, Arc::new(StoppedWorkspace), telemetry.clone())
            .await
            .unwrap();
        let address = server.local_addr().unwrap();
        assert_eq!(server.host_id().unwrap().as_str(), address.to_string());

        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        assert!(matches!(
            exchange(address, BrokerRequest::Ping).await,
            BrokerResponse::Pong
        ));

        match exchange(
            address,
            BrokerRequest::GetWorkspaceAuthInfo {
                workspace_id: WorkspaceId::new("ws-gone"),
                gitpod_host: "https://gitpod.io".to_string(),
            },
        )
        .await
        {
            BrokerResponse::Error { code, .. } => {
                assert_eq!(code, Some(FailureCode::NoRunningInstance))
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let report = ErrorReport {
            code: FailureCode::SshAuthFailed,
            message: "denied".to_string(),
            workspace_id: Some("ws-abc123".to_string()),
            instance_id: None,
            user_id: None,
            gitpod_host: None,
        };
        assert!(matches!(
            exchange(address, BrokerRequest::SendErrorReport(report.clone())).await,
            BrokerResponse::Ok
        ));
        assert_eq!(*telemetry.reports.lock().unwrap(), vec![report]);

        cancel.cancel();
    }
}
