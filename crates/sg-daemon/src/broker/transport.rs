//! Transport to a single host broker
//!
//! One TCP connection per request, newline-delimited JSON, loopback only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;

use sg_core::ipc::{
    read_message, write_message, BrokerRequest, BrokerResponse, ErrorReport, UserFlowStatus,
};
use sg_core::{HostId, IpcError, WorkspaceAuthInfo, WorkspaceId};

use super::BrokerError;

/// Request/response channel to one broker endpoint
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Send one request and wait for its response
    async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError> {
        match self.call(BrokerRequest::Ping).await? {
            BrokerResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_workspace_auth_info(
        &self,
        workspace_id: &WorkspaceId,
        gitpod_host: &str,
    ) -> Result<WorkspaceAuthInfo, BrokerError> {
        let request = BrokerRequest::GetWorkspaceAuthInfo {
            workspace_id: workspace_id.clone(),
            gitpod_host: gitpod_host.to_string(),
        };
        match self.call(request).await? {
            BrokerResponse::AuthInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn send_user_flow_status(&self, status: UserFlowStatus) -> Result<(), BrokerError> {
        match self.call(BrokerRequest::SendUserFlowStatus(status)).await? {
            BrokerResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn send_error_report(&self, report: ErrorReport) -> Result<(), BrokerError> {
        match self.call(BrokerRequest::SendErrorReport(report)).await? {
            BrokerResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: BrokerResponse) -> BrokerError {
    match response {
        BrokerResponse::Error { code, message } => BrokerError::Remote { code, message },
        other => BrokerError::UnexpectedResponse(format!("{:?}", other)),
    }
}

/// Creates transports for announced host ids
pub trait BrokerConnector: Send + Sync {
    fn connect(&self, host_id: &HostId) -> Arc<dyn BrokerTransport>;
}

/// Broker transport over loopback TCP. The host id is the broker's address.
pub struct TcpBrokerTransport {
    address: String,
    timeout: Duration,
}

impl TcpBrokerTransport {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    async fn exchange(&self, request: &BrokerRequest) -> Result<BrokerResponse, IpcError> {
        let stream = TcpStream::connect(&self.address).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_message(&mut writer, request).await?;
        read_message(&mut reader).await?.ok_or(IpcError::Closed)
    }
}

#[async_trait]
impl BrokerTransport for TcpBrokerTransport {
    async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse, BrokerError> {
        match tokio::time::timeout(self.timeout, self.exchange(&request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(BrokerError::Transport(format!("{}: {}", self.address, e))),
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}

/// Connector producing [`TcpBrokerTransport`]s
pub struct TcpBrokerConnector {
    timeout: Duration,
}

impl TcpBrokerConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl BrokerConnector for TcpBrokerConnector {
    fn connect(&self, host_id: &HostId) -> Arc<dyn BrokerTransport> {
        Arc::new(TcpBrokerTransport::new(host_id.as_str(), self.timeout))
    }
}
