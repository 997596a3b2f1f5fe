//! Credential Broker Client
//!
//! Keeps the set of live editor-host broker endpoints and fans credential
//! lookups and telemetry out to them with failover.

mod liveness;
mod registry;
mod transport;

pub use liveness::run_liveness;
pub use registry::{BrokerEndpoint, BrokerRegistry};
pub use transport::{BrokerConnector, BrokerTransport, TcpBrokerConnector, TcpBrokerTransport};

use async_trait::async_trait;
use sg_core::ipc::{ErrorReport, UserFlowStatus};
use sg_core::{FailureCode, WorkspaceAuthInfo, WorkspaceId};
use thiserror::Error;

/// Errors from broker calls
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// No host has announced itself
    #[error("No broker endpoint registered")]
    NoEndpoints,

    /// The endpoint could not be reached
    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Broker request timed out")]
    Timeout,

    /// The host answered with an error
    #[error("{message}")]
    Remote {
        code: Option<FailureCode>,
        message: String,
    },

    #[error("Unexpected broker response: {0}")]
    UnexpectedResponse(String),
}

impl BrokerError {
    /// Failure code of a lookup that ended with this error
    pub fn failure_code(&self) -> FailureCode {
        match self {
            BrokerError::Remote {
                code: Some(code), ..
            } => *code,
            _ => FailureCode::AuthInfoUnavailable,
        }
    }

    /// Whether retrying or asking another endpoint cannot help
    pub fn is_terminal(&self) -> bool {
        !self.failure_code().is_retryable()
    }
}

/// What the gateway needs from the broker side
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Resolve credentials for a workspace, retrying transient failures
    async fn resolve_workspace_auth_info(
        &self,
        workspace_id: &WorkspaceId,
        gitpod_host: &str,
    ) -> Result<WorkspaceAuthInfo, BrokerError>;

    /// File an error report. Best-effort.
    async fn report_error(&self, report: ErrorReport);

    /// Send connection telemetry. Best-effort.
    async fn report_user_flow(&self, status: UserFlowStatus);
}
