//! IPC protocols between the gateway daemon and editor-host processes
//!
//! Both directions use newline-delimited JSON over TCP on 127.0.0.1, one
//! request and one response per line:
//!
//! - the **broker** interface is served by each host process and called by
//!   the daemon (credential lookups, telemetry)
//! - the **daemon** interface is served by the daemon and called by hosts
//!   (activation, liveness, version)

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FailureCode, IpcError};
use crate::types::{HostId, WorkspaceAuthInfo, WorkspaceId};

/// Request from the daemon to a host broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerRequest {
    /// Liveness probe
    Ping,

    /// Resolve credentials and routing for a workspace
    GetWorkspaceAuthInfo {
        workspace_id: WorkspaceId,
        gitpod_host: String,
    },

    /// Connection outcome telemetry
    SendUserFlowStatus(UserFlowStatus),

    /// Failure report
    SendErrorReport(ErrorReport),
}

/// Response from a host broker to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerResponse {
    Pong,

    /// Resolved workspace credentials
    AuthInfo(WorkspaceAuthInfo),

    /// Generic success
    Ok,

    /// Error response. `code` classifies well-known failures.
    Error {
        code: Option<FailureCode>,
        message: String,
    },
}

/// Request from a host process to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// A host broker became available at `host_id`
    Active { host_id: HostId },

    /// A host broker is going away
    Inactive { host_id: HostId },

    Ping,

    GetDaemonVersion,

    /// Diagnostics snapshot
    GetStatus,

    /// Stop the daemon
    Shutdown,
}

/// Response from the daemon to a host process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    Ok,
    Pong,
    Version { version: String },
    Status(DaemonStatus),
    Error { message: String },
}

/// Daemon diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    /// Inbound SSH sessions currently open
    pub live_connections: usize,
    /// Registered host brokers
    pub broker_endpoints: usize,
    pub listen_address: String,
}

/// Outcome of one local SSH connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Connected,
    Failed,
}

/// Telemetry describing one connection flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFlowStatus {
    /// Flow name, `local_ssh` for gateway connections
    pub flow: String,
    pub status: FlowStatus,
    pub workspace_id: Option<String>,
    pub instance_id: Option<String>,
    pub user_id: Option<String>,
    pub failure_code: Option<FailureCode>,
}

/// Failure report filed through the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: FailureCode,
    pub message: String,
    pub workspace_id: Option<String>,
    pub instance_id: Option<String>,
    pub user_id: Option<String>,
    pub gitpod_host: Option<String>,
}

/// Flow name for connections through the local gateway
pub const LOCAL_SSH_FLOW: &str = "local_ssh";

/// Write one message as a JSON line and flush
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON line. Returns `None` when the peer closed the connection.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, IpcError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}
