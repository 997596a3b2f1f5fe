//! Failure taxonomy and shared error types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Classified reason a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCode {
    /// Direct SSH connection rejected the owner token
    SshAuthFailed,
    /// Direct SSH connection could not be established
    SshTransportFailed,
    /// Workspace key material was missing or unreadable
    TunnelKeyFailed,
    /// WebSocket to the workspace supervisor could not be opened
    TunnelWebsocketFailed,
    /// SSH handshake over the WebSocket failed
    TunnelChannelFailed,
    /// Workspace rejected the key over the tunnel
    TunnelAuthFailed,
    /// Workspace has no running instance
    NoRunningInstance,
    /// No broker could provide credentials
    AuthInfoUnavailable,
    /// Workspace belongs to a different Gitpod host
    HostMismatch,
    /// Host has no access token for the Gitpod installation
    NoAccessToken,
    /// Lookup was cancelled by the host
    LookupCancelled,
    /// Username did not name a workspace
    InvalidUsername,
    /// Authentication did not finish in time
    AuthTimedOut,
    Unexpected,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::SshAuthFailed => "ssh-auth-failed",
            FailureCode::SshTransportFailed => "ssh-transport-failed",
            FailureCode::TunnelKeyFailed => "tunnel-key-failed",
            FailureCode::TunnelWebsocketFailed => "tunnel-websocket-failed",
            FailureCode::TunnelChannelFailed => "tunnel-channel-failed",
            FailureCode::TunnelAuthFailed => "tunnel-auth-failed",
            FailureCode::NoRunningInstance => "no-running-instance",
            FailureCode::AuthInfoUnavailable => "auth-info-unavailable",
            FailureCode::HostMismatch => "host-mismatch",
            FailureCode::NoAccessToken => "no-access-token",
            FailureCode::LookupCancelled => "lookup-cancelled",
            FailureCode::InvalidUsername => "invalid-username",
            FailureCode::AuthTimedOut => "auth-timed-out",
            FailureCode::Unexpected => "unexpected",
        }
    }

    /// Whether retrying the same operation could change the outcome
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureCode::NoRunningInstance
                | FailureCode::HostMismatch
                | FailureCode::NoAccessToken
                | FailureCode::LookupCancelled
                | FailureCode::InvalidUsername
        )
    }

    /// Expected outcomes are not filed as error reports
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            FailureCode::NoRunningInstance
                | FailureCode::AuthInfoUnavailable
                | FailureCode::LookupCancelled
        )
    }

    /// How the inbound session should be disconnected for this failure
    pub fn disconnect_kind(&self) -> DisconnectKind {
        match self {
            FailureCode::SshTransportFailed
            | FailureCode::TunnelWebsocketFailed
            | FailureCode::TunnelChannelFailed
            | FailureCode::AuthTimedOut
            | FailureCode::Unexpected => DisconnectKind::Transport,
            _ => DisconnectKind::HostNotAllowed,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse disconnect classification sent to the local SSH client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Workspace or credential problem
    HostNotAllowed,
    /// Network or protocol problem on the way to the workspace
    Transport,
}

/// Identifiers attached to a failure for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub workspace_id: Option<String>,
    pub instance_id: Option<String>,
    pub user_id: Option<String>,
}

/// A classified failure, used to decide retry/stop and to shape error reports.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub code: FailureCode,
    pub retryable: bool,
    pub context: FailureContext,
}

impl FailureRecord {
    pub fn new(code: FailureCode, context: FailureContext) -> Self {
        Self {
            code,
            retryable: code.is_retryable(),
            context,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors on a JSON-lines IPC connection
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed IPC message: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer closed the connection before answering
    #[error("IPC connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_code_wire_names() {
        let json = serde_json::to_string(&FailureCode::NoRunningInstance).unwrap();
        assert_eq!(json, "\"no-running-instance\"");
        let parsed: FailureCode = serde_json::from_str("\"tunnel-websocket-failed\"").unwrap();
        assert_eq!(parsed, FailureCode::TunnelWebsocketFailed);
        assert_eq!(parsed.to_string(), "tunnel-websocket-failed");
    }

    #[test]
    fn test_terminal_codes_are_not_retryable() {
        assert!(!FailureCode::NoRunningInstance.is_retryable());
        assert!(!FailureCode::HostMismatch.is_retryable());
        assert!(!FailureCode::NoAccessToken.is_retryable());
        assert!(FailureCode::AuthInfoUnavailable.is_retryable());
        assert!(FailureCode::SshTransportFailed.is_retryable());
    }

    #[test]
    fn test_expected_codes_are_not_reported() {
        assert!(!FailureCode::NoRunningInstance.is_reportable());
        assert!(!FailureCode::AuthInfoUnavailable.is_reportable());
        assert!(!FailureCode::LookupCancelled.is_reportable());
        assert!(FailureCode::SshAuthFailed.is_reportable());
        assert!(FailureCode::TunnelChannelFailed.is_reportable());
    }

    #[test]
    fn test_disconnect_kind() {
        assert_eq!(
            FailureCode::NoRunningInstance.disconnect_kind(),
            DisconnectKind::HostNotAllowed
        );
        assert_eq!(
            FailureCode::TunnelAuthFailed.disconnect_kind(),
            DisconnectKind::HostNotAllowed
        );
        assert_eq!(
            FailureCode::TunnelWebsocketFailed.disconnect_kind(),
            DisconnectKind::Transport
        );
    }

    #[test]
    fn test_failure_record_retryable_follows_code() {
        let record = FailureRecord::new(FailureCode::HostMismatch, FailureContext::default());
        assert!(!record.retryable);
        let record = FailureRecord::new(FailureCode::SshTransportFailed, FailureContext::default());
        assert!(record.retryable);
    }
}
