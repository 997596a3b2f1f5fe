//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a remote workspace (e.g. `ws-abc123`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Create a new workspace ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the ID only uses characters valid in a DNS label
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 63
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkspaceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of an editor-host broker endpoint.
///
/// This is the loopback address the host's broker server listens on,
/// e.g. `127.0.0.1:53124`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle phase of a workspace instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspacePhase {
    Unknown,
    Preparing,
    Building,
    Pending,
    Creating,
    Initializing,
    Running,
    Interrupted,
    Stopping,
    Stopped,
}

impl WorkspacePhase {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkspacePhase::Running)
    }
}

impl fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspacePhase::Unknown => "unknown",
            WorkspacePhase::Preparing => "preparing",
            WorkspacePhase::Building => "building",
            WorkspacePhase::Pending => "pending",
            WorkspacePhase::Creating => "creating",
            WorkspacePhase::Initializing => "initializing",
            WorkspacePhase::Running => "running",
            WorkspacePhase::Interrupted => "interrupted",
            WorkspacePhase::Stopping => "stopping",
            WorkspacePhase::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Credentials and routing information for one workspace.
///
/// Held only for the duration of a single authentication attempt and
/// never written to disk.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceAuthInfo {
    /// Gitpod installation the workspace belongs to (e.g. `https://gitpod.io`)
    pub gitpod_host: String,
    pub user_id: String,
    pub workspace_id: WorkspaceId,
    pub instance_id: String,
    /// Cluster host serving the workspace (e.g. `ws-eu.gitpod.io`)
    pub workspace_host: String,
    /// Short-lived owner token
    pub owner_token: String,
    /// Private key material, only present while the workspace is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    pub phase: WorkspacePhase,
}

// Secrets never reach the logs.
impl fmt::Debug for WorkspaceAuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceAuthInfo")
            .field("gitpod_host", &self.gitpod_host)
            .field("user_id", &self.user_id)
            .field("workspace_id", &self.workspace_id)
            .field("instance_id", &self.instance_id)
            .field("workspace_host", &self.workspace_host)
            .field("owner_token", &"<redacted>")
            .field("ssh_key", &self.ssh_key.as_ref().map(|_| "<redacted>"))
            .field("phase", &self.phase)
            .finish()
    }
}
