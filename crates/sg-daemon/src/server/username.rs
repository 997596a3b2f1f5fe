//! Login username parsing
//!
//! The SSH username names the workspace: `[debug-]<workspaceId>[#<gitpodHost>]`.

use sg_core::WorkspaceId;
use thiserror::Error;

const DEBUG_PREFIX: &str = "debug-";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UsernameError {
    #[error("empty username")]
    Empty,

    #[error("'{0}' is not a workspace id")]
    Malformed(String),
}

/// Workspace a login is aimed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTarget {
    pub workspace_id: WorkspaceId,
    pub debug: bool,
    pub gitpod_host: String,
}

impl LoginTarget {
    pub fn parse(username: &str, default_gitpod_host: &str) -> Result<Self, UsernameError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(UsernameError::Empty);
        }

        let (id, host) = match username.split_once('#') {
            Some((id, host)) if !host.is_empty() => (id, Some(host)),
            Some(_) => return Err(UsernameError::Malformed(username.to_string())),
            None => (username, None),
        };

        let (id, debug) = match id.strip_prefix(DEBUG_PREFIX) {
            Some(rest) => (rest, true),
            None => (id, false),
        };

        let workspace_id = WorkspaceId::new(id);
        if !workspace_id.is_well_formed() {
            return Err(UsernameError::Malformed(username.to_string()));
        }

        let gitpod_host = match host {
            Some(host) if host.contains("://") => host.to_string(),
            Some(host) => format!("https://{}", host),
            None => default_gitpod_host.to_string(),
        };

        Ok(Self {
            workspace_id,
            debug,
            gitpod_host,
        })
    }
}

/// Compare Gitpod hosts ignoring scheme, case and trailing slash
pub fn same_gitpod_host(a: &str, b: &str) -> bool {
    fn normalize(host: &str) -> String {
        let host = host.trim();
        let host = host.split_once("://").map(|(_, rest)| rest).unwrap_or(host);
        host.trim_end_matches('/').to_ascii_lowercase()
    }
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_HOST: &str = "https://gitpod.io";

    #[test]
    fn test_plain_workspace_id() {
        let target = LoginTarget::parse("ws-abc123", DEFAULT_HOST).unwrap();
        assert_eq!(target.workspace_id.as_str(), "ws-abc123");
        assert!(!target.debug);
        assert_eq!(target.gitpod_host, DEFAULT_HOST);
    }

    #[test]
    fn test_debug_prefix_is_stripped() {
        let target = LoginTarget::parse("debug-ws-abc123", DEFAULT_HOST).unwrap();
        assert_eq!(target.workspace_id.as_str(), "ws-abc123");
        assert!(target.debug);
    }

    #[test]
    fn test_host_suffix() {
        let target = LoginTarget::parse("ws-abc123#gitpod.example.com", DEFAULT_HOST).unwrap();
        assert_eq!(target.gitpod_host, "https://gitpod.example.com");

        let target =
            LoginTarget::parse("ws-abc123#http://localhost:3000", DEFAULT_HOST).unwrap();
        assert_eq!(target.gitpod_host, "http://localhost:3000");
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(LoginTarget::parse("  ", DEFAULT_HOST), Err(UsernameError::Empty));
        assert!(matches!(
            LoginTarget::parse("ws_abc", DEFAULT_HOST),
            Err(UsernameError::Malformed(_))
        ));
        assert!(matches!(
            LoginTarget::parse("debug-", DEFAULT_HOST),
            Err(UsernameError::Malformed(_))
        ));
        assert!(matches!(
            LoginTarget::parse("ws-abc#", DEFAULT_HOST),
            Err(UsernameError::Malformed(_))
        ));
    }

    #[test]
    fn test_same_gitpod_host() {
        assert!(same_gitpod_host("https://gitpod.io", "gitpod.io/"));
        assert!(same_gitpod_host("https://Gitpod.io/", "https://gitpod.io"));
        assert!(!same_gitpod_host("https://gitpod.io", "https://example.com"));
    }
}
