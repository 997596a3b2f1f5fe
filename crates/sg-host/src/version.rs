//! Daemon version coherency

use anyhow::Result;
use sg_core::version::is_older;

use crate::daemon_client::DaemonClient;

/// Whether the running daemon is recent enough for this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    UpToDate,
    /// The daemon is older than this host requires. The user is asked to
    /// restart it; it is never killed automatically, since it may be
    /// serving other connections.
    RestartSuggested { running: String, required: String },
}

pub fn check_daemon_version(running: &str, required: &str) -> VersionCheck {
    if is_older(running, required) {
        VersionCheck::RestartSuggested {
            running: running.to_string(),
            required: required.to_string(),
        }
    } else {
        VersionCheck::UpToDate
    }
}

/// Ask the daemon for its version and compare it with `required`
pub async fn check_running_daemon(client: &DaemonClient, required: &str) -> Result<VersionCheck> {
    let running = client.daemon_version().await?;
    let check = check_daemon_version(&running, required);
    if let VersionCheck::RestartSuggested { .. } = &check {
        tracing::warn!(
            running = %running,
            required,
            "Gateway daemon is outdated, a restart is suggested"
        );
    }
    Ok(check)
}
