//! Editor-host side configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// How the host process starts and supervises the gateway daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Path to the `sg-daemon` executable
    pub daemon_executable: PathBuf,

    /// Port passed to the daemon
    pub listen_port: u16,

    /// Daemon IPC port, when the daemon is configured with one.
    /// Defaults to `listen_port + 1`.
    pub ipc_port: Option<u16>,

    /// Log level passed to the daemon
    pub log_level: String,

    /// Log file passed to the daemon
    pub log_file: Option<PathBuf>,

    /// Restarts allowed after an unexpected exit
    pub max_restarts: u32,

    /// Pause before each restart
    #[serde(with = "duration_secs")]
    pub restart_delay: Duration,

    /// Minimum daemon version this host works with
    pub required_version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            daemon_executable: PathBuf::from("sg-daemon"),
            listen_port: 42025,
            ipc_port: None,
            log_level: "info".to_string(),
            log_file: None,
            max_restarts: 3,
            restart_delay: Duration::from_secs(2),
            required_version: crate::DAEMON_VERSION.to_string(),
        }
    }
}

impl HostConfig {
    /// Positional arguments for the daemon: `<logLevel> <listenPort> [logFilePath]`
    pub fn daemon_args(&self) -> Vec<String> {
        let mut args = vec![self.log_level.clone(), self.listen_port.to_string()];
        if let Some(log_file) = &self.log_file {
            args.push(log_file.display().to_string());
        }
        args
    }

    /// Address of the daemon IPC server
    pub fn daemon_ipc_address(&self) -> String {
        let port = self
            .ipc_port
            .unwrap_or_else(|| self.listen_port.wrapping_add(1));
        format!("127.0.0.1:{}", port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_args() {
        let mut config = HostConfig::default();
        assert_eq!(config.daemon_args(), vec!["info", "42025"]);

        config.log_file = Some(PathBuf::from("/tmp/gateway.log"));
        config.log_level = "debug".to_string();
        assert_eq!(
            config.daemon_args(),
            vec!["debug", "42025", "/tmp/gateway.log"]
        );
    }

    #[test]
    fn test_ipc_address_follows_listen_port() {
        let config = HostConfig {
            listen_port: 5000,
            ..HostConfig::default()
        };
        assert_eq!(config.daemon_ipc_address(), "127.0.0.1:5001");
    }

    #[test]
    fn test_explicit_ipc_port() {
        let config: HostConfig = toml::from_str("listen_port = 5000\nipc_port = 7100").unwrap();
        assert_eq!(config.daemon_ipc_address(), "127.0.0.1:7100");
        // the daemon gets its IPC port from its own config, not the command line
        assert_eq!(config.daemon_args(), vec!["info", "5000"]);
    }
}
