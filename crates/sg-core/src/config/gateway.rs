//! Gateway daemon configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::retry::RetryPolicy;

/// Configuration for the gateway daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the SSH listener binds to. Loopback only in practice.
    pub bind_host: String,

    /// Port of the local SSH listener
    pub listen_port: u16,

    /// Port of the daemon IPC server (defaults to `listen_port + 1`)
    pub ipc_port: Option<u16>,

    /// Path to the host key file. A key is generated in memory if absent.
    pub host_key_path: PathBuf,

    /// Gitpod host used when the username does not name one
    pub default_gitpod_host: String,

    /// Outbound connection settings
    pub upstream: UpstreamConfig,

    /// Retry policy for credential lookups
    pub retry: RetryPolicy,

    /// Broker registry settings
    pub broker: BrokerConfig,

    /// Ceiling for one inbound authentication flow
    #[serde(with = "duration_secs")]
    pub auth_watchdog: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            listen_port: 42025,
            ipc_port: None,
            host_key_path: super::default_config_dir().join("host_key"),
            default_gitpod_host: "https://gitpod.io".to_string(),
            upstream: UpstreamConfig::default(),
            retry: RetryPolicy::default(),
            broker: BrokerConfig::default(),
            auth_watchdog: Duration::from_secs(60),
        }
    }
}

impl GatewayConfig {
    /// Address of the SSH listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.listen_port)
    }

    /// Address of the daemon IPC server (localhost only)
    pub fn ipc_address(&self) -> String {
        let port = self
            .ipc_port
            .unwrap_or_else(|| self.listen_port.wrapping_add(1));
        format!("127.0.0.1:{}", port)
    }
}

/// Outbound path to a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// SSH over TCP to `<id>.ssh.<workspaceHost>`
    Direct,
    /// SSH inside a WebSocket to the workspace supervisor
    Tunnel,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Direct => write!(f, "direct"),
            StrategyKind::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// Outbound connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Strategies tried in order. `["tunnel"]` forces tunnel-only.
    pub strategy_order: Vec<StrategyKind>,

    /// Username presented to the workspace on the tunnel path
    pub upstream_user: String,

    /// SSH port of the direct path
    pub direct_port: u16,

    /// Path below `/_supervisor/` serving the SSH tunnel
    pub tunnel_path: String,

    /// Timeout for one connection attempt, handshake and auth included
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout for opening the upstream mirror of one channel. Other
    /// traffic on the same inbound session waits while a mirror opens.
    #[serde(with = "duration_secs")]
    pub channel_open_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            strategy_order: vec![StrategyKind::Direct, StrategyKind::Tunnel],
            upstream_user: "gitpod".to_string(),
            direct_port: 22,
            tunnel_path: "tunnel/ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            channel_open_timeout: Duration::from_secs(3),
        }
    }
}

/// Broker registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Interval between liveness probes
    #[serde(with = "duration_secs")]
    pub liveness_interval: Duration,

    /// Timeout of one liveness ping
    #[serde(with = "duration_secs")]
    pub ping_timeout: Duration,

    /// How long the daemon lingers with no registered endpoint
    #[serde(with = "duration_secs")]
    pub idle_shutdown_grace: Duration,

    /// Timeout of one broker request
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            idle_shutdown_grace: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}
