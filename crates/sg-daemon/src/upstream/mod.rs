//! Upstream Connector
//!
//! Turns resolved workspace credentials into an authenticated outbound SSH
//! session by trying an ordered list of strategies.

mod client;
mod direct;
mod tunnel;
mod ws_stream;

pub use client::{remote_close_reason, UpstreamClosed, UpstreamEvent, UpstreamHandler};
pub use direct::DirectStrategy;
pub use tunnel::TunnelStrategy;
pub use ws_stream::WsByteStream;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Handle;
use tokio::sync::mpsc;

use sg_core::config::{StrategyKind, UpstreamConfig};
use sg_core::{FailureCode, WorkspaceAuthInfo};

/// A failed connection attempt, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub code: FailureCode,
    pub message: String,
}

impl UpstreamError {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for UpstreamError {}

/// The workspace a connection attempt is aimed at
pub struct UpstreamTarget<'a> {
    pub info: &'a WorkspaceAuthInfo,
    /// Debug workspaces are served under a `debug-` prefixed host label
    pub debug: bool,
}

impl<'a> UpstreamTarget<'a> {
    pub fn new(info: &'a WorkspaceAuthInfo, debug: bool) -> Self {
        Self { info, debug }
    }

    /// DNS label of the workspace
    pub fn host_label(&self) -> String {
        if self.debug {
            format!("debug-{}", self.info.workspace_id)
        } else {
            self.info.workspace_id.to_string()
        }
    }

    fn workspace_host(&self) -> &str {
        let host = self.info.workspace_host.as_str();
        let host = host
            .strip_prefix("https://")
            .or_else(|| host.strip_prefix("http://"))
            .unwrap_or(host);
        host.trim_end_matches('/')
    }

    /// Host of the direct SSH endpoint, `<label>.ssh.<workspaceHost>`
    pub fn direct_host(&self) -> String {
        format!("{}.ssh.{}", self.host_label(), self.workspace_host())
    }

    /// URL of the supervisor tunnel endpoint
    pub fn tunnel_url(&self, tunnel_path: &str) -> String {
        format!(
            "wss://{}.{}/_supervisor/{}",
            self.host_label(),
            self.workspace_host(),
            tunnel_path.trim_start_matches('/')
        )
    }
}

/// One way of reaching a workspace
#[async_trait]
pub trait UpstreamStrategy<S: Send>: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Open and authenticate a session. Partial progress must be torn
    /// down before returning an error.
    async fn attempt(&self, target: &UpstreamTarget<'_>) -> Result<S, UpstreamError>;
}

/// A strategy that failed during [`UpstreamConnector::connect`]
#[derive(Debug, Clone)]
pub struct StrategyFailure {
    pub kind: StrategyKind,
    pub error: UpstreamError,
}

/// A session produced by the connector
pub struct Connected<S> {
    pub session: S,
    pub kind: StrategyKind,
    /// Strategies that failed before this one succeeded
    pub failed: Vec<StrategyFailure>,
}

/// Every strategy failed
#[derive(Debug, Clone)]
pub struct ConnectFailure {
    pub failed: Vec<StrategyFailure>,
}

impl ConnectFailure {
    /// Code of the last strategy tried
    pub fn code(&self) -> FailureCode {
        self.failed
            .last()
            .map(|f| f.error.code)
            .unwrap_or(FailureCode::Unexpected)
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failed.is_empty() {
            return write!(f, "no upstream strategy configured");
        }
        let parts: Vec<String> = self
            .failed
            .iter()
            .map(|failure| format!("{} ({})", failure.kind, failure.error))
            .collect();
        write!(f, "all upstream strategies failed: {}", parts.join("; "))
    }
}

/// Tries strategies in order; the first success wins
pub struct UpstreamConnector<S: Send> {
    strategies: Vec<Box<dyn UpstreamStrategy<S>>>,
}

impl<S: Send> UpstreamConnector<S> {
    pub fn new(strategies: Vec<Box<dyn UpstreamStrategy<S>>>) -> Self {
        Self { strategies }
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// Run the strategies sequentially. A strategy is fully given up
    /// before the next one starts.
    pub async fn connect(
        &self,
        target: &UpstreamTarget<'_>,
    ) -> Result<Connected<S>, ConnectFailure> {
        let mut failed = Vec::new();

        for strategy in &self.strategies {
            let kind = strategy.kind();
            tracing::debug!(
                workspace_id = %target.info.workspace_id,
                strategy = %kind,
                "Trying upstream strategy"
            );

            match strategy.attempt(target).await {
                Ok(session) => {
                    tracing::info!(
                        workspace_id = %target.info.workspace_id,
                        strategy = %kind,
                        "Upstream session established"
                    );
                    return Ok(Connected {
                        session,
                        kind,
                        failed,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        workspace_id = %target.info.workspace_id,
                        strategy = %kind,
                        code = %error.code,
                        "Upstream strategy failed: {}",
                        error.message
                    );
                    failed.push(StrategyFailure { kind, error });
                }
            }
        }

        Err(ConnectFailure { failed })
    }
}

impl UpstreamConnector<UpstreamSession> {
    /// Build the russh-backed strategies in configured order
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let ssh_config = Arc::new(russh::client::Config::default());
        let strategies = config
            .strategy_order
            .iter()
            .map(|kind| -> Box<dyn UpstreamStrategy<UpstreamSession>> {
                match kind {
                    StrategyKind::Direct => Box::new(DirectStrategy::new(
                        Arc::clone(&ssh_config),
                        config.direct_port,
                        config.connect_timeout,
                    )),
                    StrategyKind::Tunnel => Box::new(TunnelStrategy::new(
                        Arc::clone(&ssh_config),
                        config.upstream_user.clone(),
                        config.tunnel_path.clone(),
                        config.connect_timeout,
                    )),
                }
            })
            .collect();
        Self::new(strategies)
    }
}

/// An authenticated outbound session to a workspace
pub struct UpstreamSession {
    pub kind: StrategyKind,
    pub handle: Handle<UpstreamHandler>,
    /// Channels the workspace opens towards us
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
    /// Signalled once the session's connection is gone
    pub closed: UpstreamClosed,
}
