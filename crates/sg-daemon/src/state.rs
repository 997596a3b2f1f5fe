//! Global gateway state

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sg_core::config::GatewayConfig;
use sg_core::ipc::DaemonStatus;
use sg_core::DAEMON_VERSION;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerConnector, BrokerRegistry};
use crate::server::Authenticator;
use crate::upstream::{UpstreamConnector, UpstreamSession};

/// State shared by the listener, the IPC server and the liveness loop
pub struct GatewayState {
    /// Configuration
    pub config: GatewayConfig,
    /// Registered host brokers
    pub brokers: Arc<BrokerRegistry>,
    /// Login flow
    pub authenticator: Arc<Authenticator>,
    /// Root shutdown token
    pub cancel: CancellationToken,
    live_connections: AtomicUsize,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn BrokerConnector>,
        cancel: CancellationToken,
    ) -> Self {
        let upstream = UpstreamConnector::from_config(&config.upstream);
        Self::with_upstream(config, connector, upstream, cancel)
    }

    /// Build the state around a given upstream connector
    pub fn with_upstream(
        config: GatewayConfig,
        connector: Arc<dyn BrokerConnector>,
        upstream: UpstreamConnector<UpstreamSession>,
        cancel: CancellationToken,
    ) -> Self {
        let brokers = Arc::new(BrokerRegistry::new(
            connector,
            config.broker.clone(),
            config.retry.clone(),
            cancel.clone(),
        ));
        let authenticator = Arc::new(Authenticator::new(
            Arc::clone(&brokers) as Arc<dyn crate::broker::CredentialBroker>,
            upstream,
            config.default_gitpod_host.clone(),
            config.auth_watchdog,
        ));

        Self {
            config,
            brokers,
            authenticator,
            cancel,
            live_connections: AtomicUsize::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn connection_opened(&self) -> usize {
        let live = self.live_connections.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(live_connections = live, "Connection opened");
        live
    }

    pub fn connection_closed(&self) -> usize {
        let live = self
            .live_connections
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        tracing::info!(live_connections = live, "Connection closed");
        live
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::SeqCst)
    }

    /// Diagnostics snapshot
    pub async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            version: DAEMON_VERSION.to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            live_connections: self.live_connections(),
            broker_endpoints: self.brokers.len().await,
            listen_address: self.config.listen_address(),
        }
    }
}
