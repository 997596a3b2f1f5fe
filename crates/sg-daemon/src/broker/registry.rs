//! Registry of live broker endpoints

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sg_core::config::BrokerConfig;
use sg_core::ipc::{ErrorReport, UserFlowStatus};
use sg_core::{HostId, RetryPolicy, WorkspaceAuthInfo, WorkspaceId};

use super::transport::{BrokerConnector, BrokerTransport};
use super::{BrokerError, CredentialBroker};

/// A host broker willing to answer credential and telemetry calls
#[derive(Clone)]
pub struct BrokerEndpoint {
    pub id: HostId,
    pub transport: Arc<dyn BrokerTransport>,
    pub last_seen_alive: Instant,
}

struct RegistryState {
    /// Most recently activated first
    endpoints: Vec<BrokerEndpoint>,
    /// Pending idle shutdown, if armed
    exit_timer: Option<CancellationToken>,
}

/// Process-wide set of broker endpoints
///
/// When the set stays empty for the configured grace period the daemon's
/// root token is cancelled, which shuts the process down cleanly.
pub struct BrokerRegistry {
    state: Mutex<RegistryState>,
    connector: Arc<dyn BrokerConnector>,
    config: BrokerConfig,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl BrokerRegistry {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        config: BrokerConfig,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                endpoints: Vec::new(),
                exit_timer: None,
            }),
            connector,
            config,
            retry,
            shutdown,
        }
    }

    /// Add an endpoint at the front unless already known.
    /// Cancels a pending idle shutdown either way.
    pub async fn register(&self, id: HostId) {
        let mut state = self.state.lock().await;

        if let Some(timer) = state.exit_timer.take() {
            timer.cancel();
            tracing::info!("Idle shutdown cancelled by registration of {}", id);
        }

        if state.endpoints.iter().any(|e| e.id == id) {
            tracing::debug!("Broker {} already registered", id);
            return;
        }

        let transport = self.connector.connect(&id);
        state.endpoints.insert(
            0,
            BrokerEndpoint {
                id: id.clone(),
                transport,
                last_seen_alive: Instant::now(),
            },
        );
        tracing::info!(
            broker = %id,
            endpoints = state.endpoints.len(),
            "Broker registered"
        );
    }

    /// Remove an endpoint. Arms the idle shutdown when the last one goes.
    pub async fn deregister(&self, id: &HostId, reason: &str) {
        let mut state = self.state.lock().await;

        let before = state.endpoints.len();
        state.endpoints.retain(|e| &e.id != id);
        if state.endpoints.len() == before {
            return;
        }

        tracing::info!(
            broker = %id,
            reason,
            endpoints = state.endpoints.len(),
            "Broker deregistered"
        );

        if state.endpoints.is_empty() {
            self.arm_exit_timer(&mut state);
        }
    }

    /// Arm the idle shutdown if no endpoint is registered. Called once at
    /// startup so a daemon nobody attaches to does not live forever.
    pub async fn arm_idle_shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.endpoints.is_empty() && state.exit_timer.is_none() {
            self.arm_exit_timer(&mut state);
        }
    }

    fn arm_exit_timer(&self, state: &mut RegistryState) {
        let timer = CancellationToken::new();
        if let Some(previous) = state.exit_timer.replace(timer.clone()) {
            previous.cancel();
        }

        let grace = self.config.idle_shutdown_grace;
        let shutdown = self.shutdown.clone();
        tracing::info!("No broker registered, shutting down in {:?} unless one attaches", grace);

        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    tracing::info!("Idle grace period elapsed, shutting down");
                    shutdown.cancel();
                }
            }
        });
    }

    /// Whether an idle shutdown is pending
    pub async fn shutdown_pending(&self) -> bool {
        self.state.lock().await.exit_timer.is_some()
    }

    /// Endpoint ids in lookup order
    pub async fn endpoint_ids(&self) -> Vec<HostId> {
        self.state
            .lock()
            .await
            .endpoints
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.endpoints.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn snapshot(&self) -> Vec<BrokerEndpoint> {
        self.state.lock().await.endpoints.clone()
    }

    /// Ping every endpoint concurrently. Endpoints failing the probe are
    /// deregistered.
    pub async fn probe_all(&self) {
        let endpoints = self.snapshot().await;
        if endpoints.is_empty() {
            return;
        }

        let timeout = self.config.ping_timeout;
        let results = join_all(endpoints.iter().map(|endpoint| async move {
            let alive = matches!(
                tokio::time::timeout(timeout, endpoint.transport.ping()).await,
                Ok(Ok(()))
            );
            (endpoint.id.clone(), alive)
        }))
        .await;

        for (id, alive) in results {
            if alive {
                let mut state = self.state.lock().await;
                if let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.id == id) {
                    endpoint.last_seen_alive = Instant::now();
                }
            } else {
                self.deregister(&id, "liveness probe failed").await;
            }
        }
    }

    /// One pass over the endpoints in order, stopping at the first answer
    /// or terminal error
    async fn resolve_once(
        &self,
        workspace_id: &WorkspaceId,
        gitpod_host: &str,
        attempt: u32,
    ) -> Result<WorkspaceAuthInfo, BrokerError> {
        let endpoints = self.snapshot().await;
        let mut last_error = BrokerError::NoEndpoints;

        for endpoint in endpoints {
            match endpoint
                .transport
                .get_workspace_auth_info(workspace_id, gitpod_host)
                .await
            {
                Ok(info) => return Ok(info),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        broker = %endpoint.id,
                        workspace_id = %workspace_id,
                        attempt,
                        error = %e,
                        "Auth info lookup failed, trying next broker"
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Time since an endpoint last answered a probe
    pub async fn last_seen(&self, id: &HostId) -> Option<Duration> {
        self.state
            .lock()
            .await
            .endpoints
            .iter()
            .find(|e| &e.id == id)
            .map(|e| e.last_seen_alive.elapsed())
    }
}

#[async_trait]
impl CredentialBroker for BrokerRegistry {
    async fn resolve_workspace_auth_info(
        &self,
        workspace_id: &WorkspaceId,
        gitpod_host: &str,
    ) -> Result<WorkspaceAuthInfo, BrokerError> {
        self.retry
            .run(
                move |attempt| self.resolve_once(workspace_id, gitpod_host, attempt),
                BrokerError::is_terminal,
            )
            .await
    }

    async fn report_error(&self, report: ErrorReport) {
        for endpoint in self.snapshot().await {
            match endpoint.transport.send_error_report(report.clone()).await {
                Ok(()) => return,
                Err(e) => tracing::debug!(broker = %endpoint.id, "Error report not delivered: {}", e),
            }
        }
        tracing::debug!(code = %report.code, "Error report dropped, no broker answered");
    }

    async fn report_user_flow(&self, status: UserFlowStatus) {
        for endpoint in self.snapshot().await {
            match endpoint.transport.send_user_flow_status(status.clone()).await {
                Ok(()) => return,
                Err(e) => tracing::debug!(broker = %endpoint.id, "Flow status not delivered: {}", e),
            }
        }
    }
}
