//! Authentication flow for inbound logins
//!
//! An inbound login is accepted only once an upstream session to the
//! named workspace exists. Every outcome is reported to the broker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sg_core::config::StrategyKind;
use sg_core::ipc::{ErrorReport, FlowStatus, UserFlowStatus, LOCAL_SSH_FLOW};
use sg_core::{FailureCode, FailureContext, FailureRecord};

use super::username::{same_gitpod_host, LoginTarget};
use crate::broker::CredentialBroker;
use crate::upstream::{UpstreamConnector, UpstreamSession, UpstreamTarget};

/// A login that reached its workspace
pub struct Authenticated<S> {
    pub session: S,
    pub kind: StrategyKind,
    pub context: FailureContext,
}

/// A rejected login
#[derive(Debug, Clone)]
pub struct AuthFailure {
    pub record: FailureRecord,
    pub message: String,
}

impl AuthFailure {
    pub fn code(&self) -> FailureCode {
        self.record.code
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.record.code, self.message)
    }
}

/// Resolves credentials and connects upstream for a login username
pub struct Authenticator<S: Send = UpstreamSession> {
    broker: Arc<dyn CredentialBroker>,
    connector: UpstreamConnector<S>,
    default_gitpod_host: String,
    watchdog: Duration,
}

impl<S: Send> Authenticator<S> {
    pub fn new(
        broker: Arc<dyn CredentialBroker>,
        connector: UpstreamConnector<S>,
        default_gitpod_host: impl Into<String>,
        watchdog: Duration,
    ) -> Self {
        Self {
            broker,
            connector,
            default_gitpod_host: default_gitpod_host.into(),
            watchdog,
        }
    }

    /// Authenticate `username`. Never takes longer than the watchdog.
    pub async fn authenticate(&self, username: &str) -> Result<Authenticated<S>, AuthFailure> {
        let target = match LoginTarget::parse(username, &self.default_gitpod_host) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(username, "Rejecting login: {}", e);
                let record = FailureRecord::new(FailureCode::InvalidUsername, FailureContext::default());
                return Err(AuthFailure {
                    record,
                    message: e.to_string(),
                });
            }
        };

        if target.debug {
            tracing::info!(workspace_id = %target.workspace_id, "Debug workspace login");
        }

        match tokio::time::timeout(self.watchdog, self.connect(&target)).await {
            Ok(result) => result,
            Err(_) => {
                let context = FailureContext {
                    workspace_id: Some(target.workspace_id.to_string()),
                    ..Default::default()
                };
                let message = format!(
                    "authentication did not finish within {}s",
                    self.watchdog.as_secs()
                );
                tracing::error!(workspace_id = %target.workspace_id, "{}", message);

                // the broker may be what hung; report without holding up
                // the rejection
                let code = FailureCode::AuthTimedOut;
                let report = error_report(code, &message, &context, &target);
                let flow = flow_status(FlowStatus::Failed, Some(code), &context);
                let broker = Arc::clone(&self.broker);
                tokio::spawn(async move {
                    if let Some(report) = report {
                        broker.report_error(report).await;
                    }
                    broker.report_user_flow(flow).await;
                });

                Err(AuthFailure {
                    record: FailureRecord::new(code, context),
                    message,
                })
            }
        }
    }

    async fn connect(&self, target: &LoginTarget) -> Result<Authenticated<S>, AuthFailure> {
        let mut context = FailureContext {
            workspace_id: Some(target.workspace_id.to_string()),
            ..Default::default()
        };

        let info = match self
            .broker
            .resolve_workspace_auth_info(&target.workspace_id, &target.gitpod_host)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                return Err(self
                    .fail(e.failure_code(), e.to_string(), context, target)
                    .await)
            }
        };

        context.instance_id = Some(info.instance_id.clone());
        context.user_id = Some(info.user_id.clone());

        if !info.phase.is_running() {
            let message = format!("workspace is not running (phase: {})", info.phase);
            return Err(self
                .fail(FailureCode::NoRunningInstance, message, context, target)
                .await);
        }

        if !same_gitpod_host(&info.gitpod_host, &target.gitpod_host) {
            let message = format!(
                "workspace belongs to {}, not {}",
                info.gitpod_host, target.gitpod_host
            );
            return Err(self
                .fail(FailureCode::HostMismatch, message, context, target)
                .await);
        }

        let upstream = UpstreamTarget::new(&info, target.debug);
        match self.connector.connect(&upstream).await {
            Ok(connected) => {
                for failure in &connected.failed {
                    self.report(failure.error.code, &failure.error.message, &context, target)
                        .await;
                }
                self.report_flow(FlowStatus::Connected, None, &context).await;
                Ok(Authenticated {
                    session: connected.session,
                    kind: connected.kind,
                    context,
                })
            }
            Err(failure) => {
                for attempt in &failure.failed {
                    self.report(attempt.error.code, &attempt.error.message, &context, target)
                        .await;
                }
                let code = failure.code();
                self.report_flow(FlowStatus::Failed, Some(code), &context).await;
                Err(AuthFailure {
                    record: FailureRecord::new(code, context),
                    message: failure.to_string(),
                })
            }
        }
    }

    async fn fail(
        &self,
        code: FailureCode,
        message: String,
        context: FailureContext,
        target: &LoginTarget,
    ) -> AuthFailure {
        tracing::warn!(
            workspace_id = %target.workspace_id,
            code = %code,
            "Login failed: {}",
            message
        );
        self.report(code, &message, &context, target).await;
        self.report_flow(FlowStatus::Failed, Some(code), &context).await;
        AuthFailure {
            record: FailureRecord::new(code, context),
            message,
        }
    }

    async fn report(
        &self,
        code: FailureCode,
        message: &str,
        context: &FailureContext,
        target: &LoginTarget,
    ) {
        if let Some(report) = error_report(code, message, context, target) {
            self.broker.report_error(report).await;
        }
    }

    async fn report_flow(
        &self,
        status: FlowStatus,
        failure_code: Option<FailureCode>,
        context: &FailureContext,
    ) {
        self.broker
            .report_user_flow(flow_status(status, failure_code, context))
            .await;
    }
}

/// Error report for `code`, or `None` for expected outcomes
fn error_report(
    code: FailureCode,
    message: &str,
    context: &FailureContext,
    target: &LoginTarget,
) -> Option<ErrorReport> {
    if !code.is_reportable() {
        return None;
    }
    Some(ErrorReport {
        code,
        message: message.to_string(),
        workspace_id: context.workspace_id.clone(),
        instance_id: context.instance_id.clone(),
        user_id: context.user_id.clone(),
        gitpod_host: Some(target.gitpod_host.clone()),
    })
}

fn flow_status(
    status: FlowStatus,
    failure_code: Option<FailureCode>,
    context: &FailureContext,
) -> UserFlowStatus {
    UserFlowStatus {
        flow: LOCAL_SSH_FLOW.to_string(),
        status,
        workspace_id: context.workspace_id.clone(),
        instance_id: context.instance_id.clone(),
        user_id: context.user_id.clone(),
        failure_code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use crate::upstream::{UpstreamError, UpstreamStrategy};
    use async_trait::async_trait;
    use sg_core::{WorkspaceAuthInfo, WorkspaceId, WorkspacePhase};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn info(phase: WorkspacePhase) -> WorkspaceAuthInfo {
        WorkspaceAuthInfo {
            gitpod_host: "https://gitpod.io".to_string(),
            user_id: "user-1".to_string(),
            workspace_id: WorkspaceId::new("ws-abc123"),
            instance_id: "inst-1".to_string(),
            workspace_host: "ws-eu.gitpod.io".to_string(),
            owner_token: "owner-token".to_string(),
            ssh_key: None,
            phase,
        }
    }

    #[derive(Default)]
    struct FakeBroker {
        info: Option<WorkspaceAuthInfo>,
        hang: bool,
        slow_reports: bool,
        errors: Mutex<Vec<ErrorReport>>,
        flows: Mutex<Vec<UserFlowStatus>>,
    }

    #[async_trait]
    impl CredentialBroker for FakeBroker {
        async fn resolve_workspace_auth_info(
            &self,
            _workspace_id: &WorkspaceId,
            _gitpod_host: &str,
        ) -> Result<WorkspaceAuthInfo, BrokerError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.info.clone().ok_or(BrokerError::NoEndpoints)
        }

        async fn report_error(&self, report: ErrorReport) {
            if self.slow_reports {
                tokio::time::sleep(Duration::from_secs(300)).await;
            }
            self.errors.lock().unwrap().push(report);
        }

        async fn report_user_flow(&self, status: UserFlowStatus) {
            if self.slow_reports {
                tokio::time::sleep(Duration::from_secs(300)).await;
            }
            self.flows.lock().unwrap().push(status);
        }
    }

    struct Scripted {
        kind: StrategyKind,
        result: Result<&'static str, FailureCode>,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UpstreamStrategy<&'static str> for Scripted {
        fn kind(&self) -> StrategyKind {
            self.kind
        }

        async fn attempt(&self, _target: &UpstreamTarget<'_>) -> Result<&'static str, UpstreamError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .map_err(|code| UpstreamError::new(code, "scripted failure"))
        }
    }

    fn direct_then_tunnel(
        direct: Result<&'static str, FailureCode>,
        tunnel: Result<&'static str, FailureCode>,
        attempts: &Arc<AtomicUsize>,
    ) -> UpstreamConnector<&'static str> {
        UpstreamConnector::new(vec![
            Box::new(Scripted {
                kind: StrategyKind::Direct,
                result: direct,
                attempts: attempts.clone(),
            }),
            Box::new(Scripted {
                kind: StrategyKind::Tunnel,
                result: tunnel,
                attempts: attempts.clone(),
            }),
        ])
    }

    fn authenticator(
        broker: Arc<FakeBroker>,
        connector: UpstreamConnector<&'static str>,
    ) -> Authenticator<&'static str> {
        Authenticator::new(broker, connector, "https://gitpod.io", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_stopped_workspace_is_refused_without_connecting() {
        let broker = Arc::new(FakeBroker {
            info: Some(info(WorkspacePhase::Stopped)),
            ..Default::default()
        });
        let attempts = Arc::new(AtomicUsize::new(0));
        let auth = authenticator(
            broker.clone(),
            direct_then_tunnel(Ok("direct"), Ok("tunnel"), &attempts),
        );

        let failure = auth.authenticate("ws-abc123").await.err().unwrap();

        assert_eq!(failure.code(), FailureCode::NoRunningInstance);
        assert!(!failure.record.retryable);
        assert!(failure.message.contains("workspace is not running"));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        // expected outcome, not filed as an error
        assert!(broker.errors.lock().unwrap().is_empty());
        let flows = broker.flows.lock().unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].status, FlowStatus::Failed);
        assert_eq!(flows[0].failure_code, Some(FailureCode::NoRunningInstance));
    }

    #[tokio::test]
    async fn test_direct_auth_failure_falls_back_to_tunnel() {
        let broker = Arc::new(FakeBroker {
            info: Some(info(WorkspacePhase::Running)),
            ..Default::default()
        });
        let attempts = Arc::new(AtomicUsize::new(0));
        let auth = authenticator(
            broker.clone(),
            direct_then_tunnel(Err(FailureCode::SshAuthFailed), Ok("tunnel"), &attempts),
        );

        let authenticated = auth.authenticate("ws-abc123").await.unwrap();

        assert_eq!(authenticated.session, "tunnel");
        assert_eq!(authenticated.kind, StrategyKind::Tunnel);
        assert_eq!(authenticated.context.instance_id.as_deref(), Some("inst-1"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let errors = broker.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, FailureCode::SshAuthFailed);
        assert_eq!(errors[0].workspace_id.as_deref(), Some("ws-abc123"));
        assert_eq!(errors[0].gitpod_host.as_deref(), Some("https://gitpod.io"));

        let flows = broker.flows.lock().unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].flow, LOCAL_SSH_FLOW);
        assert_eq!(flows[0].status, FlowStatus::Connected);
        assert_eq!(flows[0].failure_code, None);
    }

    #[tokio::test]
    async fn test_all_strategies_failing_reports_each() {
        let broker = Arc::new(FakeBroker {
            info: Some(info(WorkspacePhase::Running)),
            ..Default::default()
        });
        let attempts = Arc::new(AtomicUsize::new(0));
        let auth = authenticator(
            broker.clone(),
            direct_then_tunnel(
                Err(FailureCode::SshTransportFailed),
                Err(FailureCode::TunnelWebsocketFailed),
                &attempts,
            ),
        );

        let failure = auth.authenticate("ws-abc123").await.err().unwrap();

        assert_eq!(failure.code(), FailureCode::TunnelWebsocketFailed);
        let codes: Vec<_> = broker.errors.lock().unwrap().iter().map(|r| r.code).collect();
        assert_eq!(
            codes,
            vec![FailureCode::SshTransportFailed, FailureCode::TunnelWebsocketFailed]
        );
    }

    #[tokio::test]
    async fn test_host_mismatch_is_refused() {
        let broker = Arc::new(FakeBroker {
            info: Some(info(WorkspacePhase::Running)),
            ..Default::default()
        });
        let attempts = Arc::new(AtomicUsize::new(0));
        let auth = authenticator(
            broker.clone(),
            direct_then_tunnel(Ok("direct"), Ok("tunnel"), &attempts),
        );

        let failure = auth
            .authenticate("ws-abc123#gitpod.example.com")
            .await
            .err()
            .unwrap();

        assert_eq!(failure.code(), FailureCode::HostMismatch);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_username_never_reaches_broker() {
        let broker = Arc::new(FakeBroker::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let auth = authenticator(
            broker.clone(),
            direct_then_tunnel(Ok("direct"), Ok("tunnel"), &attempts),
        );

        let failure = auth.authenticate("not a workspace").await.err().unwrap();

        assert_eq!(failure.code(), FailureCode::InvalidUsername);
        assert!(broker.flows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_broker_is_not_filed() {
        let broker = Arc::new(FakeBroker::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let auth = authenticator(
            broker.clone(),
            direct_then_tunnel(Ok("direct"), Ok("tunnel"), &attempts),
        );

        let failure = auth.authenticate("ws-abc123").await.err().unwrap();

        assert_eq!(failure.code(), FailureCode::AuthInfoUnavailable);
        assert!(broker.errors.lock().unwrap().is_empty());
        assert_eq!(broker.flows.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_rejects_hung_login() {
        let broker = Arc::new(FakeBroker {
            hang: true,
            ..Default::default()
        });
        let attempts = Arc::new(AtomicUsize::new(0));
        let auth = authenticator(
            broker.clone(),
            direct_then_tunnel(Ok("direct"), Ok("tunnel"), &attempts),
        );

        let failure = auth.authenticate("ws-abc123").await.err().unwrap();
        assert_eq!(failure.code(), FailureCode::AuthTimedOut);

        // reports are sent in the background
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.errors.lock().unwrap()[0].code, FailureCode::AuthTimedOut);
        assert_eq!(broker.flows.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reports_do_not_delay_watchdog_rejection() {
        let broker = Arc::new(FakeBroker {
            hang: true,
            slow_reports: true,
            ..Default::default()
        });
        let attempts = Arc::new(AtomicUsize::new(0));
        let auth = authenticator(
            broker.clone(),
            direct_then_tunnel(Ok("direct"), Ok("tunnel"), &attempts),
        );

        let started = tokio::time::Instant::now();
        let failure = auth.authenticate("ws-abc123").await.err().unwrap();

        assert_eq!(failure.code(), FailureCode::AuthTimedOut);
        assert!(started.elapsed() < Duration::from_secs(61));
        assert!(broker.errors.lock().unwrap().is_empty());
    }
}
