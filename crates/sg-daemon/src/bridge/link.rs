//! Joined lifecycle of an inbound session and its upstream session

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use russh::{client, server, Disconnect};

use crate::upstream::UpstreamHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Normal,
    Error,
}

/// Why a bridged session ended, carried to the other side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub kind: CloseKind,
    pub description: String,
}

impl CloseReason {
    pub fn normal(description: impl Into<String>) -> Self {
        Self {
            kind: CloseKind::Normal,
            description: description.into(),
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            kind: CloseKind::Error,
            description: description.into(),
        }
    }

    fn disconnect(&self) -> Disconnect {
        match self.kind {
            CloseKind::Normal => Disconnect::ByApplication,
            CloseKind::Error => Disconnect::ConnectionLost,
        }
    }
}

/// One end of a bridged session that can be told to close
#[async_trait]
pub trait SessionEnd: Send + Sync {
    async fn end(&self, reason: &CloseReason);
}

/// Closing either side closes the other with the same reason. The first
/// reported closure wins; later ones are ignored.
pub struct SessionLink {
    reason: OnceLock<CloseReason>,
    inbound: Arc<dyn SessionEnd>,
    upstream: Arc<dyn SessionEnd>,
}

impl SessionLink {
    pub fn new(inbound: Arc<dyn SessionEnd>, upstream: Arc<dyn SessionEnd>) -> Self {
        Self {
            reason: OnceLock::new(),
            inbound,
            upstream,
        }
    }

    /// The local client went away: close the upstream session
    pub async fn inbound_closed(&self, reason: CloseReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            return false;
        }
        tracing::debug!("Inbound closed ({}), closing upstream", reason.description);
        self.upstream.end(&reason).await;
        true
    }

    /// The workspace went away: close the inbound session
    pub async fn upstream_closed(&self, reason: CloseReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            return false;
        }
        tracing::debug!("Upstream closed ({}), closing inbound", reason.description);
        self.inbound.end(&reason).await;
        true
    }

    pub fn reason(&self) -> Option<&CloseReason> {
        self.reason.get()
    }
}

/// Inbound end, reached through the handle of the russh server session
pub struct InboundEnd {
    handle: Arc<OnceLock<server::Handle>>,
}

impl InboundEnd {
    pub fn new(handle: Arc<OnceLock<server::Handle>>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl SessionEnd for InboundEnd {
    async fn end(&self, reason: &CloseReason) {
        if let Some(handle) = self.handle.get() {
            let _ = handle
                .disconnect(
                    reason.disconnect(),
                    reason.description.clone(),
                    "en".to_string(),
                )
                .await;
        }
    }
}

/// Upstream end, the russh client session to the workspace
pub struct UpstreamEnd {
    handle: client::Handle<UpstreamHandler>,
}

impl UpstreamEnd {
    pub fn new(handle: client::Handle<UpstreamHandler>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &client::Handle<UpstreamHandler> {
        &self.handle
    }
}

#[async_trait]
impl SessionEnd for UpstreamEnd {
    async fn end(&self, reason: &CloseReason) {
        let _ = self
            .handle
            .disconnect(reason.disconnect(), &reason.description, "en")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEnd {
        reasons: Mutex<Vec<CloseReason>>,
    }

    #[async_trait]
    impl SessionEnd for RecordingEnd {
        async fn end(&self, reason: &CloseReason) {
            self.reasons.lock().unwrap().push(reason.clone());
        }
    }

    fn link() -> (SessionLink, Arc<RecordingEnd>, Arc<RecordingEnd>) {
        let inbound = Arc::new(RecordingEnd::default());
        let upstream = Arc::new(RecordingEnd::default());
        let link = SessionLink::new(inbound.clone(), upstream.clone());
        (link, inbound, upstream)
    }

    #[tokio::test]
    async fn test_inbound_close_reaches_upstream_with_reason() {
        let (link, inbound, upstream) = link();

        assert!(link.inbound_closed(CloseReason::normal("client disconnected")).await);

        assert_eq!(
            *upstream.reasons.lock().unwrap(),
            vec![CloseReason::normal("client disconnected")]
        );
        assert!(inbound.reasons.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_close_reaches_inbound_with_reason() {
        let (link, inbound, upstream) = link();

        assert!(link.upstream_closed(CloseReason::error("workspace stopped")).await);

        assert_eq!(
            *inbound.reasons.lock().unwrap(),
            vec![CloseReason::error("workspace stopped")]
        );
        assert!(upstream.reasons.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_closure_wins() {
        let (link, inbound, upstream) = link();

        assert!(link.upstream_closed(CloseReason::error("workspace stopped")).await);
        // the inbound session ends as a consequence and reports back
        assert!(!link.inbound_closed(CloseReason::normal("client disconnected")).await);

        assert_eq!(inbound.reasons.lock().unwrap().len(), 1);
        assert!(upstream.reasons.lock().unwrap().is_empty());
        assert_eq!(link.reason(), Some(&CloseReason::error("workspace stopped")));
    }
}
