//! russh client handler for upstream sessions

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use russh::client::{self, DisconnectReason, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::bridge::CloseReason;

/// Events raised by an upstream session outside of channel traffic
pub enum UpstreamEvent {
    /// The workspace opened a `forwarded-tcpip` channel
    ForwardedTcpip {
        channel: Channel<Msg>,
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
}

/// End of an upstream connection, and why it ended
#[derive(Clone, Default)]
pub struct UpstreamClosed {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl UpstreamClosed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record why the connection ended. The first reason sticks.
    pub fn record(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
    }

    /// Record `reason` and signal the end of the connection
    pub fn close(&self, reason: CloseReason) {
        self.record(reason);
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the connection to end
    pub async fn wait(&self) -> CloseReason {
        self.token.cancelled().await;
        self.reason()
    }

    /// The recorded reason, or a generic one when the connection went away
    /// without saying why
    pub fn reason(&self) -> CloseReason {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| CloseReason::error("workspace connection closed"))
    }

    fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }
}

/// Close reason for a disconnect message sent by the workspace
pub fn remote_close_reason(code: Disconnect, message: &str) -> CloseReason {
    let description = if message.is_empty() {
        format!("workspace disconnected ({:?})", code)
    } else {
        message.to_string()
    };
    match code {
        Disconnect::ByApplication => CloseReason::normal(description),
        _ => CloseReason::error(description),
    }
}

/// Client handler of one upstream session
///
/// The handler lives as long as the session's connection task, so the
/// guard signals [`UpstreamClosed`] when the connection ends.
pub struct UpstreamHandler {
    /// Host the session was opened to, for logging
    label: String,
    events: mpsc::UnboundedSender<UpstreamEvent>,
    closed: UpstreamClosed,
    _guard: DropGuard,
}

impl UpstreamHandler {
    pub fn new(
        label: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<UpstreamEvent>, UpstreamClosed) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let closed = UpstreamClosed::new();
        let handler = Self {
            label: label.into(),
            events,
            _guard: closed.drop_guard(),
            closed: closed.clone(),
        };
        (handler, events_rx, closed)
    }
}

#[async_trait]
impl client::Handler for UpstreamHandler {
    type Error = anyhow::Error;

    /// Workspace host keys are ephemeral and the endpoint is reached with a
    /// short-lived credential, so any key is accepted.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Upstream host key for {}: {}",
            self.label,
            server_public_key.fingerprint()
        );
        Ok(true)
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        match reason {
            DisconnectReason::ReceivedDisconnect(info) => {
                tracing::info!(
                    "{} disconnected: {:?} {}",
                    self.label,
                    info.reason_code,
                    info.message
                );
                self.closed
                    .record(remote_close_reason(info.reason_code, &info.message));
                Ok(())
            }
            DisconnectReason::Error(e) => {
                tracing::warn!("Connection to {} lost: {}", self.label, e);
                self.closed.record(CloseReason::error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "Forwarded channel from {} for {}:{}",
            self.label,
            connected_address,
            connected_port
        );
        let event = UpstreamEvent::ForwardedTcpip {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        if self.events.send(event).is_err() {
            tracing::debug!("Forwarded channel dropped, session is not bridged");
        }
        Ok(())
    }
}
