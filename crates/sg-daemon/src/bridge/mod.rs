//! Session Bridge
//!
//! Joins an authenticated inbound session and its upstream session so the
//! local client sees one continuous SSH connection. Every channel opened on
//! one side gets a mirror on the other, and the two sessions close together.

mod link;
mod pair;
mod pump;

pub use link::{CloseKind, CloseReason, InboundEnd, SessionEnd, SessionLink, UpstreamEnd};
pub use pair::{ChannelPair, ChannelTable, CHANNEL_QUEUE_DEPTH};
pub use pump::{pump, ChannelEvent, InboundChannel, RusshInbound, RusshUpstream, UpstreamChannel};

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use russh::{client, server, ChannelId, ChannelOpenFailure};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::upstream::{UpstreamClosed, UpstreamEvent, UpstreamSession};
use sg_core::config::StrategyKind;

/// Errors while mirroring channels
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The workspace refused the mirror channel
    #[error("Mirror channel refused: {0:?}")]
    OpenRefused(ChannelOpenFailure),

    #[error("Mirror channel open timed out")]
    OpenTimeout,

    #[error("Upstream channel error: {0}")]
    Upstream(String),

    /// The local client's session is gone
    #[error("Inbound session closed")]
    InboundClosed,
}

impl BridgeError {
    fn from_open(e: russh::Error) -> Self {
        match e {
            russh::Error::ChannelOpenFailure(reason) => BridgeError::OpenRefused(reason),
            other => BridgeError::Upstream(other.to_string()),
        }
    }
}

/// A bridged pair of sessions
pub struct Bridge {
    upstream: Arc<UpstreamEnd>,
    kind: StrategyKind,
    inbound: Arc<OnceLock<server::Handle>>,
    pairs: ChannelTable<ChannelId>,
    link: SessionLink,
    open_timeout: Duration,
    /// Cancelled when the bridge shuts down
    done: CancellationToken,
}

impl Bridge {
    /// Join `session` with the inbound session whose handle is (or will
    /// be) stored in `inbound`
    pub fn attach(
        session: UpstreamSession,
        inbound: Arc<OnceLock<server::Handle>>,
        open_timeout: Duration,
    ) -> Arc<Self> {
        let UpstreamSession {
            kind,
            handle,
            events,
            closed,
        } = session;

        let upstream = Arc::new(UpstreamEnd::new(handle));
        let link = SessionLink::new(
            Arc::new(InboundEnd::new(Arc::clone(&inbound))),
            Arc::clone(&upstream) as Arc<dyn SessionEnd>,
        );

        let bridge = Arc::new(Self {
            upstream,
            kind,
            inbound,
            pairs: ChannelTable::new(),
            link,
            open_timeout,
            done: CancellationToken::new(),
        });

        tokio::spawn(watch_upstream(Arc::clone(&bridge), closed));
        tokio::spawn(mirror_upstream_channels(Arc::clone(&bridge), events));

        bridge
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    /// Mirror an inbound `session` channel
    pub async fn open_session(
        &self,
        inbound: server::Handle,
        id: ChannelId,
    ) -> Result<(), BridgeError> {
        let channel = tokio::time::timeout(
            self.open_timeout,
            self.upstream.handle().channel_open_session(),
        )
        .await
        .map_err(|_| BridgeError::OpenTimeout)?
        .map_err(BridgeError::from_open)?;

        self.spawn_pair(channel, inbound, id);
        Ok(())
    }

    /// Mirror an inbound `direct-tcpip` channel
    pub async fn open_direct_tcpip(
        &self,
        inbound: server::Handle,
        id: ChannelId,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<(), BridgeError> {
        let channel = tokio::time::timeout(
            self.open_timeout,
            self.upstream.handle().channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            ),
        )
        .await
        .map_err(|_| BridgeError::OpenTimeout)?
        .map_err(BridgeError::from_open)?;

        self.spawn_pair(channel, inbound, id);
        Ok(())
    }

    fn spawn_pair(
        &self,
        channel: russh::Channel<client::Msg>,
        inbound: server::Handle,
        id: ChannelId,
    ) {
        let (pair, from_inbound) = ChannelPair::new();
        self.pairs.insert(id, Arc::clone(&pair));
        tracing::debug!(channel = ?id, "Channel pair opened");

        tokio::spawn(pump(
            pair,
            RusshUpstream::new(channel),
            RusshInbound::new(inbound, id),
            from_inbound,
        ));
    }

    /// Queue an inbound event for the channel's mirror, waiting while that
    /// channel's queue is full. Returns false when the channel has no open
    /// pair.
    pub async fn forward(&self, id: ChannelId, event: ChannelEvent) -> bool {
        match self.pairs.get(&id) {
            Some(pair) => pair.forward(event).await,
            None => false,
        }
    }

    /// The client closed a channel
    pub fn close_channel(&self, id: ChannelId) {
        if let Some(pair) = self.pairs.remove(&id) {
            pair.close_from_inbound();
            tracing::debug!(channel = ?id, "Channel pair closed");
        }
    }

    /// The inbound session ended: close the upstream session with the
    /// same reason
    pub async fn inbound_closed(&self, reason: CloseReason) {
        self.shutdown();
        self.link.inbound_closed(reason).await;
    }

    fn shutdown(&self) {
        self.done.cancel();
        let closed = self.pairs.close_all();
        if closed > 0 {
            tracing::debug!("Closed {} channel pairs", closed);
        }
    }

    pub fn open_channels(&self) -> usize {
        self.pairs.len()
    }
}

/// Propagate the end of the upstream connection, with its reason, to the
/// inbound session
async fn watch_upstream(bridge: Arc<Bridge>, closed: UpstreamClosed) {
    tokio::select! {
        _ = bridge.done.cancelled() => {}
        reason = closed.wait() => {
            tracing::info!("Upstream session closed: {}", reason.description);
            bridge.shutdown();
            bridge.link.upstream_closed(reason).await;
        }
    }
}

/// Mirror channels the workspace opens towards the client
async fn mirror_upstream_channels(
    bridge: Arc<Bridge>,
    mut events: mpsc::UnboundedReceiver<UpstreamEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = bridge.done.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let UpstreamEvent::ForwardedTcpip {
            channel,
            connected_address,
            connected_port,
            originator_address,
            originator_port,
        } = event;

        let Some(inbound) = bridge.inbound.get().cloned() else {
            let _ = channel.close().await;
            continue;
        };

        match inbound
            .channel_open_forwarded_tcpip(
                connected_address.clone(),
                connected_port,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(mirror) => {
                let id = mirror.id();
                bridge.spawn_pair(channel, inbound, id);
            }
            Err(e) => {
                tracing::warn!(
                    "Client refused forwarded channel for {}:{}: {}",
                    connected_address,
                    connected_port,
                    e
                );
                let _ = channel.close().await;
            }
        }
    }
}
