//! Per-channel forwarding between an inbound channel and its mirror

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::{client, server, Channel, ChannelId, ChannelMsg, CryptoVec, Pty, Sig};
use tokio::sync::mpsc;

use super::pair::{ChannelPair, CHANNEL_QUEUE_DEPTH};
use super::BridgeError;

/// Traffic and requests carried on one channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Data(Bytes),
    ExtendedData {
        code: u32,
        data: Bytes,
    },
    Eof,
    Close,
    PtyRequest {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Env {
        name: String,
        value: String,
    },
    Shell,
    Exec(Bytes),
    Subsystem(String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    ExitStatus(u32),
    ExitSignal {
        signal: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
}

/// The upstream mirror of a channel
#[async_trait]
pub trait UpstreamChannel: Send {
    /// Next event from the workspace; `None` once the channel is gone
    async fn next(&mut self) -> Option<ChannelEvent>;

    /// Send an inbound event to the workspace
    async fn deliver(&mut self, event: ChannelEvent) -> Result<(), BridgeError>;
}

/// The local client's side of a channel
#[async_trait]
pub trait InboundChannel: Send + Sync + 'static {
    async fn deliver(&self, event: ChannelEvent) -> Result<(), BridgeError>;
}

/// Forward events both ways until either side closes
///
/// Events towards the client go through a bounded queue and their own
/// writer task. The workspace is only read while that queue has room, so a
/// slow client holds back its channel's upstream instead of growing a
/// buffer, and inbound events keep flowing in the meantime.
pub async fn pump<U, I>(
    pair: Arc<ChannelPair>,
    mut upstream: U,
    inbound: I,
    mut from_inbound: mpsc::Receiver<ChannelEvent>,
) where
    U: UpstreamChannel,
    I: InboundChannel,
{
    let (to_client, mut client_queue) = mpsc::channel::<ChannelEvent>(CHANNEL_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(event) = client_queue.recv().await {
            let is_close = matches!(event, ChannelEvent::Close);
            if let Err(e) = inbound.deliver(event).await {
                tracing::debug!("Inbound channel gone: {}", e);
                break;
            }
            if is_close {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            event = from_inbound.recv() => match event {
                Some(event) => {
                    if let Err(e) = upstream.deliver(event).await {
                        tracing::debug!("Upstream channel rejected event: {}", e);
                    }
                }
                None => {
                    close_upstream(&mut upstream).await;
                    break;
                }
            },
            _ = pair.close_requested() => {
                // events queued ahead of the close still go out first
                while let Ok(event) = from_inbound.try_recv() {
                    if let Err(e) = upstream.deliver(event).await {
                        tracing::debug!("Upstream channel rejected event: {}", e);
                    }
                }
                close_upstream(&mut upstream).await;
                break;
            },
            next = async {
                let permit = to_client.reserve().await.ok()?;
                Some((permit, upstream.next().await))
            } => match next {
                // the writer is gone with the client channel
                None => break,
                Some((permit, Some(ChannelEvent::Close) | None)) => {
                    if pair.mark_closed() {
                        permit.send(ChannelEvent::Close);
                    }
                    break;
                }
                Some((permit, Some(event))) => permit.send(event),
            },
        }
    }

    drop(to_client);
    let _ = writer.await;
}

async fn close_upstream<U: UpstreamChannel>(upstream: &mut U) {
    if let Err(e) = upstream.deliver(ChannelEvent::Close).await {
        tracing::debug!("Closing upstream channel failed: {}", e);
    }
}

/// Upstream mirror backed by a russh client channel
pub struct RusshUpstream {
    channel: Channel<client::Msg>,
}

impl RusshUpstream {
    pub fn new(channel: Channel<client::Msg>) -> Self {
        Self { channel }
    }
}

fn upstream_err(e: russh::Error) -> BridgeError {
    BridgeError::Upstream(e.to_string())
}

#[async_trait]
impl UpstreamChannel for RusshUpstream {
    async fn next(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Data(Bytes::copy_from_slice(&data)),
                ChannelMsg::ExtendedData { data, ext } => ChannelEvent::ExtendedData {
                    code: ext,
                    data: Bytes::copy_from_slice(&data),
                },
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Close,
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                } => ChannelEvent::ExitSignal {
                    signal: signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                },
                // window adjustments and request replies stay on this hop
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn deliver(&mut self, event: ChannelEvent) -> Result<(), BridgeError> {
        let channel = &mut self.channel;
        match event {
            ChannelEvent::Data(data) => channel.data(&data[..]).await.map_err(upstream_err),
            ChannelEvent::ExtendedData { code, data } => channel
                .extended_data(code, &data[..])
                .await
                .map_err(upstream_err),
            ChannelEvent::Eof => channel.eof().await.map_err(upstream_err),
            ChannelEvent::Close => channel.close().await.map_err(upstream_err),
            ChannelEvent::PtyRequest {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => channel
                .request_pty(
                    false, &term, col_width, row_height, pix_width, pix_height, &modes,
                )
                .await
                .map_err(upstream_err),
            ChannelEvent::Env { name, value } => channel
                .set_env(false, name.as_str(), value.as_str())
                .await
                .map_err(upstream_err),
            ChannelEvent::Shell => channel.request_shell(false).await.map_err(upstream_err),
            ChannelEvent::Exec(command) => channel
                .exec(false, command.to_vec())
                .await
                .map_err(upstream_err),
            ChannelEvent::Subsystem(name) => channel
                .request_subsystem(false, name.as_str())
                .await
                .map_err(upstream_err),
            ChannelEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => channel
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
                .map_err(upstream_err),
            ChannelEvent::Signal(sig) => channel.signal(sig).await.map_err(upstream_err),
            // exit reports only travel towards the client
            ChannelEvent::ExitStatus(_) | ChannelEvent::ExitSignal { .. } => Ok(()),
        }
    }
}

/// Client-side channel reached through the inbound session handle
pub struct RusshInbound {
    handle: server::Handle,
    id: ChannelId,
}

impl RusshInbound {
    pub fn new(handle: server::Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait]
impl InboundChannel for RusshInbound {
    async fn deliver(&self, event: ChannelEvent) -> Result<(), BridgeError> {
        let id = self.id;
        let result = match event {
            ChannelEvent::Data(data) => self
                .handle
                .data(id, CryptoVec::from_slice(&data))
                .await
                .map_err(|_| ()),
            ChannelEvent::ExtendedData { code, data } => self
                .handle
                .extended_data(id, code, CryptoVec::from_slice(&data))
                .await
                .map_err(|_| ()),
            ChannelEvent::Eof => self.handle.eof(id).await,
            ChannelEvent::Close => self.handle.close(id).await,
            ChannelEvent::ExitStatus(status) => self.handle.exit_status_request(id, status).await,
            ChannelEvent::ExitSignal {
                signal,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                self.handle
                    .exit_signal_request(id, signal, core_dumped, error_message, lang_tag)
                    .await
            }
            // requests only travel towards the workspace
            _ => Ok(()),
        };
        result.map_err(|_| BridgeError::InboundClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Workspace stand-in: a shell that echoes data and records requests
    struct EchoUpstream {
        incoming: mpsc::UnboundedReceiver<ChannelEvent>,
        echo: mpsc::UnboundedSender<ChannelEvent>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    fn echo_upstream() -> (EchoUpstream, Arc<Mutex<Vec<String>>>, mpsc::UnboundedSender<ChannelEvent>) {
        let (echo, incoming) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let upstream = EchoUpstream {
            incoming,
            echo: echo.clone(),
            seen: Arc::clone(&seen),
        };
        (upstream, seen, echo)
    }

    #[async_trait]
    impl UpstreamChannel for EchoUpstream {
        async fn next(&mut self) -> Option<ChannelEvent> {
            self.incoming.recv().await
        }

        async fn deliver(&mut self, event: ChannelEvent) -> Result<(), BridgeError> {
            let label = match &event {
                ChannelEvent::Data(_) => "data",
                ChannelEvent::PtyRequest { .. } => "pty",
                ChannelEvent::Shell => "shell",
                ChannelEvent::Close => "close",
                ChannelEvent::Eof => "eof",
                _ => "other",
            };
            self.seen.lock().unwrap().push(label.to_string());
            if let ChannelEvent::Data(data) = event {
                let _ = self.echo.send(ChannelEvent::Data(data));
            }
            Ok(())
        }
    }

    /// Client stand-in collecting everything delivered to it
    #[derive(Clone)]
    struct RecordingInbound {
        events: mpsc::UnboundedSender<ChannelEvent>,
    }

    #[async_trait]
    impl InboundChannel for RecordingInbound {
        async fn deliver(&self, event: ChannelEvent) -> Result<(), BridgeError> {
            self.events
                .send(event)
                .map_err(|_| BridgeError::InboundClosed)
        }
    }

    /// Client stand-in that never finishes a delivery
    struct StalledInbound;

    #[async_trait]
    impl InboundChannel for StalledInbound {
        async fn deliver(&self, _event: ChannelEvent) -> Result<(), BridgeError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn recording() -> (RecordingInbound, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (RecordingInbound { events }, rx)
    }

    async fn next_data(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Bytes {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ChannelEvent::Data(data))) => return data,
                Ok(Some(_)) => continue,
                other => panic!("no data received: {:?}", other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn test_shell_round_trip() {
        let (upstream, seen, _echo) = echo_upstream();
        let (inbound, mut client_rx) = recording();
        let (pair, from_inbound) = ChannelPair::new();
        let task = tokio::spawn(pump(Arc::clone(&pair), upstream, inbound, from_inbound));

        pair.forward(ChannelEvent::PtyRequest {
            term: "xterm".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            modes: vec![],
        })
        .await;
        pair.forward(ChannelEvent::Shell).await;
        pair.forward(ChannelEvent::Data(Bytes::from_static(b"echo hi\n")))
            .await;

        assert_eq!(&next_data(&mut client_rx).await[..], b"echo hi\n");

        pair.close_from_inbound();
        task.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["pty", "shell", "data", "close"]
        );
    }

    #[tokio::test]
    async fn test_upstream_close_reaches_client_once() {
        let (upstream, seen, echo) = echo_upstream();
        let (inbound, mut client_rx) = recording();
        let (pair, from_inbound) = ChannelPair::new();
        let task = tokio::spawn(pump(Arc::clone(&pair), upstream, inbound, from_inbound));

        echo.send(ChannelEvent::ExitStatus(0)).unwrap();
        echo.send(ChannelEvent::Close).unwrap();
        task.await.unwrap();

        // the client answers the close; nothing goes back upstream
        assert!(!pair.close_from_inbound());

        assert!(matches!(client_rx.recv().await, Some(ChannelEvent::ExitStatus(0))));
        assert!(matches!(client_rx.recv().await, Some(ChannelEvent::Close)));
        assert!(client_rx.recv().await.is_none());
        assert!(!seen.lock().unwrap().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn test_stalled_channel_does_not_block_others() {
        let (stalled_upstream, _, stalled_echo) = echo_upstream();
        let (stalled_pair, stalled_rx) = ChannelPair::new();
        tokio::spawn(pump(
            Arc::clone(&stalled_pair),
            stalled_upstream,
            StalledInbound,
            stalled_rx,
        ));

        let (upstream, _, _echo) = echo_upstream();
        let (inbound, mut client_rx) = recording();
        let (pair, from_inbound) = ChannelPair::new();
        tokio::spawn(pump(Arc::clone(&pair), upstream, inbound, from_inbound));

        // the stalled client never drains its channel
        for _ in 0..100 {
            stalled_echo
                .send(ChannelEvent::Data(Bytes::from_static(b"flood")))
                .unwrap();
        }
        assert!(
            stalled_pair
                .forward(ChannelEvent::Data(Bytes::from_static(b"more")))
                .await
        );

        pair.forward(ChannelEvent::Data(Bytes::from_static(b"ping")))
            .await;
        assert_eq!(&next_data(&mut client_rx).await[..], b"ping");
    }

    /// Workspace that always has another 32 KiB frame ready
    struct FloodingUpstream {
        pulled: Arc<AtomicUsize>,
        received: mpsc::UnboundedSender<ChannelEvent>,
    }

    #[async_trait]
    impl UpstreamChannel for FloodingUpstream {
        async fn next(&mut self) -> Option<ChannelEvent> {
            self.pulled.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Some(ChannelEvent::Data(Bytes::from(vec![0u8; 32 * 1024])))
        }

        async fn deliver(&mut self, event: ChannelEvent) -> Result<(), BridgeError> {
            let _ = self.received.send(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_client_holds_back_upstream_reads() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let (received, mut upstream_rx) = mpsc::unbounded_channel();
        let upstream = FloodingUpstream {
            pulled: Arc::clone(&pulled),
            received,
        };
        let (pair, from_inbound) = ChannelPair::new();
        tokio::spawn(pump(Arc::clone(&pair), upstream, StalledInbound, from_inbound));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let before = pulled.load(Ordering::SeqCst);
        // one frame stuck in the writer, a full queue, and the read that
        // found no room
        assert!(before <= CHANNEL_QUEUE_DEPTH + 2, "pulled {} frames", before);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), before);

        // the client's own input still reaches the workspace
        assert!(
            pair.forward(ChannelEvent::Data(Bytes::from_static(b"keystroke")))
                .await
        );
        let event = tokio::time::timeout(Duration::from_secs(5), upstream_rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(ChannelEvent::Data(data)) if &data[..] == b"keystroke"));
    }
}
