//! Channel pairs and the per-session pair table

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::pump::ChannelEvent;

/// Events buffered per channel and direction before the producer waits
pub const CHANNEL_QUEUE_DEPTH: usize = 64;

/// One inbound channel and its upstream mirror
///
/// Events from the inbound side go through a bounded queue to the pair's
/// pump task; a full queue makes the sender wait. The `closed` flag makes
/// close forwarding happen at most once whichever side closes first.
pub struct ChannelPair {
    closed: AtomicBool,
    to_upstream: mpsc::Sender<ChannelEvent>,
    /// Cancelled when the inbound side closes the channel
    close_requested: CancellationToken,
}

impl ChannelPair {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<ChannelEvent>) {
        let (to_upstream, rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        let pair = Arc::new(Self {
            closed: AtomicBool::new(false),
            to_upstream,
            close_requested: CancellationToken::new(),
        });
        (pair, rx)
    }

    /// Queue an inbound event for the upstream mirror, waiting while the
    /// queue is full. Returns false once the pair is closed.
    pub async fn forward(&self, event: ChannelEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        self.to_upstream.send(event).await.is_ok()
    }

    /// The inbound side closed its channel. Asks the pump to close the
    /// mirror unless the pair was already closed; safe to call any number
    /// of times.
    pub fn close_from_inbound(&self) -> bool {
        if !self.mark_closed() {
            return false;
        }
        self.close_requested.cancel();
        true
    }

    /// Resolves once the inbound side has closed the channel
    pub fn close_requested(&self) -> WaitForCancellationFuture<'_> {
        self.close_requested.cancelled()
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.is_cancelled()
    }

    /// Flip the closed flag. Only the first caller gets `true`.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Channel pairs of one bridged session, keyed by inbound channel id
pub struct ChannelTable<K: Eq + Hash> {
    pairs: DashMap<K, Arc<ChannelPair>>,
}

impl<K: Eq + Hash> ChannelTable<K> {
    pub fn new() -> Self {
        Self {
            pairs: DashMap::new(),
        }
    }

    pub fn insert(&self, id: K, pair: Arc<ChannelPair>) {
        self.pairs.insert(id, pair);
    }

    pub fn get(&self, id: &K) -> Option<Arc<ChannelPair>> {
        self.pairs.get(id).map(|p| Arc::clone(p.value()))
    }

    pub fn remove(&self, id: &K) -> Option<Arc<ChannelPair>> {
        self.pairs.remove(id).map(|(_, pair)| pair)
    }

    /// Close every pair from the inbound side and empty the table
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        self.pairs.retain(|_, pair| {
            if pair.close_from_inbound() {
                closed += 1;
            }
            false
        });
        closed
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl<K: Eq + Hash> Default for ChannelTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn test_close_is_requested_once() {
        let (pair, mut rx) = ChannelPair::new();

        assert!(pair.close_from_inbound());
        assert!(!pair.close_from_inbound());
        assert!(!pair.close_from_inbound());

        assert!(pair.is_close_requested());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_after_upstream_close_is_not_requested() {
        let (pair, _rx) = ChannelPair::new();

        // the pump saw the upstream close first
        assert!(pair.mark_closed());
        assert!(!pair.close_from_inbound());
        assert!(!pair.is_close_requested());
    }

    #[tokio::test]
    async fn test_forward_stops_after_close() {
        let (pair, mut rx) = ChannelPair::new();
        assert!(pair.forward(ChannelEvent::Data(Bytes::from_static(b"ls\n"))).await);
        pair.close_from_inbound();
        assert!(!pair.forward(ChannelEvent::Data(Bytes::from_static(b"late"))).await);

        assert!(matches!(rx.try_recv(), Ok(ChannelEvent::Data(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_makes_sender_wait() {
        let (pair, mut rx) = ChannelPair::new();
        for _ in 0..CHANNEL_QUEUE_DEPTH {
            assert!(pair.forward(ChannelEvent::Data(Bytes::from_static(b"x"))).await);
        }

        let blocked = tokio::time::timeout(
            Duration::from_secs(1),
            pair.forward(ChannelEvent::Data(Bytes::from_static(b"y"))),
        )
        .await;
        assert!(blocked.is_err());

        // draining one slot lets the next event in
        assert!(rx.recv().await.is_some());
        assert!(pair.forward(ChannelEvent::Data(Bytes::from_static(b"y"))).await);
    }

    #[test]
    fn test_table_close_all() {
        let table = ChannelTable::new();
        let (a, _rx_a) = ChannelPair::new();
        let (b, _rx_b) = ChannelPair::new();
        b.mark_closed();
        table.insert(1u32, Arc::clone(&a));
        table.insert(2u32, b);

        assert_eq!(table.close_all(), 1);
        assert!(table.is_empty());
        assert!(a.is_close_requested());
    }
}
