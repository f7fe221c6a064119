//! In-process duplex channel.
//!
//! Two [`MemoryChannel`] endpoints share one open flag. Each endpoint pushes
//! frames straight into the peer's bounded event queue, so a full queue
//! applies backpressure to the sender the same way a socket buffer would.

use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelResult, ChannelStats, StatsCounters};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One endpoint of an in-memory channel pair.
pub struct MemoryChannel {
    open: Arc<AtomicBool>,
    local: mpsc::Sender<ChannelEvent>,
    peer: mpsc::Sender<ChannelEvent>,
    stats: StatsCounters,
}

/// An endpoint together with the receiver of its inbound events.
pub type MemoryEndpoint = (Arc<MemoryChannel>, mpsc::Receiver<ChannelEvent>);

impl MemoryChannel {
    /// Create a connected pair of endpoints.
    ///
    /// Each event queue holds up to `capacity` events. Both queues start
    /// with a [`ChannelEvent::Open`].
    #[must_use]
    pub fn pair(capacity: usize) -> (MemoryEndpoint, MemoryEndpoint) {
        let capacity = capacity.max(2);
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let open = Arc::new(AtomicBool::new(true));

        let _ = a_tx.try_send(ChannelEvent::Open);
        let _ = b_tx.try_send(ChannelEvent::Open);

        let a = Arc::new(Self {
            open: Arc::clone(&open),
            local: a_tx.clone(),
            peer: b_tx.clone(),
            stats: StatsCounters::default(),
        });
        let b = Arc::new(Self {
            open,
            local: b_tx,
            peer: a_tx,
            stats: StatsCounters::default(),
        });

        ((a, a_rx), (b, b_rx))
    }

    /// Fail the channel, delivering `reason` to both endpoints.
    ///
    /// Simulates a transport error such as a connection reset.
    pub async fn fail(&self, reason: &str) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!("Memory channel failed: {}", reason);
            let _ = self.local.send(ChannelEvent::Error(reason.to_string())).await;
            let _ = self.peer.send(ChannelEvent::Error(reason.to_string())).await;
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Vec<u8>) -> ChannelResult<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let len = frame.len();
        if self.peer.send(ChannelEvent::Data(frame)).await.is_err() {
            self.open.store(false, Ordering::Release);
            return Err(ChannelError::Closed);
        }

        self.stats.record_send(len);
        Ok(())
    }

    async fn close(&self) -> ChannelResult<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!("Memory channel closed");
            let _ = self.local.send(ChannelEvent::Close).await;
            let _ = self.peer.send(ChannelEvent::Close).await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn stats(&self) -> ChannelStats {
        self.stats.snapshot()
    }
}
