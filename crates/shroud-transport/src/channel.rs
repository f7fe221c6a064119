//! Channel trait abstraction.
//!
//! The transfer engine only needs to hand a frame to the peer and to learn
//! about inbound frames and lifecycle changes. Everything else (framing,
//! sockets, buffering) stays behind this trait.

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Channel is closed
    #[error("Channel is closed")]
    Closed,

    /// Frame exceeds the protocol maximum
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced or attempted frame size
        size: usize,
        /// Maximum accepted size
        max: usize,
    },

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Lifecycle and data notifications from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is ready to carry frames.
    Open,
    /// A complete frame arrived from the peer.
    Data(Vec<u8>),
    /// The channel closed, locally or by the peer.
    Close,
    /// The channel failed; no further frames will arrive.
    Error(String),
}

impl ChannelEvent {
    /// Whether this event ends the channel's event stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Close | Self::Error(_))
    }
}

/// Reliable, ordered, frame-oriented duplex channel to one peer.
///
/// # Examples
///
/// ```
/// use shroud_transport::{Channel, ChannelEvent, MemoryChannel};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let ((alice, _alice_events), (_bob, mut bob_events)) = MemoryChannel::pair(16);
///
/// assert_eq!(bob_events.recv().await, Some(ChannelEvent::Open));
/// alice.send(b"hello".to_vec()).await?;
/// assert_eq!(bob_events.recv().await, Some(ChannelEvent::Data(b"hello".to_vec())));
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Channel: Send + Sync {
    /// Hand a frame to the channel for delivery to the peer.
    ///
    /// Returning `Ok` means the frame was accepted by the channel, not that
    /// the peer has processed it.
    ///
    /// # Errors
    /// Returns `ChannelError::Closed` once the channel is closed, or the
    /// underlying failure otherwise.
    async fn send(&self, frame: Vec<u8>) -> ChannelResult<()>;

    /// Close the channel.
    ///
    /// Both endpoints observe [`ChannelEvent::Close`]. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    /// Returns `ChannelError` if the underlying stream fails to shut down.
    async fn close(&self) -> ChannelResult<()>;

    /// Check whether the channel still accepts frames.
    fn is_open(&self) -> bool;

    /// Get channel statistics.
    fn stats(&self) -> ChannelStats {
        ChannelStats::default()
    }
}

/// Channel statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Total frame bytes sent
    pub bytes_sent: u64,
    /// Total frame bytes received
    pub bytes_received: u64,
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
}

/// Lock-free counters backing [`ChannelStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }
}
