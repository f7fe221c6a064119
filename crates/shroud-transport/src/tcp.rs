//! Length-prefixed frames over TCP.
//!
//! Wire format: `u32` big-endian body length followed by the body. A reader
//! task per connection turns the byte stream back into
//! [`ChannelEvent::Data`] frames.

use crate::DEFAULT_EVENT_CAPACITY;
use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelResult, ChannelStats, StatsCounters};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc};

/// Largest frame body accepted in either direction (32 MiB).
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// TCP-backed channel.
pub struct TcpChannel {
    writer: Mutex<OwnedWriteHalf>,
    open: Arc<AtomicBool>,
    events: mpsc::Sender<ChannelEvent>,
    peer_addr: SocketAddr,
    stats: Arc<StatsCounters>,
}

impl TcpChannel {
    /// Connect to a listening peer.
    ///
    /// # Errors
    /// Returns `ChannelError::ConnectionFailed` if the TCP connection cannot
    /// be established.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
    ) -> ChannelResult<(Arc<Self>, mpsc::Receiver<ChannelEvent>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        Self::from_stream(stream)
    }

    /// Wrap an established stream, typically one returned by
    /// `TcpListener::accept`.
    ///
    /// Spawns the reader task; must be called within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `ChannelError::Io` if the peer address cannot be read.
    pub fn from_stream(
        stream: TcpStream,
    ) -> ChannelResult<(Arc<Self>, mpsc::Receiver<ChannelEvent>)> {
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let (tx, rx) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
        let _ = tx.try_send(ChannelEvent::Open);

        let open = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(StatsCounters::default());

        tokio::spawn(read_loop(
            reader,
            tx.clone(),
            Arc::clone(&open),
            Arc::clone(&stats),
        ));

        tracing::debug!("TCP channel established with {}", peer_addr);

        let channel = Arc::new(Self {
            writer: Mutex::new(writer),
            open,
            events: tx,
            peer_addr,
            stats,
        });
        Ok((channel, rx))
    }

    /// Remote address of this connection.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<ChannelEvent>,
    open: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
) {
    let terminal = loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break ChannelEvent::Close,
            Err(e) => break ChannelEvent::Error(e.to_string()),
        };

        if len > MAX_FRAME_SIZE {
            let err = ChannelError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            };
            tracing::warn!("Dropping connection: {}", err);
            break ChannelEvent::Error(err.to_string());
        }

        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            break ChannelEvent::Error(e.to_string());
        }

        stats.record_recv(len);
        if events.send(ChannelEvent::Data(body)).await.is_err() {
            return;
        }
    };

    // A local close already delivered its own Close event.
    if open.swap(false, Ordering::AcqRel) {
        let _ = events.send(terminal).await;
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, frame: Vec<u8>) -> ChannelResult<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_u32(frame.len() as u32).await?;
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::error!("TCP send to {} failed: {}", self.peer_addr, e);
            self.open.store(false, Ordering::Release);
            return Err(ChannelError::Io(e));
        }

        self.stats.record_send(frame.len());
        Ok(())
    }

    async fn close(&self) -> ChannelResult<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.events.send(ChannelEvent::Close).await;
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        tracing::debug!("TCP channel to {} closed", self.peer_addr);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn stats(&self) -> ChannelStats {
        self.stats.snapshot()
    }
}
