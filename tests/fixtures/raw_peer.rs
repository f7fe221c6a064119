//! A hand-driven peer that speaks raw [`Message`]s.
//!
//! Lets a test play one side of the protocol step by step against a real
//! [`Connection`] on the other end.

use super::two_peer::EVENT_WAIT;
use shroud_core::{Connection, Message, TransferConfig, TransferEvent};
use shroud_transport::{Channel, ChannelEvent, MemoryChannel};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Raw endpoint plus the engine it talks to
pub struct RawPeer {
    channel: Arc<MemoryChannel>,
    inbound: mpsc::Receiver<ChannelEvent>,
    pub engine: Arc<Connection>,
    pub engine_events: mpsc::UnboundedReceiver<TransferEvent>,
    reader: JoinHandle<()>,
}

impl RawPeer {
    /// Wire a raw endpoint to a new engine using `config`.
    pub fn new(config: TransferConfig) -> Self {
        let ((raw, mut raw_rx), (engine_side, engine_rx)) = MemoryChannel::pair(1024);
        let _ = raw_rx.try_recv();

        let (engine, engine_events) = Connection::new(engine_side, config).expect("config");
        let reader = engine.spawn(engine_rx);

        Self {
            channel: raw,
            inbound: raw_rx,
            engine,
            engine_events,
            reader,
        }
    }

    /// Send one message to the engine.
    pub async fn send(&self, message: Message) {
        let frame = message.to_bytes().expect("encode");
        self.channel.send(frame).await.expect("send");
    }

    /// Next message from the engine.
    pub async fn recv(&mut self) -> Message {
        let event = tokio::time::timeout(EVENT_WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for message");
        match event {
            Some(ChannelEvent::Data(frame)) => Message::from_bytes(&frame).expect("decode"),
            other => panic!("expected a data frame, got {other:?}"),
        }
    }

    /// Assert the engine has sent nothing further.
    pub fn assert_idle(&mut self) {
        if let Ok(event) = self.inbound.try_recv() {
            panic!("unexpected event: {event:?}");
        }
    }

    /// Wait until the engine has processed every frame sent so far.
    ///
    /// Sends a key exchange init and waits for its reply, which the engine
    /// can only produce after handling the earlier frames.
    pub async fn sync(&mut self) -> Vec<Message> {
        let session_id = shroud_core::SessionId::generate().expect("rng");
        let public_key = shroud_crypto::x25519::PrivateKey::generate(&mut rand_core::OsRng)
            .public_key()
            .to_bytes()
            .to_vec();
        self.send(Message::KeyExchangeInit {
            session_id: session_id.clone(),
            public_key,
        })
        .await;

        let mut before = Vec::new();
        loop {
            match self.recv().await {
                Message::KeyExchangeReply { session_id: sid, .. } if sid == session_id => {
                    return before;
                }
                other => before.push(other),
            }
        }
    }

    /// Close the channel and wait for the engine's reader.
    pub async fn shutdown(self) {
        self.channel.close().await.expect("close");
        self.reader.await.expect("reader task panicked");
    }
}
