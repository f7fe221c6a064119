//! Per-channel connection context.
//!
//! A [`Connection`] owns everything whose lifetime is bound to one channel:
//! the session key store, the key exchange, and the transfer coordinator.
//! Inbound frames are decoded into [`Message`]s and dispatched in arrival
//! order by a single [`Connection::run`] task.
//!
//! # Example
//!
//! ```no_run
//! use shroud_core::{Connection, FilePayload, TransferConfig};
//! use shroud_transport::TcpChannel;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (channel, inbound) = TcpChannel::connect("127.0.0.1:7878").await?;
//! let (connection, _events) = Connection::new(channel, TransferConfig::default())?;
//! let reader = connection.spawn(inbound);
//!
//! let payload = FilePayload::from_path("report.pdf").await?;
//! let (_id, outcome) = connection.transfers().send_file(payload).await?;
//! println!("{outcome:?}");
//!
//! connection.close().await;
//! reader.await?;
//! # Ok(())
//! # }
//! ```

use crate::config::TransferConfig;
use crate::coordinator::{TransferCoordinator, TransferEvent};
use crate::error::Result;
use crate::handshake::KeyExchange;
use crate::ids::SessionId;
use crate::keystore::SessionKeyStore;
use crate::message::Message;
use crate::outbox::Outbox;
use shroud_transport::{Channel, ChannelEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// State for one live channel
pub struct Connection {
    channel: Arc<dyn Channel>,
    keys: Arc<SessionKeyStore>,
    key_exchange: Arc<KeyExchange>,
    transfers: TransferCoordinator,
}

impl Connection {
    /// Build the context for a freshly opened channel.
    ///
    /// Returns the connection together with its [`TransferEvent`] stream.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `config` is invalid.
    pub fn new(
        channel: Arc<dyn Channel>,
        config: TransferConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransferEvent>)> {
        config.validate()?;

        let outbox = Outbox::new(Arc::clone(&channel));
        let keys = Arc::new(SessionKeyStore::new());
        let key_exchange = Arc::new(KeyExchange::new(Arc::clone(&keys), outbox.clone()));
        let (transfers, events) = TransferCoordinator::new(
            config,
            outbox,
            Arc::clone(&keys),
            Arc::clone(&key_exchange),
        );

        let connection = Arc::new(Self {
            channel,
            keys,
            key_exchange,
            transfers,
        });
        Ok((connection, events))
    }

    /// Session keys negotiated on this connection
    #[must_use]
    pub fn keys(&self) -> &Arc<SessionKeyStore> {
        &self.keys
    }

    /// Key exchange driver
    #[must_use]
    pub fn key_exchange(&self) -> &Arc<KeyExchange> {
        &self.key_exchange
    }

    /// Transfer coordinator
    #[must_use]
    pub fn transfers(&self) -> &TransferCoordinator {
        &self.transfers
    }

    /// Whether the underlying channel is still open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Drop one negotiated session key.
    ///
    /// Transfers that reference it can no longer be opened.
    pub fn forget_session(&self, session_id: &SessionId) -> bool {
        let removed = self.keys.remove(session_id);
        if removed {
            tracing::debug!("Forgot session {}", session_id);
        }
        removed
    }

    /// Handle one channel event. Returns `false` once the channel is done.
    ///
    /// Callers driving their own loop must call [`close`](Self::close)
    /// afterwards; [`run`](Self::run) does this itself.
    pub async fn process(&self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Open => tracing::debug!("Channel open"),
            ChannelEvent::Data(frame) => self.handle_frame(&frame).await,
            ChannelEvent::Close => {
                tracing::info!("Channel closed by peer");
                return false;
            }
            ChannelEvent::Error(reason) => {
                tracing::error!("Channel error: {}", reason);
                return false;
            }
        }
        true
    }

    /// Consume channel events until the channel closes or fails.
    pub async fn run(&self, mut inbound: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = inbound.recv().await {
            if !self.process(event).await {
                break;
            }
        }
        self.teardown();
    }

    /// Run the inbound loop on a background task.
    pub fn spawn(self: &Arc<Self>, inbound: mpsc::Receiver<ChannelEvent>) -> JoinHandle<()> {
        let connection = Arc::clone(self);
        tokio::spawn(async move { connection.run(inbound).await })
    }

    /// Close the channel and discard connection-scoped state.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            tracing::debug!("Channel close: {}", e);
        }
        self.teardown();
    }

    fn teardown(&self) {
        self.keys.clear();
        self.key_exchange.reset();
        self.transfers.shutdown();
    }

    async fn handle_frame(&self, frame: &[u8]) {
        match Message::from_bytes(frame) {
            Ok(message) => {
                tracing::debug!("<- {}", message.message_type());
                self.dispatch(message).await;
            }
            Err(e) => tracing::warn!("Dropping undecodable frame ({} bytes): {}", frame.len(), e),
        }
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::KeyExchangeInit {
                session_id,
                public_key,
            } => {
                if let Err(e) = self.key_exchange.on_init(session_id, &public_key).await {
                    tracing::debug!("Key exchange init not answered: {}", e);
                }
            }
            Message::KeyExchangeReply {
                session_id,
                public_key,
            } => {
                if let Err(e) = self.key_exchange.on_reply(session_id, &public_key).await {
                    tracing::debug!("Key exchange reply discarded: {}", e);
                }
            }
            Message::KeyExchangeComplete { session_id } => {
                self.key_exchange.on_complete(&session_id);
            }
            Message::TransferRequest(offer) => self.transfers.on_request(offer).await,
            Message::TransferAccepted { transfer_id } => {
                self.transfers.on_accepted(transfer_id).await;
            }
            Message::TransferRejected { transfer_id } => {
                self.transfers.on_rejected(transfer_id).await;
            }
            Message::TransferStart {
                offer,
                total_chunks,
            } => self.transfers.on_start(offer, total_chunks).await,
            Message::TransferChunk {
                transfer_id,
                chunk_index,
                total_chunks,
                bytes,
            } => {
                self.transfers
                    .on_chunk(transfer_id, chunk_index, total_chunks, bytes)
                    .await;
            }
            Message::ChunkAck {
                transfer_id,
                chunk_index,
            } => self.transfers.on_chunk_ack(transfer_id, chunk_index).await,
            Message::TransferComplete { transfer_id } => {
                self.transfers.on_complete(transfer_id).await;
            }
            Message::TransferCancel { transfer_id } => self.transfers.on_cancel(transfer_id).await,
            Message::TransferCancelAck { transfer_id } => {
                self.transfers.on_cancel_ack(transfer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::error::Error;
    use crate::payload::FilePayload;
    use crate::transfer::TransferState;
    use shroud_transport::MemoryChannel;

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let ((channel, _rx), _peer) = MemoryChannel::pair(8);
        let config = TransferConfig {
            window_limit: 0,
            ..TransferConfig::default()
        };

        assert!(matches!(
            Connection::new(channel, config),
            Err(Error::Config(ConfigError::WindowLimit(0)))
        ));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_dropped() {
        let ((a, a_rx), (b, _b_rx)) = MemoryChannel::pair(8);
        let (connection, _events) = Connection::new(a, TransferConfig::default()).unwrap();
        let reader = connection.spawn(a_rx);

        b.send(vec![0xFF; 7]).await.unwrap();
        b.close().await.unwrap();
        reader.await.unwrap();

        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_handshake_between_connections() {
        let ((a, a_rx), (b, b_rx)) = MemoryChannel::pair(64);
        let (alice, _) = Connection::new(a, TransferConfig::default()).unwrap();
        let (bob, _) = Connection::new(b, TransferConfig::default()).unwrap();
        alice.spawn(a_rx);
        bob.spawn(b_rx);

        let sid = SessionId::new("abc123");
        alice.key_exchange().initiate(sid.clone()).await.unwrap();

        let alice_key = alice.keys().get(&sid).unwrap();
        // Bob stores before replying.
        let bob_key = bob.keys().get(&sid).unwrap();
        assert_eq!(alice_key.as_bytes(), bob_key.as_bytes());

        assert!(alice.forget_session(&sid));
        assert!(!alice.forget_session(&sid));
        assert!(bob.keys().contains(&sid));
    }

    #[tokio::test]
    async fn test_bad_key_exchange_init_gets_no_reply() {
        let ((a, a_rx), (b, mut b_rx)) = MemoryChannel::pair(64);
        let _ = b_rx.try_recv();
        let (connection, _events) = Connection::new(a, TransferConfig::default()).unwrap();
        connection.spawn(a_rx);

        let send = |message: Message| {
            let b = Arc::clone(&b);
            async move { b.send(message.to_bytes().unwrap()).await.unwrap() }
        };
        send(Message::KeyExchangeInit {
            session_id: SessionId::new("short"),
            public_key: vec![1, 2, 3],
        })
        .await;
        send(Message::KeyExchangeInit {
            session_id: SessionId::new("zero"),
            public_key: vec![0; 32],
        })
        .await;

        let peer_public = shroud_crypto::x25519::PrivateKey::generate(&mut rand_core::OsRng)
            .public_key()
            .to_bytes()
            .to_vec();
        send(Message::KeyExchangeInit {
            session_id: SessionId::new("good"),
            public_key: peer_public,
        })
        .await;

        // The only reply is for the valid init.
        let reply = match b_rx.recv().await {
            Some(ChannelEvent::Data(frame)) => Message::from_bytes(&frame).unwrap(),
            other => panic!("expected a reply frame, got {other:?}"),
        };
        assert!(matches!(
            reply,
            Message::KeyExchangeReply { ref session_id, .. } if *session_id == SessionId::new("good")
        ));
        assert!(connection.keys().contains(&SessionId::new("good")));
        assert!(!connection.keys().contains(&SessionId::new("short")));
        assert!(!connection.keys().contains(&SessionId::new("zero")));
        assert_eq!(connection.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_close_clears_keys_and_errors_waiting_sender() {
        let ((a, a_rx), (b, b_rx)) = MemoryChannel::pair(64);
        let config = TransferConfig {
            secure: false,
            ..TransferConfig::default()
        };
        let (alice, _) = Connection::new(a, config.clone()).unwrap();
        let (bob, _bob_events) = Connection::new(b, config).unwrap();
        let alice_reader = alice.spawn(a_rx);
        bob.spawn(b_rx);

        alice.keys().store(
            SessionId::new("s"),
            shroud_crypto::FileCodec::generate_key().unwrap(),
        );

        let id = alice
            .transfers()
            .offer(FilePayload::new("a.txt", "text/plain", b"hello".to_vec()))
            .await
            .unwrap();

        let run = tokio::spawn({
            let alice = Arc::clone(&alice);
            async move { alice.transfers().run_outbound(id).await }
        });

        bob.close().await;
        alice_reader.await.unwrap();

        assert!(run.await.unwrap().is_err());
        assert_eq!(alice.transfers().state(id).await, Some(TransferState::Errored));
        assert!(alice.keys().is_empty());
    }
}
