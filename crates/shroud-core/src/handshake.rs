//! Per-session X25519 key exchange.
//!
//! ```text
//! Initiator                               Responder
//!   initiate(sid)
//!   ── KeyExchangeInit{sid, pk_i} ──────────▶ on_init: derive, store
//!   ◀────────── KeyExchangeReply{sid, pk_r} ── 
//!   on_reply: derive, store, resolve
//!   ── KeyExchangeComplete{sid} ────────────▶ on_complete (informational)
//! ```
//!
//! One key pair is generated lazily per connection and reused for every
//! session on it. Sessions are independent of each other; any number may be
//! in progress at once.

use crate::error::HandshakeError;
use crate::ids::SessionId;
use crate::keystore::SessionKeyStore;
use crate::message::Message;
use crate::outbox::Outbox;
use dashmap::DashMap;
use rand_core::OsRng;
use shroud_crypto::AeadKey;
use shroud_crypto::x25519::{PrivateKey, PublicKey};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<(), HandshakeError>>;

/// Key exchange coordinator for one connection
pub struct KeyExchange {
    keys: Arc<SessionKeyStore>,
    outbox: Outbox,
    key_pair: Mutex<Option<PrivateKey>>,
    pending: DashMap<SessionId, Completion>,
}

impl KeyExchange {
    pub(crate) fn new(keys: Arc<SessionKeyStore>, outbox: Outbox) -> Self {
        Self {
            keys,
            outbox,
            key_pair: Mutex::new(None),
            pending: DashMap::new(),
        }
    }

    fn local_key(&self) -> PrivateKey {
        let mut guard = self.key_pair.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .get_or_insert_with(|| {
                tracing::debug!("Generated connection key pair");
                PrivateKey::generate(&mut OsRng)
            })
            .clone()
    }

    fn derive(&self, session_id: &SessionId, peer: &[u8]) -> Result<AeadKey, HandshakeError> {
        let peer = PublicKey::from_slice(peer).map_err(|_| HandshakeError::InvalidPublicKey)?;
        shroud_crypto::derive_session_key(&self.local_key(), &peer, session_id.as_bytes())
            .map_err(HandshakeError::Derivation)
    }

    /// Start a handshake for `session_id` and wait for it to finish.
    ///
    /// Resolves once the peer's reply has been processed and the key is in
    /// the [`SessionKeyStore`]. There is no timeout; the wait ends with
    /// [`HandshakeError::Closed`] when the connection goes away.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::ChannelUnavailable`] if the init message
    /// cannot be sent, or the failure reported while processing the reply.
    pub async fn initiate(&self, session_id: SessionId) -> Result<(), HandshakeError> {
        let public_key = self.local_key().public_key();

        let (tx, rx) = oneshot::channel();
        if self.pending.insert(session_id.clone(), tx).is_some() {
            tracing::warn!("Restarted pending handshake for session {}", session_id);
        }

        tracing::debug!("Initiating key exchange for session {}", session_id);
        let init = Message::KeyExchangeInit {
            session_id: session_id.clone(),
            public_key: public_key.to_bytes().to_vec(),
        };
        if let Err(e) = self.outbox.send(init).await {
            self.pending.remove(&session_id);
            return Err(HandshakeError::ChannelUnavailable(e.to_string()));
        }

        rx.await.unwrap_or(Err(HandshakeError::Closed))
    }

    /// Responder side: derive and store the key, then reply.
    ///
    /// On failure nothing is sent; the initiator stays pending until the
    /// connection closes.
    ///
    /// # Errors
    ///
    /// Returns the derivation failure, or
    /// [`HandshakeError::ChannelUnavailable`] if the reply cannot be sent.
    pub async fn on_init(
        &self,
        session_id: SessionId,
        peer_public_key: &[u8],
    ) -> Result<(), HandshakeError> {
        let key = self.derive(&session_id, peer_public_key).inspect_err(|e| {
            tracing::warn!("Key exchange init for session {} rejected: {}", session_id, e);
        })?;
        self.keys.store(session_id.clone(), key);

        let reply = Message::KeyExchangeReply {
            session_id: session_id.clone(),
            public_key: self.local_key().public_key().to_bytes().to_vec(),
        };
        self.outbox
            .send(reply)
            .await
            .map_err(|e| HandshakeError::ChannelUnavailable(e.to_string()))?;

        tracing::debug!("Stored key for session {} (responder)", session_id);
        Ok(())
    }

    /// Initiator side: derive and store the key, notify the peer, and
    /// resolve the pending [`initiate`](Self::initiate) call.
    ///
    /// # Errors
    ///
    /// Returns the derivation failure, which is also delivered to the
    /// pending caller.
    pub async fn on_reply(
        &self,
        session_id: SessionId,
        peer_public_key: &[u8],
    ) -> Result<(), HandshakeError> {
        let key = match self.derive(&session_id, peer_public_key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Key exchange reply for session {} rejected: {}", session_id, e);
                self.resolve(&session_id, Err(e.clone()));
                return Err(e);
            }
        };
        self.keys.store(session_id.clone(), key);
        tracing::debug!("Stored key for session {} (initiator)", session_id);

        let complete = Message::KeyExchangeComplete {
            session_id: session_id.clone(),
        };
        if let Err(e) = self.outbox.send(complete).await {
            tracing::warn!("Could not notify completion of session {}: {}", session_id, e);
        }

        self.resolve(&session_id, Ok(()));
        Ok(())
    }

    /// Peer confirms it stored its key. No state change.
    pub fn on_complete(&self, session_id: &SessionId) {
        tracing::debug!("Peer completed key exchange for session {}", session_id);
    }

    fn resolve(&self, session_id: &SessionId, result: Result<(), HandshakeError>) {
        match self.pending.remove(session_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!("No pending handshake for session {}", session_id),
        }
    }

    /// Fail every pending handshake and discard the key pair.
    pub fn reset(&self) {
        let ids: Vec<SessionId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.resolve(&id, Err(HandshakeError::Closed));
        }

        *self.key_pair.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of handshakes awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
