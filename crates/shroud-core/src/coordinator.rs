//! Transfer negotiation, streaming and cancellation.
//!
//! # Sender
//!
//! 1. [`TransferCoordinator::offer`] obtains a file key (negotiated session
//!    key, or a literal key when the handshake fails or is skipped), seals
//!    the whole payload and emits `TransferRequest`.
//! 2. [`TransferCoordinator::run_outbound`] waits for the receiver's
//!    decision, emits `TransferStart` and pumps `TransferChunk`s through a
//!    [`ChunkWindow`]. Once the last chunk is handed to the channel it emits
//!    `TransferComplete` and the transfer is `Completed` without waiting for
//!    the receiver.
//!
//! # Receiver
//!
//! A `TransferRequest` surfaces as [`TransferEvent::IncomingRequest`]; the
//! caller answers with [`accept`](TransferCoordinator::accept) or
//! [`reject`](TransferCoordinator::reject). Chunks are acknowledged as they
//! are stored. When every index is present the ciphertext is assembled, but
//! decryption waits for [`open`](TransferCoordinator::open).
//!
//! Nothing is retried and nothing times out: a transfer whose chunks stop
//! arriving stays `Transferring` until someone cancels it.

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::handshake::KeyExchange;
use crate::ids::{SessionId, TransferId};
use crate::keystore::SessionKeyStore;
use crate::message::{KeyMaterial, Message, TransferOffer};
use crate::outbox::Outbox;
use crate::payload::FilePayload;
use crate::telemetry::TransferProgress;
use crate::transfer::{
    ChunkInsert, ChunkWindow, Direction, ReassemblyBuffer, TransferSession, TransferState,
};
use dashmap::DashMap;
use shroud_crypto::{AeadKey, FileCodec};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc, oneshot};

/// Largest chunk count an inbound `TransferStart` may announce.
pub const MAX_TOTAL_CHUNKS: u64 = 1 << 24;

/// How an outbound transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every chunk was handed to the channel
    Completed,
    /// The receiver declined
    Rejected,
    /// Either side cancelled
    Cancelled,
}

/// State changes published to the application
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The peer offers a file; answer with `accept` or `reject`
    IncomingRequest {
        /// Transfer ID
        transfer_id: TransferId,
        /// Suggested file name
        name: String,
        /// Ciphertext size in bytes
        size: u64,
        /// MIME type
        mime_type: String,
        /// Whether the key was negotiated
        secure: bool,
    },
    /// A transfer was accepted (by the peer for outbound, locally for inbound)
    Accepted(TransferId),
    /// A transfer was rejected
    Rejected(TransferId),
    /// Chunk received or acknowledged
    Progress(TransferProgress),
    /// Inbound transfer fully reassembled; ready to [`open`](TransferCoordinator::open)
    Received(TransferId),
    /// Outbound transfer finished sending
    Completed(TransferId),
    /// Transfer cancelled by either side
    Cancelled(TransferId),
    /// Transfer aborted by a local failure
    Errored {
        /// Transfer ID
        transfer_id: TransferId,
        /// Failure description
        reason: String,
    },
}

#[derive(Debug)]
enum Decision {
    Accepted,
    Rejected,
    Cancelled,
    Lost,
}

struct TransferRecord {
    session: TransferSession,
    /// Sealed payload (outbound) or assembled ciphertext (inbound)
    payload: Option<Arc<Vec<u8>>>,
    buffer: Option<ReassemblyBuffer>,
    decision: Option<oneshot::Receiver<Decision>>,
}

struct TransferEntry {
    record: Mutex<TransferRecord>,
    /// Outbound only
    window: Option<ChunkWindow>,
}

impl TransferEntry {
    fn new(session: TransferSession, window: Option<ChunkWindow>) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(TransferRecord {
                session,
                payload: None,
                buffer: None,
                decision: None,
            }),
            window,
        })
    }
}

/// Per-connection transfer state machine
pub struct TransferCoordinator {
    config: TransferConfig,
    outbox: Outbox,
    keys: Arc<SessionKeyStore>,
    key_exchange: Arc<KeyExchange>,
    transfers: DashMap<TransferId, Arc<TransferEntry>>,
    decisions: DashMap<TransferId, oneshot::Sender<Decision>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferCoordinator {
    pub(crate) fn new(
        config: TransferConfig,
        outbox: Outbox,
        keys: Arc<SessionKeyStore>,
        key_exchange: Arc<KeyExchange>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            config,
            outbox,
            keys,
            key_exchange,
            transfers: DashMap::new(),
            decisions: DashMap::new(),
            events,
        };
        (coordinator, rx)
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    fn get(&self, id: TransferId) -> Option<Arc<TransferEntry>> {
        self.transfers.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn entry(&self, id: TransferId) -> Result<Arc<TransferEntry>, TransferError> {
        self.get(id).ok_or(TransferError::NotFound(id))
    }

    fn resolve(&self, id: TransferId, decision: Decision) {
        if let Some((_, tx)) = self.decisions.remove(&id) {
            let _ = tx.send(decision);
        }
    }

    /// Move a transfer to `Errored` (if it is not terminal yet) and stop its
    /// pump.
    async fn fail(&self, entry: &TransferEntry, reason: impl Into<String>) -> TransferError {
        let reason = reason.into();
        let (id, newly) = {
            let mut record = entry.record.lock().await;
            let newly = record.session.mark_errored(reason.clone()).is_ok();
            (record.session.id(), newly)
        };

        if let Some(window) = &entry.window {
            window.close();
        }
        self.resolve(id, Decision::Lost);

        if newly {
            tracing::error!("Transfer {} errored: {}", id, reason);
            self.emit(TransferEvent::Errored {
                transfer_id: id,
                reason: reason.clone(),
            });
        }
        TransferError::ChannelUnavailable(reason)
    }

    /// Outcome for a pump that cannot continue.
    async fn halted(&self, entry: &TransferEntry) -> Result<TransferOutcome, TransferError> {
        let (state, failure) = {
            let record = entry.record.lock().await;
            (
                record.session.state(),
                record.session.failure().map(str::to_string),
            )
        };

        match state {
            TransferState::Cancelled => Ok(TransferOutcome::Cancelled),
            _ => Err(self
                .fail(entry, failure.unwrap_or_else(|| "channel closed".to_string()))
                .await),
        }
    }

    // ========================================================================
    // Sender
    // ========================================================================

    /// Offer a file using the configured security mode.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ChannelUnavailable`] if the request cannot be
    /// sent, or [`TransferError::Crypto`] if sealing fails.
    pub async fn offer(&self, payload: FilePayload) -> Result<TransferId, TransferError> {
        self.offer_with(payload, self.config.secure).await
    }

    /// Offer a file, choosing the security mode explicitly.
    ///
    /// With `secure` set a key exchange is attempted first; if it fails the
    /// transfer silently falls back to a literal key carried in the request.
    ///
    /// # Errors
    ///
    /// See [`offer`](Self::offer).
    pub async fn offer_with(
        &self,
        payload: FilePayload,
        secure: bool,
    ) -> Result<TransferId, TransferError> {
        let transfer_id = TransferId::generate()?;
        let (key, material) = self.file_key(secure).await?;
        let (ciphertext, nonce) = FileCodec::encrypt(&payload.bytes, &key)?;

        let offer = TransferOffer {
            transfer_id,
            name: payload.name,
            size: ciphertext.len() as u64,
            mime_type: payload.mime_type,
            key: material,
            nonce: *nonce.as_bytes(),
        };

        let (tx, rx) = oneshot::channel();
        let entry = TransferEntry::new(
            TransferSession::new_outbound(offer.clone(), self.config.chunk_size),
            Some(ChunkWindow::new(self.config.window_limit)),
        );
        {
            let mut record = entry.record.lock().await;
            record.payload = Some(Arc::new(ciphertext));
            record.decision = Some(rx);
        }
        self.decisions.insert(transfer_id, tx);
        self.transfers.insert(transfer_id, Arc::clone(&entry));

        tracing::info!(
            "Offering {} ({} bytes sealed, {}) as transfer {}",
            offer.name,
            offer.size,
            if offer.is_secure() { "session key" } else { "literal key" },
            transfer_id
        );

        if let Err(e) = self.outbox.send(Message::TransferRequest(offer)).await {
            return Err(self.fail(&entry, e.to_string()).await);
        }
        Ok(transfer_id)
    }

    async fn file_key(&self, secure: bool) -> Result<(AeadKey, KeyMaterial), TransferError> {
        if secure {
            let session_id = SessionId::generate()?;
            match self.key_exchange.initiate(session_id.clone()).await {
                Ok(()) => match self.keys.get(&session_id) {
                    Some(key) => return Ok((key, KeyMaterial::Session(session_id))),
                    None => tracing::warn!(
                        "Session {} has no stored key; falling back to literal key",
                        session_id
                    ),
                },
                Err(e) => {
                    tracing::warn!("Key exchange failed ({}); falling back to literal key", e);
                }
            }
        }

        let key = FileCodec::generate_key()?;
        let material = KeyMaterial::Literal(*key.as_bytes());
        Ok((key, material))
    }

    /// Wait for the receiver's decision and stream the transfer.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ChannelUnavailable`] if a message cannot be
    /// sent or the connection closes; the transfer is then `Errored`.
    /// Returns [`TransferError::NotReady`] if the transfer is not an
    /// outbound transfer awaiting its first run.
    pub async fn run_outbound(&self, id: TransferId) -> Result<TransferOutcome, TransferError> {
        let entry = self.entry(id)?;
        let window = entry.window.as_ref().ok_or(TransferError::NotReady(id))?;

        let (decision, payload) = {
            let mut record = entry.record.lock().await;
            let decision = record.decision.take().ok_or(TransferError::NotReady(id))?;
            let payload = record.payload.clone().ok_or(TransferError::NotReady(id))?;
            (decision, payload)
        };

        match decision.await.unwrap_or(Decision::Lost) {
            Decision::Accepted => {}
            Decision::Rejected => {
                tracing::info!("Transfer {} rejected by peer", id);
                return Ok(TransferOutcome::Rejected);
            }
            Decision::Cancelled => return Ok(TransferOutcome::Cancelled),
            Decision::Lost => return self.halted(&entry).await,
        }

        let (offer, total_chunks) = {
            let mut record = entry.record.lock().await;
            if record.session.state() == TransferState::Cancelled {
                return Ok(TransferOutcome::Cancelled);
            }
            record.session.transition(TransferState::Transferring)?;
            record.session.start(Instant::now());
            (record.session.offer.clone(), record.session.total_chunks())
        };

        let start = Message::TransferStart {
            offer,
            total_chunks,
        };
        if let Err(e) = self.outbox.send(start).await {
            return Err(self.fail(&entry, e.to_string()).await);
        }
        tracing::info!("Streaming transfer {} in {} chunks", id, total_chunks);

        for index in 0..total_chunks {
            if window.acquire().await.is_err() {
                return self.halted(&entry).await;
            }

            let range = entry.record.lock().await.session.chunk_range(index);
            let len = range.len();
            let chunk = Message::TransferChunk {
                transfer_id: id,
                chunk_index: index,
                total_chunks,
                bytes: payload[range].to_vec(),
            };

            // A cancel landing between this check and the send can still
            // precede the chunk on the wire; the receiver drops it.
            {
                let record = entry.record.lock().await;
                if record.session.is_terminal() {
                    tracing::trace!("Discarding sliced chunk {} of {}", index, id.short());
                    drop(record);
                    return self.halted(&entry).await;
                }
                window.mark_sent(index);
            }
            tracing::trace!(
                "Chunk {}/{} of {} ({} bytes, {} in flight)",
                index + 1,
                total_chunks,
                id.short(),
                len,
                window.in_flight()
            );
            if let Err(e) = self.outbox.send(chunk).await {
                return Err(self.fail(&entry, e.to_string()).await);
            }
        }

        if let Err(e) = self.outbox.send(Message::TransferComplete { transfer_id: id }).await {
            return Err(self.fail(&entry, e.to_string()).await);
        }

        let completed = entry
            .record
            .lock()
            .await
            .session
            .transition(TransferState::Completed);
        if completed.is_err() {
            return self.halted(&entry).await;
        }

        tracing::info!("Transfer {} sent", id);
        self.emit(TransferEvent::Completed(id));
        Ok(TransferOutcome::Completed)
    }

    /// Offer a file and run it to the end.
    ///
    /// # Errors
    ///
    /// See [`offer`](Self::offer) and [`run_outbound`](Self::run_outbound).
    pub async fn send_file(
        &self,
        payload: FilePayload,
    ) -> Result<(TransferId, TransferOutcome), TransferError> {
        let id = self.offer(payload).await?;
        let outcome = self.run_outbound(id).await?;
        Ok((id, outcome))
    }

    // ========================================================================
    // Receiver decisions and local control
    // ========================================================================

    async fn decide(&self, id: TransferId, next: TransferState) -> Result<(), TransferError> {
        let entry = self.entry(id)?;
        {
            let mut record = entry.record.lock().await;
            if record.session.direction != Direction::Inbound {
                return Err(TransferError::InvalidTransition {
                    id,
                    from: record.session.state(),
                    to: next,
                });
            }
            record.session.transition(next)?;
        }

        let (reply, event) = match next {
            TransferState::Accepted => (
                Message::TransferAccepted { transfer_id: id },
                TransferEvent::Accepted(id),
            ),
            _ => (
                Message::TransferRejected { transfer_id: id },
                TransferEvent::Rejected(id),
            ),
        };
        if let Err(e) = self.outbox.send(reply).await {
            return Err(self.fail(&entry, e.to_string()).await);
        }

        tracing::info!("Transfer {} {}", id, next);
        self.emit(event);
        Ok(())
    }

    /// Accept an incoming transfer.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidTransition`] unless the transfer is an
    /// inbound request awaiting a decision.
    pub async fn accept(&self, id: TransferId) -> Result<(), TransferError> {
        self.decide(id, TransferState::Accepted).await
    }

    /// Reject an incoming transfer.
    ///
    /// # Errors
    ///
    /// See [`accept`](Self::accept).
    pub async fn reject(&self, id: TransferId) -> Result<(), TransferError> {
        self.decide(id, TransferState::Rejected).await
    }

    async fn cancel_locally(&self, entry: &TransferEntry) -> Result<TransferId, TransferError> {
        let id = {
            let mut record = entry.record.lock().await;
            record.session.transition(TransferState::Cancelled)?;
            record.buffer = None;
            record.payload = None;
            record.session.id()
        };

        if let Some(window) = &entry.window {
            window.close();
        }
        self.resolve(id, Decision::Cancelled);
        self.emit(TransferEvent::Cancelled(id));
        Ok(id)
    }

    /// Cancel a transfer and tell the peer.
    ///
    /// The local cancellation stands even if the peer cannot be reached.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidTransition`] if the transfer already
    /// ended.
    pub async fn cancel(&self, id: TransferId) -> Result<(), TransferError> {
        let entry = self.entry(id)?;
        self.cancel_locally(&entry).await?;
        tracing::info!("Cancelled transfer {}", id);

        if let Err(e) = self.outbox.send(Message::TransferCancel { transfer_id: id }).await {
            tracing::warn!("Peer not notified of cancellation of {}: {}", id, e);
        }
        Ok(())
    }

    /// Decrypt a completed inbound transfer.
    ///
    /// # Errors
    ///
    /// - [`TransferError::NotReady`] before reassembly finished
    /// - [`TransferError::MissingKey`] if the session key was removed
    /// - [`TransferError::AuthenticationFailure`] if the ciphertext does not
    ///   verify under the key
    pub async fn open(&self, id: TransferId) -> Result<FilePayload, TransferError> {
        let entry = self.entry(id)?;
        let (offer, ciphertext) = {
            let record = entry.record.lock().await;
            if record.session.direction != Direction::Inbound
                || record.session.state() != TransferState::Completed
            {
                return Err(TransferError::NotReady(id));
            }
            let ciphertext = record.payload.clone().ok_or(TransferError::NotReady(id))?;
            (record.session.offer.clone(), ciphertext)
        };

        let key = match &offer.key {
            KeyMaterial::Literal(bytes) => AeadKey::new(*bytes),
            KeyMaterial::Session(session_id) => self
                .keys
                .get(session_id)
                .ok_or_else(|| TransferError::MissingKey(session_id.clone()))?,
        };

        let plaintext = FileCodec::decrypt(&ciphertext, &key, &offer.nonce()).inspect_err(|e| {
            tracing::error!("Transfer {} failed to open: {}", id, e);
        })?;

        Ok(FilePayload::new(offer.name, offer.mime_type, plaintext))
    }

    /// Progress snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] for an unknown id.
    pub async fn progress(&self, id: TransferId) -> Result<TransferProgress, TransferError> {
        let entry = self.entry(id)?;
        let record = entry.record.lock().await;
        Ok(record.session.progress(&self.config.quality))
    }

    /// Offer metadata (name, size, key material) of a transfer.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] for an unknown id.
    pub async fn metadata(&self, id: TransferId) -> Result<TransferOffer, TransferError> {
        let entry = self.entry(id)?;
        let record = entry.record.lock().await;
        Ok(record.session.offer.clone())
    }

    /// Current state, if the transfer is known.
    pub async fn state(&self, id: TransferId) -> Option<TransferState> {
        let entry = self.get(id)?;
        let state = entry.record.lock().await.session.state();
        Some(state)
    }

    /// Chunks sent but not acknowledged; `None` for unknown or inbound
    /// transfers.
    #[must_use]
    pub fn in_flight(&self, id: TransferId) -> Option<usize> {
        self.get(id)?.window.as_ref().map(ChunkWindow::in_flight)
    }

    /// Ids of all non-terminal transfers.
    pub async fn active_transfers(&self) -> Vec<TransferId> {
        let entries: Vec<Arc<TransferEntry>> =
            self.transfers.iter().map(|e| Arc::clone(e.value())).collect();

        let mut active = Vec::new();
        for entry in entries {
            let record = entry.record.lock().await;
            if !record.session.is_terminal() {
                active.push(record.session.id());
            }
        }
        active
    }

    /// Forget a finished transfer.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidTransition`] if the transfer is still
    /// running.
    pub async fn remove(&self, id: TransferId) -> Result<(), TransferError> {
        let entry = self.entry(id)?;
        let state = entry.record.lock().await.session.state();
        if !state.is_terminal() {
            return Err(TransferError::InvalidTransition {
                id,
                from: state,
                to: state,
            });
        }
        self.transfers.remove(&id);
        Ok(())
    }

    /// Wake every waiting sender after the connection went away.
    ///
    /// Outbound transfers still negotiating or pumping end up `Errored`.
    /// Inbound transfers keep their state.
    pub fn shutdown(&self) {
        for entry in &self.transfers {
            if let Some(window) = &entry.value().window {
                window.close();
            }
        }

        let ids: Vec<TransferId> = self.decisions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.resolve(id, Decision::Lost);
        }
    }

    // ========================================================================
    // Inbound message handlers
    // ========================================================================

    /// `TransferRequest`: register the offer and surface the decision point.
    pub async fn on_request(&self, offer: TransferOffer) {
        let id = offer.transfer_id;
        if self.transfers.contains_key(&id) {
            tracing::warn!("Ignoring repeated request for known transfer {}", id);
            return;
        }

        tracing::info!(
            "Incoming transfer {}: {} ({} bytes, {})",
            id,
            offer.name,
            offer.size,
            offer.mime_type
        );
        let event = TransferEvent::IncomingRequest {
            transfer_id: id,
            name: offer.name.clone(),
            size: offer.size,
            mime_type: offer.mime_type.clone(),
            secure: offer.is_secure(),
        };

        self.transfers
            .insert(id, TransferEntry::new(TransferSession::new_inbound(offer), None));
        self.emit(event);
    }

    async fn on_decision(&self, id: TransferId, next: TransferState) {
        let Some(entry) = self.get(id) else {
            tracing::warn!("{} for unknown transfer {}", next, id);
            return;
        };

        {
            let mut record = entry.record.lock().await;
            if record.session.direction != Direction::Outbound {
                tracing::warn!("Ignoring {} for inbound transfer {}", next, id);
                return;
            }
            if let Err(e) = record.session.transition(next) {
                tracing::debug!("Ignoring peer decision: {}", e);
                return;
            }
        }

        let (decision, event) = match next {
            TransferState::Accepted => (Decision::Accepted, TransferEvent::Accepted(id)),
            _ => (Decision::Rejected, TransferEvent::Rejected(id)),
        };
        self.resolve(id, decision);
        self.emit(event);
    }

    /// `TransferAccepted`: release the waiting sender.
    pub async fn on_accepted(&self, id: TransferId) {
        self.on_decision(id, TransferState::Accepted).await;
    }

    /// `TransferRejected`: the sender resolves to [`TransferOutcome::Rejected`].
    pub async fn on_rejected(&self, id: TransferId) {
        self.on_decision(id, TransferState::Rejected).await;
    }

    /// `TransferStart`: size the reassembly buffer.
    pub async fn on_start(&self, offer: TransferOffer, total_chunks: u64) {
        let id = offer.transfer_id;
        let Some(entry) = self.get(id) else {
            tracing::warn!("TransferStart for unknown transfer {}", id);
            return;
        };

        let mut record = entry.record.lock().await;
        if record.session.direction != Direction::Inbound
            || record.session.state() != TransferState::Accepted
        {
            tracing::warn!(
                "Ignoring TransferStart for {} in state {}",
                id,
                record.session.state()
            );
            return;
        }
        if total_chunks == 0
            || total_chunks > record.session.offer.size
            || total_chunks > MAX_TOTAL_CHUNKS
        {
            tracing::warn!(
                "Ignoring TransferStart for {}: {} chunks for {} bytes",
                id,
                total_chunks,
                record.session.offer.size
            );
            return;
        }
        if offer != record.session.offer {
            tracing::warn!("TransferStart metadata for {} differs from request; keeping request", id);
        }

        record.session.set_total_chunks(total_chunks);
        record.session.start(Instant::now());
        record.buffer = Some(ReassemblyBuffer::with_byte_limit(
            total_chunks,
            record.session.offer.size,
        ));
        tracing::debug!("Receiving {} in {} chunks", id, total_chunks);
    }

    /// `TransferChunk`: store, acknowledge, and assemble when complete.
    pub async fn on_chunk(&self, id: TransferId, index: u64, total_chunks: u64, bytes: Vec<u8>) {
        let Some(entry) = self.get(id) else {
            tracing::warn!("Chunk for unknown transfer {}", id);
            return;
        };

        let (progress, received) = {
            let mut guard = entry.record.lock().await;
            let record = &mut *guard;

            match record.session.state() {
                TransferState::Cancelled => {
                    tracing::trace!("Dropping chunk {} of cancelled transfer {}", index, id.short());
                    return;
                }
                state if state.is_terminal() => {
                    tracing::debug!("Dropping chunk {} of {} transfer {}", index, state, id.short());
                    return;
                }
                _ => {}
            }

            let Some(buffer) = record.buffer.as_mut() else {
                tracing::warn!("Chunk {} of {} arrived before TransferStart", index, id);
                return;
            };
            if total_chunks != buffer.total() {
                tracing::warn!(
                    "Chunk {} of {} claims {} chunks, expected {}",
                    index,
                    id,
                    total_chunks,
                    buffer.total()
                );
                return;
            }

            let len = bytes.len();
            match buffer.insert(index, bytes) {
                ChunkInsert::OutOfRange => {
                    tracing::warn!("Chunk index {} out of range for {}", index, id);
                    return;
                }
                ChunkInsert::Overflow => {
                    tracing::warn!(
                        "Chunk {} of {} exceeds the offered {} bytes",
                        index,
                        id,
                        record.session.offer.size
                    );
                    return;
                }
                ChunkInsert::Duplicate => {
                    tracing::debug!("Duplicate chunk {} of {}", index, id.short());
                }
                ChunkInsert::New => {
                    record.session.record_chunk(index, len, Instant::now());
                    tracing::trace!("Stored chunk {}/{} of {}", index + 1, total_chunks, id.short());
                }
            }
            let complete = buffer.is_complete();

            if let Err(e) = record.session.transition(TransferState::Transferring) {
                tracing::warn!("Dropping chunk: {}", e);
                return;
            }

            if complete {
                record.payload = record
                    .buffer
                    .take()
                    .and_then(ReassemblyBuffer::assemble)
                    .map(Arc::new);
                if let Err(e) = record.session.transition(TransferState::Completed) {
                    tracing::warn!("Could not complete {}: {}", id, e);
                }
            }

            (record.session.progress(&self.config.quality), complete)
        };

        let ack = Message::ChunkAck {
            transfer_id: id,
            chunk_index: index,
        };
        if let Err(e) = self.outbox.send(ack).await {
            tracing::warn!("Could not acknowledge chunk {} of {}: {}", index, id, e);
        }

        self.emit(TransferEvent::Progress(progress));
        if received {
            tracing::info!("Transfer {} received", id);
            self.emit(TransferEvent::Received(id));
        }
    }

    /// `ChunkAck`: free window capacity for the acknowledged index.
    pub async fn on_chunk_ack(&self, id: TransferId, index: u64) {
        let Some(entry) = self.get(id) else {
            tracing::warn!("Ack for unknown transfer {}", id);
            return;
        };
        let Some(window) = &entry.window else {
            tracing::warn!("Ack for inbound transfer {}", id);
            return;
        };

        if !window.ack(index) {
            tracing::debug!("Ack for chunk {} of {} not in flight", index, id.short());
            return;
        }

        let progress = {
            let mut record = entry.record.lock().await;
            record.session.record_ack(index, Instant::now());
            record.session.progress(&self.config.quality)
        };
        self.emit(TransferEvent::Progress(progress));
    }

    /// `TransferComplete`: informational; completion is driven by chunks.
    pub async fn on_complete(&self, id: TransferId) {
        let Some(entry) = self.get(id) else {
            tracing::warn!("TransferComplete for unknown transfer {}", id);
            return;
        };

        let record = entry.record.lock().await;
        match record.session.state() {
            TransferState::Completed => tracing::debug!("Sender finished transfer {}", id),
            TransferState::Transferring | TransferState::Accepted => tracing::warn!(
                "TransferComplete for {} with {}/{} chunks",
                id,
                record.session.chunks_done(),
                record.session.total_chunks()
            ),
            state => tracing::debug!("TransferComplete for {} transfer {}", state, id),
        }
    }

    /// `TransferCancel`: cancel locally and acknowledge.
    pub async fn on_cancel(&self, id: TransferId) {
        let Some(entry) = self.get(id) else {
            tracing::warn!("Cancel for unknown transfer {}", id);
            return;
        };

        match self.cancel_locally(&entry).await {
            Ok(_) => tracing::info!("Transfer {} cancelled by peer", id),
            Err(e) => tracing::debug!("Peer cancel ignored: {}", e),
        }

        if let Err(e) = self.outbox.send(Message::TransferCancelAck { transfer_id: id }).await {
            tracing::warn!("Could not acknowledge cancellation of {}: {}", id, e);
        }
    }

    /// `TransferCancelAck`: informational.
    pub fn on_cancel_ack(&self, id: TransferId) {
        tracing::debug!("Peer confirmed cancellation of {}", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_transport::{ChannelEvent, MemoryChannel};

    struct Harness {
        coordinator: Arc<TransferCoordinator>,
        keys: Arc<SessionKeyStore>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
        peer_rx: mpsc::Receiver<ChannelEvent>,
    }

    fn harness(config: TransferConfig) -> Harness {
        let ((local, _local_rx), (_peer, mut peer_rx)) = MemoryChannel::pair(256);
        let _ = peer_rx.try_recv();

        let outbox = Outbox::new(local);
        let keys = Arc::new(SessionKeyStore::new());
        let kx = Arc::new(KeyExchange::new(Arc::clone(&keys), outbox.clone()));
        let (coordinator, events) =
            TransferCoordinator::new(config, outbox, Arc::clone(&keys), kx);

        Harness {
            coordinator: Arc::new(coordinator),
            keys,
            events,
            peer_rx,
        }
    }

    async fn sent(rx: &mut mpsc::Receiver<ChannelEvent>) -> Message {
        match rx.recv().await {
            Some(ChannelEvent::Data(frame)) => Message::from_bytes(&frame).unwrap(),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn literal_offer(key: &AeadKey, plaintext: &[u8]) -> (TransferOffer, Vec<u8>) {
        let (ciphertext, nonce) = FileCodec::encrypt(plaintext, key).unwrap();
        let offer = TransferOffer {
            transfer_id: TransferId::generate().unwrap(),
            name: "notes.txt".to_string(),
            size: ciphertext.len() as u64,
            mime_type: "text/plain".to_string(),
            key: KeyMaterial::Literal(*key.as_bytes()),
            nonce: *nonce.as_bytes(),
        };
        (offer, ciphertext)
    }

    #[tokio::test]
    async fn test_inbound_flow_reassembles_and_opens() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, ciphertext) = literal_offer(&key, b"hello receiver");
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;
        assert!(matches!(
            h.events.recv().await,
            Some(TransferEvent::IncomingRequest { secure: false, .. })
        ));

        h.coordinator.accept(id).await.unwrap();
        assert_eq!(sent(&mut h.peer_rx).await, Message::TransferAccepted { transfer_id: id });

        h.coordinator.on_start(offer, 2).await;
        let (a, b) = ciphertext.split_at(10);

        h.coordinator.on_chunk(id, 1, 2, b.to_vec()).await;
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Transferring));
        assert!(matches!(
            h.coordinator.open(id).await,
            Err(TransferError::NotReady(_))
        ));

        h.coordinator.on_chunk(id, 0, 2, a.to_vec()).await;
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Completed));

        assert_eq!(
            sent(&mut h.peer_rx).await,
            Message::ChunkAck { transfer_id: id, chunk_index: 1 }
        );
        assert_eq!(
            sent(&mut h.peer_rx).await,
            Message::ChunkAck { transfer_id: id, chunk_index: 0 }
        );

        let opened = h.coordinator.open(id).await.unwrap();
        assert_eq!(opened.bytes, b"hello receiver");
        assert_eq!(opened.name, "notes.txt");
    }

    #[tokio::test]
    async fn test_chunks_before_start_or_accept_are_dropped() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, ciphertext) = literal_offer(&key, b"data");
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;

        // Start before accept is ignored.
        h.coordinator.on_start(offer.clone(), 1).await;
        h.coordinator.on_chunk(id, 0, 1, ciphertext.clone()).await;
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Requested));
        assert!(h.peer_rx.try_recv().is_err());

        h.coordinator.accept(id).await.unwrap();
        sent(&mut h.peer_rx).await;

        // Accepted but no start yet.
        h.coordinator.on_chunk(id, 0, 1, ciphertext).await;
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Accepted));
        assert!(h.peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mismatched_total_and_out_of_range_are_dropped() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, _) = literal_offer(&key, b"0123456789");
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;
        h.coordinator.accept(id).await.unwrap();
        sent(&mut h.peer_rx).await;
        h.coordinator.on_start(offer, 3).await;

        h.coordinator.on_chunk(id, 0, 4, vec![1]).await;
        h.coordinator.on_chunk(id, 3, 3, vec![1]).await;

        let progress = h.coordinator.progress(id).await.unwrap();
        assert_eq!(progress.chunks_done, 0);
        assert!(h.peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chunks_beyond_offered_size_are_dropped() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, _) = literal_offer(&key, b"0123456789");
        let id = offer.transfer_id;
        assert_eq!(offer.size, 26);

        h.coordinator.on_request(offer.clone()).await;
        h.coordinator.accept(id).await.unwrap();
        sent(&mut h.peer_rx).await;
        h.coordinator.on_start(offer, 2).await;

        h.coordinator.on_chunk(id, 0, 2, vec![0; 20]).await;
        assert_eq!(
            sent(&mut h.peer_rx).await,
            Message::ChunkAck { transfer_id: id, chunk_index: 0 }
        );

        h.coordinator.on_chunk(id, 1, 2, vec![0; 7]).await;
        assert!(h.peer_rx.try_recv().is_err());
        assert_eq!(h.coordinator.progress(id).await.unwrap().chunks_done, 1);
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Transferring));
    }

    #[tokio::test]
    async fn test_start_chunk_count_bounds() {
        let h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();

        let (mut large, _) = literal_offer(&key, b"x");
        large.size = MAX_TOTAL_CHUNKS;
        let (mut too_many, _) = literal_offer(&key, b"y");
        too_many.size = MAX_TOTAL_CHUNKS + 1;

        for offer in [&large, &too_many] {
            h.coordinator.on_request(offer.clone()).await;
            h.coordinator.accept(offer.transfer_id).await.unwrap();
        }

        // One-byte chunks up to the cap are accepted without preallocation.
        h.coordinator.on_start(large.clone(), MAX_TOTAL_CHUNKS).await;
        let progress = h.coordinator.progress(large.transfer_id).await.unwrap();
        assert_eq!(progress.chunks_total, MAX_TOTAL_CHUNKS);
        h.coordinator
            .on_chunk(large.transfer_id, MAX_TOTAL_CHUNKS - 1, MAX_TOTAL_CHUNKS, vec![1])
            .await;
        assert_eq!(h.coordinator.progress(large.transfer_id).await.unwrap().chunks_done, 1);

        // Past the cap the start is ignored, so chunks find no buffer.
        h.coordinator.on_start(too_many.clone(), MAX_TOTAL_CHUNKS + 1).await;
        h.coordinator
            .on_chunk(too_many.transfer_id, 0, MAX_TOTAL_CHUNKS + 1, vec![1])
            .await;
        assert_eq!(
            h.coordinator.state(too_many.transfer_id).await,
            Some(TransferState::Accepted)
        );
    }

    #[tokio::test]
    async fn test_repeated_request_keeps_unopened_transfer() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, ciphertext) = literal_offer(&key, b"keep me");
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;
        h.coordinator.accept(id).await.unwrap();
        h.coordinator.on_start(offer.clone(), 1).await;
        h.coordinator.on_chunk(id, 0, 1, ciphertext).await;
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Completed));

        h.coordinator.on_request(offer).await;
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Completed));
        assert_eq!(h.coordinator.open(id).await.unwrap().bytes, b"keep me");

        let mut requests = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, TransferEvent::IncomingRequest { .. }) {
                requests += 1;
            }
        }
        assert_eq!(requests, 1);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_reacked_not_counted() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, ciphertext) = literal_offer(&key, b"0123456789");
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;
        h.coordinator.accept(id).await.unwrap();
        sent(&mut h.peer_rx).await;
        h.coordinator.on_start(offer, 2).await;

        h.coordinator.on_chunk(id, 0, 2, ciphertext[..5].to_vec()).await;
        h.coordinator.on_chunk(id, 0, 2, ciphertext[..5].to_vec()).await;

        assert_eq!(h.coordinator.progress(id).await.unwrap().chunks_done, 1);
        sent(&mut h.peer_rx).await;
        assert_eq!(
            sent(&mut h.peer_rx).await,
            Message::ChunkAck { transfer_id: id, chunk_index: 0 }
        );
    }

    #[tokio::test]
    async fn test_peer_cancel_drops_later_chunks() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, ciphertext) = literal_offer(&key, b"0123456789");
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;
        h.coordinator.accept(id).await.unwrap();
        sent(&mut h.peer_rx).await;
        h.coordinator.on_start(offer, 2).await;
        h.coordinator.on_chunk(id, 0, 2, ciphertext[..5].to_vec()).await;
        sent(&mut h.peer_rx).await;

        h.coordinator.on_cancel(id).await;
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Cancelled));
        assert_eq!(sent(&mut h.peer_rx).await, Message::TransferCancelAck { transfer_id: id });

        h.coordinator.on_chunk(id, 1, 2, ciphertext[5..].to_vec()).await;
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Cancelled));
        assert!(h.peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeated_request_for_active_transfer_ignored() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, _) = literal_offer(&key, b"x");
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;
        h.coordinator.accept(id).await.unwrap();
        h.coordinator.on_request(offer).await;

        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Accepted));
        assert!(matches!(h.events.recv().await, Some(TransferEvent::IncomingRequest { .. })));
        assert!(matches!(h.events.recv().await, Some(TransferEvent::Accepted(_))));
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_session_key() {
        let mut h = harness(TransferConfig::default());
        let sid = SessionId::new("abc123");
        let key = FileCodec::generate_key().unwrap();
        h.keys.store(sid.clone(), key.clone());

        let (mut offer, ciphertext) = literal_offer(&key, b"secret");
        offer.key = KeyMaterial::Session(sid.clone());
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;
        h.coordinator.accept(id).await.unwrap();
        sent(&mut h.peer_rx).await;
        h.coordinator.on_start(offer, 1).await;
        h.coordinator.on_chunk(id, 0, 1, ciphertext).await;

        assert_eq!(h.coordinator.open(id).await.unwrap().bytes, b"secret");

        h.keys.remove(&sid);
        assert_eq!(
            h.coordinator.open(id).await.unwrap_err(),
            TransferError::MissingKey(sid)
        );
    }

    #[tokio::test]
    async fn test_corrupted_ciphertext_fails_authentication() {
        let mut h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, mut ciphertext) = literal_offer(&key, b"secret");
        ciphertext[0] ^= 0xFF;
        let id = offer.transfer_id;

        h.coordinator.on_request(offer.clone()).await;
        h.coordinator.accept(id).await.unwrap();
        sent(&mut h.peer_rx).await;
        h.coordinator.on_start(offer, 1).await;
        h.coordinator.on_chunk(id, 0, 1, ciphertext).await;

        assert_eq!(
            h.coordinator.open(id).await.unwrap_err(),
            TransferError::AuthenticationFailure
        );
    }

    #[tokio::test]
    async fn test_outbound_insecure_offer_and_reject() {
        let config = TransferConfig {
            secure: false,
            ..TransferConfig::default()
        };
        let mut h = harness(config);

        let id = h
            .coordinator
            .offer(FilePayload::new("a.bin", "application/octet-stream", vec![1; 64]))
            .await
            .unwrap();

        let Message::TransferRequest(offer) = sent(&mut h.peer_rx).await else {
            panic!("expected request");
        };
        assert_eq!(offer.transfer_id, id);
        assert_eq!(offer.size, 80);
        assert!(!offer.is_secure());

        let run = tokio::spawn({
            let coordinator = Arc::clone(&h.coordinator);
            async move { coordinator.run_outbound(id).await }
        });

        h.coordinator.on_rejected(id).await;
        assert_eq!(run.await.unwrap().unwrap(), TransferOutcome::Rejected);
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Rejected));
        assert!(h.peer_rx.try_recv().is_err());
        assert!(h.coordinator.remove(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_outbound_window_and_acks() {
        let config = TransferConfig {
            secure: false,
            chunk_size: 10,
            window_limit: 2,
            ..TransferConfig::default()
        };
        let mut h = harness(config);

        // 34 bytes plaintext -> 50 bytes sealed -> 5 chunks
        let id = h
            .coordinator
            .offer(FilePayload::new("a.bin", "application/octet-stream", vec![7; 34]))
            .await
            .unwrap();
        sent(&mut h.peer_rx).await;

        let run = tokio::spawn({
            let coordinator = Arc::clone(&h.coordinator);
            async move { coordinator.run_outbound(id).await }
        });
        h.coordinator.on_accepted(id).await;

        assert!(matches!(sent(&mut h.peer_rx).await, Message::TransferStart { total_chunks: 5, .. }));
        for expected in 0..2 {
            let Message::TransferChunk { chunk_index, .. } = sent(&mut h.peer_rx).await else {
                panic!("expected chunk");
            };
            assert_eq!(chunk_index, expected);
        }

        // The pump is stalled on the window.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(h.peer_rx.try_recv().is_err());
        assert_eq!(h.coordinator.in_flight(id), Some(2));

        // A stray ack frees nothing.
        h.coordinator.on_chunk_ack(id, 4).await;
        assert_eq!(h.coordinator.in_flight(id), Some(2));

        // Each ack releases exactly one more chunk.
        for index in 0..3 {
            h.coordinator.on_chunk_ack(id, index).await;
            let Message::TransferChunk { chunk_index, .. } = sent(&mut h.peer_rx).await else {
                panic!("expected chunk");
            };
            assert_eq!(chunk_index, index + 2);
            assert!(h.coordinator.in_flight(id).unwrap() <= 2);
        }

        assert_eq!(run.await.unwrap().unwrap(), TransferOutcome::Completed);
        assert_eq!(sent(&mut h.peer_rx).await, Message::TransferComplete { transfer_id: id });
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Completed));
    }

    #[tokio::test]
    async fn test_local_cancel_stops_pump() {
        let config = TransferConfig {
            secure: false,
            chunk_size: 4,
            window_limit: 1,
            ..TransferConfig::default()
        };
        let mut h = harness(config);

        let id = h
            .coordinator
            .offer(FilePayload::new("a.bin", "application/octet-stream", vec![0; 16]))
            .await
            .unwrap();
        sent(&mut h.peer_rx).await;

        let run = tokio::spawn({
            let coordinator = Arc::clone(&h.coordinator);
            async move { coordinator.run_outbound(id).await }
        });
        h.coordinator.on_accepted(id).await;
        sent(&mut h.peer_rx).await;
        assert!(matches!(sent(&mut h.peer_rx).await, Message::TransferChunk { chunk_index: 0, .. }));

        h.coordinator.cancel(id).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), TransferOutcome::Cancelled);
        assert_eq!(sent(&mut h.peer_rx).await, Message::TransferCancel { transfer_id: id });
        assert!(h.peer_rx.try_recv().is_err());

        assert!(matches!(
            h.coordinator.cancel(id).await,
            Err(TransferError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_errors_waiting_sender() {
        let config = TransferConfig {
            secure: false,
            ..TransferConfig::default()
        };
        let mut h = harness(config);

        let id = h
            .coordinator
            .offer(FilePayload::new("a", "text/plain", b"x".to_vec()))
            .await
            .unwrap();
        sent(&mut h.peer_rx).await;

        let run = tokio::spawn({
            let coordinator = Arc::clone(&h.coordinator);
            async move { coordinator.run_outbound(id).await }
        });
        tokio::task::yield_now().await;

        h.coordinator.shutdown();
        assert!(matches!(
            run.await.unwrap(),
            Err(TransferError::ChannelUnavailable(_))
        ));
        assert_eq!(h.coordinator.state(id).await, Some(TransferState::Errored));
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_state() {
        let h = harness(TransferConfig::default());
        let key = FileCodec::generate_key().unwrap();
        let (offer, _) = literal_offer(&key, b"x");
        let id = offer.transfer_id;

        h.coordinator.on_request(offer).await;
        assert_eq!(h.coordinator.active_transfers().await, vec![id]);
        assert!(h.coordinator.remove(id).await.is_err());

        h.coordinator.reject(id).await.unwrap();
        assert!(h.coordinator.active_transfers().await.is_empty());
        h.coordinator.remove(id).await.unwrap();
        assert_eq!(h.coordinator.state(id).await, None);
    }
}
