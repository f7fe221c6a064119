//! Wire messages.
//!
//! Every frame on a channel is one bincode-encoded [`Message`]. The enum is
//! closed: a frame that does not decode to one of these variants is dropped.

use crate::error::MessageError;
use crate::ids::{SessionId, TransferId};
use serde::{Deserialize, Serialize};
use shroud_crypto::{AeadKey, CHACHA_NONCE_SIZE, Nonce};
use std::fmt;

/// How the receiver obtains the file key.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyMaterial {
    /// Fallback mode: the key itself travels with the request.
    Literal([u8; 32]),
    /// Secure mode: the key was negotiated under this session.
    Session(SessionId),
}

impl KeyMaterial {
    /// Whether the key was negotiated rather than transmitted.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Session(_))
    }

    /// Literal key, if this is fallback mode.
    #[must_use]
    pub fn literal_key(&self) -> Option<AeadKey> {
        match self {
            Self::Literal(bytes) => Some(AeadKey::new(*bytes)),
            Self::Session(_) => None,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(_) => f.write_str("Literal(..)"),
            Self::Session(id) => write!(f, "Session({id})"),
        }
    }
}

/// File metadata and cipher parameters announced by the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferOffer {
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Suggested file name
    pub name: String,
    /// Ciphertext size in bytes (plaintext + 16-byte tag)
    pub size: u64,
    /// MIME type of the plaintext
    pub mime_type: String,
    /// Literal key or session reference
    pub key: KeyMaterial,
    /// Nonce the payload was sealed with
    pub nonce: [u8; CHACHA_NONCE_SIZE],
}

impl TransferOffer {
    /// Whether the file key was negotiated.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.key.is_secure()
    }

    /// Nonce as a codec value.
    #[must_use]
    pub fn nonce(&self) -> Nonce {
        Nonce::from_bytes(self.nonce)
    }
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    /// Initiator's public key for a new session
    KeyExchangeInit {
        /// Session being negotiated
        session_id: SessionId,
        /// Initiator's X25519 public key
        public_key: Vec<u8>,
    },

    /// Responder's public key; the responder has already stored its key
    KeyExchangeReply {
        /// Session being negotiated
        session_id: SessionId,
        /// Responder's X25519 public key
        public_key: Vec<u8>,
    },

    /// Initiator has stored its key (informational)
    KeyExchangeComplete {
        /// Negotiated session
        session_id: SessionId,
    },

    /// Sender proposes a file
    TransferRequest(TransferOffer),

    /// Receiver accepts a proposed file
    TransferAccepted {
        /// Transfer identifier
        transfer_id: TransferId,
    },

    /// Receiver declines a proposed file
    TransferRejected {
        /// Transfer identifier
        transfer_id: TransferId,
    },

    /// Sender is about to stream chunks
    TransferStart {
        /// Same metadata as the request
        offer: TransferOffer,
        /// Number of chunks that will follow
        total_chunks: u64,
    },

    /// One slice of the ciphertext
    TransferChunk {
        /// Transfer identifier
        transfer_id: TransferId,
        /// Zero-based chunk index
        chunk_index: u64,
        /// Number of chunks in the transfer
        total_chunks: u64,
        /// Chunk bytes
        bytes: Vec<u8>,
    },

    /// Receiver stored a chunk
    ChunkAck {
        /// Transfer identifier
        transfer_id: TransferId,
        /// Acknowledged chunk index
        chunk_index: u64,
    },

    /// Sender handed the last chunk to the channel
    TransferComplete {
        /// Transfer identifier
        transfer_id: TransferId,
    },

    /// Either side abandons the transfer
    TransferCancel {
        /// Transfer identifier
        transfer_id: TransferId,
    },

    /// Cancellation was applied
    TransferCancelAck {
        /// Transfer identifier
        transfer_id: TransferId,
    },
}

impl Message {
    /// Serialize message to bytes
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(|e| MessageError::Encode(e.to_string()))
    }

    /// Deserialize message from bytes
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Decode`] if the frame is not a valid message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(bytes).map_err(|e| MessageError::Decode(e.to_string()))
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::KeyExchangeInit { .. } => "KeyExchangeInit",
            Self::KeyExchangeReply { .. } => "KeyExchangeReply",
            Self::KeyExchangeComplete { .. } => "KeyExchangeComplete",
            Self::TransferRequest(_) => "TransferRequest",
            Self::TransferAccepted { .. } => "TransferAccepted",
            Self::TransferRejected { .. } => "TransferRejected",
            Self::TransferStart { .. } => "TransferStart",
            Self::TransferChunk { .. } => "TransferChunk",
            Self::ChunkAck { .. } => "ChunkAck",
            Self::TransferComplete { .. } => "TransferComplete",
            Self::TransferCancel { .. } => "TransferCancel",
            Self::TransferCancelAck { .. } => "TransferCancelAck",
        }
    }

    /// Transfer this message belongs to, if any.
    #[must_use]
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Self::KeyExchangeInit { .. }
            | Self::KeyExchangeReply { .. }
            | Self::KeyExchangeComplete { .. } => None,
            Self::TransferRequest(offer) | Self::TransferStart { offer, .. } => {
                Some(offer.transfer_id)
            }
            Self::TransferAccepted { transfer_id }
            | Self::TransferRejected { transfer_id }
            | Self::TransferChunk { transfer_id, .. }
            | Self::ChunkAck { transfer_id, .. }
            | Self::TransferComplete { transfer_id }
            | Self::TransferCancel { transfer_id }
            | Self::TransferCancelAck { transfer_id } => Some(*transfer_id),
        }
    }
}
