//! Error types for the SHROUD transfer engine.

use crate::ids::{SessionId, TransferId};
use crate::transfer::TransferState;
use shroud_crypto::CryptoError;
use shroud_transport::ChannelError;
use thiserror::Error;

/// Top-level engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Wire message error
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Key exchange error
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Transfer error
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Frame encoding and decoding errors.
///
/// A frame that fails to decode is logged and dropped; it never tears down
/// the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Serialization failed
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// Frame is not a valid message
    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Key exchange errors.
///
/// These are recovered locally: a failed handshake makes the sender fall
/// back to a literal key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Shared secret could not be derived
    #[error("key derivation failed: {0}")]
    Derivation(#[source] CryptoError),

    /// Peer public key is malformed
    #[error("invalid peer public key")]
    InvalidPublicKey,

    /// Handshake message could not be sent
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Connection closed before the handshake completed
    #[error("connection closed during handshake")]
    Closed,
}

/// Transfer errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// No key is stored for the referenced session
    #[error("no key for session {0}")]
    MissingKey(SessionId),

    /// Ciphertext failed authentication
    #[error("authentication failure: ciphertext rejected")]
    AuthenticationFailure,

    /// Message could not be handed to the channel
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Unknown transfer id
    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    /// Illegal state change
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Transfer id
        id: TransferId,
        /// Current state
        from: TransferState,
        /// Requested state
        to: TransferState,
    },

    /// Operation needs a state the transfer has not reached
    #[error("transfer {0} is not ready")]
    NotReady(TransferId),

    /// Cryptographic failure other than authentication
    #[error("crypto error: {0}")]
    Crypto(#[source] CryptoError),
}

impl From<CryptoError> for TransferError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => Self::AuthenticationFailure,
            other => Self::Crypto(other),
        }
    }
}

impl TransferError {
    /// Whether this error ends the transfer for good.
    ///
    /// Lookup and sequencing errors leave the transfer untouched.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingKey(_)
                | Self::AuthenticationFailure
                | Self::ChannelUnavailable(_)
                | Self::Crypto(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_failure_maps_to_authentication() {
        assert_eq!(
            TransferError::from(CryptoError::DecryptionFailed),
            TransferError::AuthenticationFailure
        );
        assert_eq!(
            TransferError::from(CryptoError::RandomFailed),
            TransferError::Crypto(CryptoError::RandomFailed)
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TransferError::AuthenticationFailure.is_fatal());
        assert!(TransferError::MissingKey(SessionId::new("abc123")).is_fatal());
        assert!(!TransferError::NotFound(TransferId::from_bytes([0; 16])).is_fatal());
        assert!(!TransferError::NotReady(TransferId::from_bytes([0; 16])).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = TransferError::MissingKey(SessionId::new("abc123"));
        assert_eq!(err.to_string(), "no key for session abc123");

        let err = TransferError::InvalidTransition {
            id: TransferId::from_bytes([0xab; 16]),
            from: TransferState::Completed,
            to: TransferState::Transferring,
        };
        assert!(err.to_string().contains("Completed -> Transferring"));

        let err: Error = HandshakeError::Closed.into();
        assert_eq!(
            err.to_string(),
            "handshake error: connection closed during handshake"
        );
    }
}
