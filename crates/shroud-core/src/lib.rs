//! # SHROUD Core
//!
//! Transfer engine for SHROUD, a secure chunked peer-to-peer file transfer
//! protocol.
//!
//! This crate provides:
//! - Per-session X25519 key exchange with a literal-key fallback
//! - Whole-file `ChaCha20-Poly1305` sealing
//! - Chunked streaming with a bounded in-flight window
//! - Receiver-side reassembly and explicit accept/reject/cancel
//! - Throughput, ETA and connection quality telemetry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Connection                                │
//! │   (one channel: frame decode, exhaustive dispatch, teardown)     │
//! ├────────────────────────────┬────────────────────────────────────┤
//! │     TransferCoordinator     │           KeyExchange              │
//! │  (offers, window, chunks)   │   (Init / Reply / Complete)        │
//! ├────────────────────────────┴────────────────────────────────────┤
//! │                  SessionKeyStore  +  FileCodec                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod handshake;
pub mod ids;
pub mod keystore;
pub mod message;
mod outbox;
pub mod payload;
pub mod telemetry;
pub mod transfer;

pub use config::{ConfigError, TransferConfig};
pub use connection::Connection;
pub use coordinator::{TransferCoordinator, TransferEvent, TransferOutcome};
pub use error::{Error, HandshakeError, MessageError, Result, TransferError};
pub use handshake::KeyExchange;
pub use ids::{SessionId, TransferId};
pub use keystore::SessionKeyStore;
pub use message::{KeyMaterial, Message, TransferOffer};
pub use payload::FilePayload;
pub use telemetry::{ConnectionQuality, QualityThresholds, TransferProgress};
pub use transfer::{Direction, TransferSession, TransferState};
