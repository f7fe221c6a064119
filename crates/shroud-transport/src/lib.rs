//! # SHROUD Transport
//!
//! Message channels for the SHROUD transfer engine.
//!
//! A channel delivers whole frames reliably and in order between exactly two
//! endpoints. Outbound frames go through [`Channel::send`]; inbound traffic
//! arrives as a stream of [`ChannelEvent`]s on a `tokio::sync::mpsc`
//! receiver handed out when the channel is created.
//!
//! This crate provides:
//! - The [`Channel`] trait and its event/error types
//! - [`MemoryChannel`], an in-process duplex pair for tests and loopback
//! - [`TcpChannel`], length-prefixed frames over a TCP stream

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod memory;
pub mod tcp;

pub use channel::{Channel, ChannelError, ChannelEvent, ChannelResult, ChannelStats};
pub use memory::MemoryChannel;
pub use tcp::TcpChannel;

/// Default capacity of a channel's inbound event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
