//! File transfer layer.
//!
//! Per-transfer state machine, receiver-side reassembly and sender-side
//! flow control. [`crate::coordinator::TransferCoordinator`] drives these.

pub mod reassembly;
pub mod session;
pub mod window;

pub use reassembly::{ChunkInsert, ReassemblyBuffer};
pub use session::{Direction, TransferSession, TransferState};
pub use window::{ChunkWindow, WindowClosed};
