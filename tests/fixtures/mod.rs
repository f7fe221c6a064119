//! Test fixtures.

mod raw_peer;
mod two_peer;

pub use raw_peer::RawPeer;
pub use two_peer::{TwoPeerFixture, next_event};
