//! Sender-side flow control.
//!
//! A [`ChunkWindow`] holds one semaphore permit per chunk that may be in
//! flight. The pump takes a permit before sending a chunk and the permit
//! comes back only when that chunk's index is acknowledged. Closing the
//! window wakes a pump blocked on [`ChunkWindow::acquire`].

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Semaphore;

/// The window was closed while waiting for capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("chunk window closed")]
pub struct WindowClosed;

/// Bounded set of unacknowledged chunk indices
#[derive(Debug)]
pub struct ChunkWindow {
    limit: usize,
    permits: Semaphore,
    outstanding: Mutex<HashSet<u64>>,
}

impl ChunkWindow {
    /// Create a window allowing `limit` chunks in flight.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            permits: Semaphore::new(limit),
            outstanding: Mutex::new(HashSet::with_capacity(limit)),
        }
    }

    /// Configured limit
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for room for one more chunk.
    ///
    /// # Errors
    ///
    /// Returns [`WindowClosed`] once [`close`](Self::close) has been called.
    pub async fn acquire(&self) -> Result<(), WindowClosed> {
        let permit = self.permits.acquire().await.map_err(|_| WindowClosed)?;
        permit.forget();
        Ok(())
    }

    /// Record that chunk `index` is in flight. Call after [`acquire`](Self::acquire).
    pub fn mark_sent(&self, index: u64) {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index);
    }

    /// Release the slot held by chunk `index`.
    ///
    /// Returns `false` (and releases nothing) if the index is not in flight.
    pub fn ack(&self, index: u64) -> bool {
        let removed = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
        if removed {
            self.permits.add_permits(1);
        }
        removed
    }

    /// Number of chunks sent but not acknowledged
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop handing out capacity.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether the window has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
