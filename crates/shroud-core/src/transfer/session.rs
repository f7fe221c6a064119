//! Transfer session state machine.
//!
//! ```text
//! Requested ──▶ Accepted ──▶ Transferring ──▶ Completed
//!     │             │             │
//!     ├──▶ Rejected │             │
//!     └─────────────┴─────────────┴──▶ Cancelled | Errored
//! ```
//!
//! Terminal states never change again.

use crate::error::TransferError;
use crate::ids::TransferId;
use crate::message::TransferOffer;
use crate::telemetry::{QualityThresholds, ThroughputSampler, TransferProgress};
use std::fmt;
use std::ops::Range;
use std::time::{Duration, Instant};

/// Transfer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Offered, awaiting the receiver's decision
    Requested,
    /// Receiver agreed, no chunk moved yet
    Accepted,
    /// Chunks are moving
    Transferring,
    /// All chunks sent (outbound) or reassembled (inbound)
    Completed,
    /// Abandoned by either side
    Cancelled,
    /// Declined by the receiver
    Rejected,
    /// Aborted by a local failure
    Errored,
}

impl TransferState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Rejected | Self::Errored
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Transferring -> Transferring` is allowed as a no-op.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Requested, Accepted | Rejected | Cancelled | Errored)
                | (Accepted, Transferring | Cancelled | Errored)
                | (Transferring, Transferring | Completed | Cancelled | Errored)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "Requested",
            Self::Accepted => "Accepted",
            Self::Transferring => "Transferring",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
            Self::Errored => "Errored",
        };
        f.write_str(name)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sending file
    Outbound,
    /// Receiving file
    Inbound,
}

/// Transfer session
///
/// State, counters and timing for one file transfer. Byte counts are in
/// ciphertext bytes.
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// Metadata and cipher parameters
    pub offer: TransferOffer,
    /// Transfer direction
    pub direction: Direction,

    chunk_size: usize,
    total_chunks: u64,
    state: TransferState,

    chunks_done: u64,
    bytes_done: u64,
    fraction: f64,

    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    sampler: ThroughputSampler,
    failure: Option<String>,
}

impl TransferSession {
    fn new(offer: TransferOffer, direction: Direction, chunk_size: usize, total_chunks: u64) -> Self {
        Self {
            offer,
            direction,
            chunk_size,
            total_chunks,
            state: TransferState::Requested,
            chunks_done: 0,
            bytes_done: 0,
            fraction: 0.0,
            started_at: None,
            completed_at: None,
            sampler: ThroughputSampler::new(),
            failure: None,
        }
    }

    /// Create a send session; the chunk count follows from the offer size.
    #[must_use]
    pub fn new_outbound(offer: TransferOffer, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let total_chunks = offer.size.div_ceil(chunk_size as u64);
        Self::new(offer, Direction::Outbound, chunk_size, total_chunks)
    }

    /// Create a receive session; the chunk count arrives with `TransferStart`.
    #[must_use]
    pub fn new_inbound(offer: TransferOffer) -> Self {
        Self::new(offer, Direction::Inbound, 0, 0)
    }

    /// Transfer ID
    #[must_use]
    pub fn id(&self) -> TransferId {
        self.offer.transfer_id
    }

    /// Get current state
    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Check if the session reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Total number of chunks (zero on an inbound session before start)
    #[must_use]
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Set the chunk count announced by the sender.
    pub fn set_total_chunks(&mut self, total_chunks: u64) {
        self.total_chunks = total_chunks;
    }

    /// Chunks received (inbound) or acknowledged (outbound)
    #[must_use]
    pub fn chunks_done(&self) -> u64 {
        self.chunks_done
    }

    /// Ciphertext bytes received or acknowledged
    #[must_use]
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// Progress fraction (0.0 to 1.0)
    #[must_use]
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Failure reason of an errored session
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Time from start to completion, or to now if still running
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        Some(self.completed_at.unwrap_or_else(Instant::now).saturating_duration_since(start))
    }

    /// Move to `next`.
    ///
    /// Returns `Ok(false)` for the `Transferring -> Transferring` no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidTransition`] and leaves the state
    /// unchanged if the transition is not allowed.
    pub fn transition(&mut self, next: TransferState) -> Result<bool, TransferError> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::InvalidTransition {
                id: self.id(),
                from: self.state,
                to: next,
            });
        }
        if self.state == next {
            return Ok(false);
        }

        tracing::debug!("Transfer {}: {} -> {}", self.id().short(), self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Instant::now());
        }
        Ok(true)
    }

    /// Move to `Errored`, remembering why.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidTransition`] if already terminal.
    pub fn mark_errored(&mut self, reason: impl Into<String>) -> Result<(), TransferError> {
        self.transition(TransferState::Errored)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    /// Record the start timestamp. Later calls are ignored.
    pub fn start(&mut self, now: Instant) {
        self.started_at.get_or_insert(now);
        self.sampler.start(now);
    }

    /// Byte range of chunk `index` within the sealed payload.
    #[must_use]
    pub fn chunk_range(&self, index: u64) -> Range<usize> {
        let size = self.offer.size as usize;
        let start = (index as usize).saturating_mul(self.chunk_size).min(size);
        let end = start.saturating_add(self.chunk_size).min(size);
        start..end
    }

    /// Count a newly stored inbound chunk.
    ///
    /// Progress is `(index + 1) / total`.
    pub fn record_chunk(&mut self, index: u64, len: usize, now: Instant) {
        self.chunks_done += 1;
        self.bytes_done += len as u64;
        if self.total_chunks > 0 {
            self.fraction = ((index + 1) as f64 / self.total_chunks as f64).min(1.0);
        }
        self.sampler.record(self.chunks_done, self.bytes_done, now);
    }

    /// Count an acknowledged outbound chunk.
    pub fn record_ack(&mut self, index: u64, now: Instant) {
        self.chunks_done += 1;
        self.bytes_done += self.chunk_range(index).len() as u64;
        if self.total_chunks > 0 {
            self.fraction = (self.chunks_done as f64 / self.total_chunks as f64).min(1.0);
        }
        self.sampler.record(self.chunks_done, self.bytes_done, now);
    }

    /// Snapshot progress and telemetry.
    #[must_use]
    pub fn progress(&self, thresholds: &QualityThresholds) -> TransferProgress {
        let latest = self.sampler.latest();
        let remaining = self.offer.size.saturating_sub(self.bytes_done);

        TransferProgress {
            transfer_id: self.id(),
            direction: self.direction,
            state: self.state,
            bytes_done: self.bytes_done,
            bytes_total: self.offer.size,
            chunks_done: self.chunks_done,
            chunks_total: self.total_chunks,
            fraction: self.fraction,
            rate: latest.map(|s| s.bytes_per_sec),
            eta: self.sampler.eta(remaining),
            quality: latest.map(|s| thresholds.classify(s.bytes_per_sec)),
        }
    }
}
