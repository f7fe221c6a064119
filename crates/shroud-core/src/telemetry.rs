//! Throughput sampling, ETA estimation and connection quality.
//!
//! Samples are cumulative: `bytes_done / elapsed` since the transfer
//! started. The first [`WARMUP_CHUNKS`] chunks always resample so an early
//! estimate exists; after that a new sample is taken only once more than
//! [`RESAMPLE_INTERVAL`] has passed since the previous one.
//!
//! All functions take explicit [`Instant`]s.

use crate::ids::TransferId;
use crate::transfer::{Direction, TransferState};
use std::fmt;
use std::time::{Duration, Instant};

/// Chunks that always trigger a resample.
pub const WARMUP_CHUNKS: u64 = 3;

/// Minimum spacing between samples after warm-up.
pub const RESAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One throughput measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    /// Average rate since start, bytes per second
    pub bytes_per_sec: f64,
    /// When the sample was taken
    pub taken_at: Instant,
}

/// Per-transfer throughput sampler
#[derive(Debug, Clone, Default)]
pub struct ThroughputSampler {
    started_at: Option<Instant>,
    latest: Option<ThroughputSample>,
}

impl ThroughputSampler {
    /// Create an idle sampler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the transfer start. Later calls are ignored.
    pub fn start(&mut self, at: Instant) {
        self.started_at.get_or_insert(at);
    }

    /// Record progress, resampling when due.
    ///
    /// Returns the new sample if one was taken.
    pub fn record(
        &mut self,
        chunks_done: u64,
        bytes_done: u64,
        now: Instant,
    ) -> Option<ThroughputSample> {
        let started = self.started_at?;

        let due = chunks_done <= WARMUP_CHUNKS
            || self
                .latest
                .is_none_or(|last| now.saturating_duration_since(last.taken_at) > RESAMPLE_INTERVAL);
        if !due {
            return None;
        }

        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let sample = ThroughputSample {
            bytes_per_sec: bytes_done as f64 / elapsed,
            taken_at: now,
        };
        self.latest = Some(sample);
        Some(sample)
    }

    /// Most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<ThroughputSample> {
        self.latest
    }

    /// Estimated time to move `remaining_bytes` at the latest rate.
    ///
    /// `None` until a non-zero sample exists.
    #[must_use]
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let rate = self.latest?.bytes_per_sec;
        if rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(remaining_bytes as f64 / rate).ok()
    }
}

/// Coarse connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    /// At or above the good threshold
    Good,
    /// At or above the fair threshold
    Fair,
    /// Below the fair threshold
    Poor,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
        }
    }
}

/// Rate thresholds for [`ConnectionQuality`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    /// Minimum rate classified as good (bytes/sec)
    pub good_bytes_per_sec: f64,
    /// Minimum rate classified as fair (bytes/sec)
    pub fair_bytes_per_sec: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            good_bytes_per_sec: 1024.0 * 1024.0,
            fair_bytes_per_sec: 128.0 * 1024.0,
        }
    }
}

impl QualityThresholds {
    /// Classify a rate.
    #[must_use]
    pub fn classify(&self, bytes_per_sec: f64) -> ConnectionQuality {
        if bytes_per_sec >= self.good_bytes_per_sec {
            ConnectionQuality::Good
        } else if bytes_per_sec >= self.fair_bytes_per_sec {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }
}

/// Snapshot of one transfer's progress
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Transfer ID
    pub transfer_id: TransferId,

    /// Which side of the transfer this is
    pub direction: Direction,

    /// Current state
    pub state: TransferState,

    /// Ciphertext bytes moved so far
    pub bytes_done: u64,

    /// Total ciphertext bytes
    pub bytes_total: u64,

    /// Chunks received (inbound) or acknowledged (outbound)
    pub chunks_done: u64,

    /// Total number of chunks, zero before the transfer starts
    pub chunks_total: u64,

    /// Progress fraction (0.0 to 1.0)
    pub fraction: f64,

    /// Latest sampled rate in bytes/second
    pub rate: Option<f64>,

    /// Estimated time remaining
    pub eta: Option<Duration>,

    /// Quality derived from the latest sample
    pub quality: Option<ConnectionQuality>,
}

impl TransferProgress {
    /// Check if transfer is complete
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == TransferState::Completed
    }

    /// Get human-readable ETA string
    #[must_use]
    pub fn eta_string(&self) -> String {
        match self.eta {
            Some(duration) => {
                let seconds = duration.as_secs();
                if seconds < 60 {
                    format!("{seconds}s")
                } else if seconds < 3600 {
                    format!("{}m {}s", seconds / 60, seconds % 60)
                } else {
                    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
                }
            }
            None if self.is_complete() => "Complete".to_string(),
            None => "Calculating...".to_string(),
        }
    }

    /// Get human-readable speed string
    #[must_use]
    pub fn speed_string(&self) -> String {
        let Some(rate) = self.rate else {
            return "-".to_string();
        };

        if rate < 1024.0 {
            format!("{rate:.2} B/s")
        } else if rate < 1024.0 * 1024.0 {
            format!("{:.2} KiB/s", rate / 1024.0)
        } else if rate < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MiB/s", rate / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GiB/s", rate / (1024.0 * 1024.0 * 1024.0))
        }
    }
}
