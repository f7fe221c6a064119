//! Transfer engine configuration.

use crate::telemetry::QualityThresholds;
use thiserror::Error;

/// Default chunk size (2 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Largest accepted chunk size (16 MiB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default number of unacknowledged chunks per outbound transfer
pub const DEFAULT_WINDOW_LIMIT: usize = 30;

/// Largest accepted window limit
pub const MAX_WINDOW_LIMIT: usize = 1024;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Chunk size outside 1 B..=16 MiB
    #[error("chunk size {0} out of range (1..={MAX_CHUNK_SIZE})")]
    ChunkSize(usize),

    /// Window limit outside 1..=1024
    #[error("window limit {0} out of range (1..={MAX_WINDOW_LIMIT})")]
    WindowLimit(usize),

    /// Quality thresholds not ordered `good >= fair >= 0`
    #[error("quality thresholds must satisfy good >= fair >= 0 (good {good}, fair {fair})")]
    Thresholds {
        /// Good threshold
        good: f64,
        /// Fair threshold
        fair: f64,
    },
}

/// Transfer engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Ciphertext bytes per chunk
    pub chunk_size: usize,

    /// Maximum chunks in flight per outbound transfer
    pub window_limit: usize,

    /// Attempt a key exchange before each transfer
    pub secure: bool,

    /// Connection quality classification
    pub quality: QualityThresholds,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_limit: DEFAULT_WINDOW_LIMIT,
            secure: true,
            quality: QualityThresholds::default(),
        }
    }
}

impl TransferConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.window_limit == 0 || self.window_limit > MAX_WINDOW_LIMIT {
            return Err(ConfigError::WindowLimit(self.window_limit));
        }

        let QualityThresholds {
            good_bytes_per_sec: good,
            fair_bytes_per_sec: fair,
        } = self.quality;
        if !(fair >= 0.0 && good >= fair) {
            return Err(ConfigError::Thresholds { good, fair });
        }

        Ok(())
    }

    /// Number of chunks needed for `size` ciphertext bytes.
    #[must_use]
    pub fn total_chunks(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size as u64)
    }
}
