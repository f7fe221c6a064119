//! Configuration system for the SHROUD CLI.

use serde::{Deserialize, Serialize};
use shroud_core::config::{DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW_LIMIT};
use shroud_core::{QualityThresholds, TransferConfig as EngineConfig};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// SHROUD configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Connection quality thresholds
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Address `shroud receive` listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Unacknowledged chunks allowed per transfer
    #[serde(default = "default_window_limit")]
    pub window_limit: usize,
    /// Negotiate a session key before sending
    #[serde(default = "default_true")]
    pub secure: bool,
    /// Where received files are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Accept incoming transfers without prompting
    #[serde(default)]
    pub auto_accept: bool,
}

/// Connection quality thresholds in bytes per second
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// At or above: good
    #[serde(default = "default_good_rate")]
    pub good_bytes_per_sec: f64,
    /// At or above: fair
    #[serde(default = "default_fair_rate")]
    pub fair_bytes_per_sec: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:7878".to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_window_limit() -> usize {
    DEFAULT_WINDOW_LIMIT
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_good_rate() -> f64 {
    QualityThresholds::default().good_bytes_per_sec
}

fn default_fair_rate() -> f64 {
    QualityThresholds::default().fair_bytes_per_sec
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            window_limit: default_window_limit(),
            secure: true,
            output_dir: default_output_dir(),
            auto_accept: false,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            good_bytes_per_sec: default_good_rate(),
            fair_bytes_per_sec: default_fair_rate(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("shroud/config.toml")
    }

    /// Load config from `path`, falling back to defaults when it does not
    /// exist. Nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Engine settings derived from this file
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            chunk_size: self.transfer.chunk_size,
            window_limit: self.transfer.window_limit,
            secure: self.transfer.secure,
            quality: QualityThresholds {
                good_bytes_per_sec: self.telemetry.good_bytes_per_sec,
                fair_bytes_per_sec: self.telemetry.fair_bytes_per_sec,
            },
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.engine_config().validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_addr, "0.0.0.0:7878");
        assert_eq!(config.transfer.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.transfer.window_limit, 30);
        assert!(config.transfer.secure);
        assert!(!config.transfer.auto_accept);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        config.transfer.chunk_size = 1024;
        config.network.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());

        config.network.listen_addr = "127.0.0.1:9000".to_string();
        config.telemetry.fair_bytes_per_sec = config.telemetry.good_bytes_per_sec * 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transfer]
            window_limit = 8
            auto_accept = true
            "#,
        )
        .unwrap();

        assert_eq!(config.transfer.window_limit, 8);
        assert!(config.transfer.auto_accept);
        assert_eq!(config.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.transfer.secure = false;
        config.transfer.output_dir = PathBuf::from("/srv/incoming");
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
        assert_eq!(Config::load_or_default(&path).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");

        assert_eq!(Config::load_or_default(&path).unwrap(), Config::default());
        assert!(!path.exists());
    }

    #[test]
    fn test_engine_config_conversion() {
        let mut config = Config::default();
        config.transfer.chunk_size = 4096;
        config.telemetry.good_bytes_per_sec = 10.0;
        config.telemetry.fair_bytes_per_sec = 5.0;

        let engine = config.engine_config();
        assert_eq!(engine.chunk_size, 4096);
        assert_eq!(engine.window_limit, 30);
        assert!(engine.secure);
        assert_eq!(engine.quality.good_bytes_per_sec, 10.0);
        assert_eq!(engine.quality.fair_bytes_per_sec, 5.0);
    }
}
