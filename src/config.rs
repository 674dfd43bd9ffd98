//! Configuration management
//!
//! TOML configuration with serde defaults for every field and environment
//! variable overrides:
//!
//! | Variable | Field |
//! |---|---|
//! | `PVS_CHUNK_SIZE` | `store.chunk_size` |
//! | `PVS_WRITER_THREADS` | `writer.num_workers` |
//! | `PVS_QUEUE_CAPACITY` | `writer.queue_capacity` |
//! | `RUST_LOG` | `monitoring.log_level` |

use crate::error::{Error, Result, ValidationError};
use crate::ingestion::WriterConfig;
use crate::services::purge::PurgeConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Read path settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Asynchronous write path (omit to disable async writes)
    #[serde(default)]
    pub writer: Option<WriterConfig>,

    /// Purge scheduling
    #[serde(default)]
    pub purge: PurgeConfig,

    /// Logging
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Read path configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Values per backend round trip (`None` uses the backend's preference)
    #[serde(default)]
    pub chunk_size: Option<usize>,

    /// Lower bound of the per-point chunk size in combined queries
    #[serde(default = "default_min_combined_chunk_size")]
    pub min_combined_chunk_size: usize,
}

/// Monitoring configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log filter (error, warn, info, debug, trace, or an `EnvFilter` directive)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

// Default value functions
fn default_min_combined_chunk_size() -> usize { 10 }
fn default_log_level() -> String { "info".to_string() }

/// Largest accepted chunk size
pub const MAX_CHUNK_SIZE: usize = 1_000_000;

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            min_combined_chunk_size: default_min_combined_chunk_size(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment variable overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(chunk_size) = env_parse("PVS_CHUNK_SIZE") {
            self.store.chunk_size = Some(chunk_size);
        }
        if let Some(workers) = env_parse("PVS_WRITER_THREADS") {
            self.writer.get_or_insert_with(WriterConfig::default).num_workers = workers;
        }
        if let Some(capacity) = env_parse("PVS_QUEUE_CAPACITY") {
            self.writer.get_or_insert_with(WriterConfig::default).queue_capacity = capacity;
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(chunk_size) = self.store.chunk_size {
            if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
                return Err(out_of_range("store.chunk_size", chunk_size, 1, MAX_CHUNK_SIZE).into());
            }
        }
        if self.store.min_combined_chunk_size == 0 {
            return Err(out_of_range(
                "store.min_combined_chunk_size",
                0,
                1,
                MAX_CHUNK_SIZE,
            )
            .into());
        }

        if let Some(writer) = &self.writer {
            writer.validate().map_err(|message| ValidationError::InvalidFormat {
                field: "writer".to_string(),
                message,
            })?;
        }

        if self.purge.enabled && self.purge.interval_secs == 0 {
            return Err(out_of_range("purge.interval_secs", 0, 1, u64::MAX).into());
        }
        if let Some(period) = self.purge.default_period {
            if period.count == 0 {
                return Err(ValidationError::InvalidFormat {
                    field: "purge.default_period".to_string(),
                    message: "period must be at least one unit".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn out_of_range(
    field: &str,
    value: impl ToString,
    min: impl ToString,
    max: impl ToString,
) -> ValidationError {
    ValidationError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        min: min.to_string(),
        max: max.to_string(),
    }
}
