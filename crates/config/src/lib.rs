//! Environment/file-driven defaults for the shared-memory primitive family.
//!
//! The core crate never reads the environment itself: segment naming and
//! sizing stay a caller/orchestration concern. This crate exists so that
//! caller is something other than a pile of magic numbers: defaults for
//! vector capacity, counter-set size, and log formatting, loadable from
//! the environment or a TOML file, validated once at construction time.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default capacity used when a caller doesn't supply their own.
pub const DEFAULT_VECTOR_CAPACITY: usize = 1024;

/// Default counter-set size.
pub const DEFAULT_COUNTER_SET_SIZE: usize = 1024;

/// Upper bound on counter-set size; larger sizes risk overflowing the
/// segment byte-size computation on 32-bit targets.
pub const MAX_COUNTER_SET_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Root configuration for the family: one struct, loadable from env or a
/// TOML file, validated before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Default vector capacity handed to `SharedVector::create_or_open`
    /// when a caller doesn't specify one.
    pub vector_capacity: usize,

    /// Default counter-set size.
    pub counter_set_size: usize,

    /// Log level consumed by `shmutils-telemetry`'s subscriber init.
    pub log_level: String,

    /// Log formatting consumed by `shmutils-telemetry`'s subscriber init.
    pub log_format: LogFormat,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            vector_capacity: DEFAULT_VECTOR_CAPACITY,
            counter_set_size: DEFAULT_COUNTER_SET_SIZE,
            log_level: "info".to_string(),
            log_format: LogFormat::Plain,
        }
    }
}

impl ShmConfig {
    /// Load from environment variables, falling back to defaults for
    /// anything unset: `SHMUTILS_VECTOR_CAPACITY`, `SHMUTILS_COUNTER_SET_SIZE`,
    /// `SHMUTILS_LOG_LEVEL`, `SHMUTILS_LOG_FORMAT` (`plain` | `json`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SHMUTILS_VECTOR_CAPACITY") {
            config.vector_capacity = v
                .parse()
                .map_err(|_| ConfigError::Parse(format!("SHMUTILS_VECTOR_CAPACITY: {v:?}")))?;
        }
        if let Ok(v) = std::env::var("SHMUTILS_COUNTER_SET_SIZE") {
            config.counter_set_size = v
                .parse()
                .map_err(|_| ConfigError::Parse(format!("SHMUTILS_COUNTER_SET_SIZE: {v:?}")))?;
        }
        if let Ok(v) = std::env::var("SHMUTILS_LOG_LEVEL") {
            config.log_level = v;
        }
        if let Ok(v) = std::env::var("SHMUTILS_LOG_FORMAT") {
            config.log_format = match v.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, following the same validate-after-build
    /// pattern as `from_env`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: ShmConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would cause the core layer grief later:
    /// a zero counter-set size would make `counter_create` always fail,
    /// and an oversized capacity can overflow the segment byte-size math.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.counter_set_size == 0 {
            return Err(ConfigError::Validation(
                "counter_set_size must be non-zero".to_string(),
            ));
        }
        if self.counter_set_size > MAX_COUNTER_SET_SIZE {
            return Err(ConfigError::Validation(format!(
                "counter_set_size must not exceed {MAX_COUNTER_SET_SIZE}"
            )));
        }
        if self.vector_capacity == 0 {
            return Err(ConfigError::Validation(
                "vector_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),
}
