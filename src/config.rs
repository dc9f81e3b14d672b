//! Engine configuration using Figment.
//!
//! Configuration is loaded from, in increasing priority:
//! 1. built-in defaults
//! 2. `config/mda.toml` (or the file given on the command line)
//! 3. environment variables prefixed with `MDA_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use mda_engine::config::EngineConfig;
//!
//! let config = EngineConfig::load()?;
//! config.validate()?;
//! println!("Sink channel capacity: {}", config.sink.channel_capacity);
//! # Ok::<(), mda_engine::error::AcqError>(())
//! ```

use crate::error::{AcqError, AppResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/mda.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Logging settings
    pub logging: LoggingConfig,
    /// Data sink settings
    pub sink: SinkConfig,
    /// Simulated engine timing
    pub engine: EngineTimingConfig,
    /// Storage and resource checks
    pub storage: StorageConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured output for development
    #[default]
    Pretty,
    /// Single-line output
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Whether to log span open/close events
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            span_events: false,
        }
    }
}

/// Data sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    /// Capacity of the engine output channel, in images
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

/// Timing of the simulated engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineTimingConfig {
    /// How often a paused engine checks for resume or abort, ms
    pub pause_poll_ms: u64,
    /// Longest uninterrupted sleep while waiting for an event's start time, ms
    pub wait_slice_ms: u64,
}

impl Default for EngineTimingConfig {
    fn default() -> Self {
        Self {
            pause_poll_ms: 10,
            wait_slice_ms: 50,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Required free space as a multiple of the acquisition's total memory
    pub disk_space_factor: f64,
    /// Root directory used when a batch entry does not name one
    pub default_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disk_space_factor: 1.25,
            default_root: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `config/mda.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `MDA_`.
    /// Example: `MDA_SINK__CHANNEL_CAPACITY=128`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MDA_").split("__"))
            .extract()
            .map_err(AcqError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(AcqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.sink.channel_capacity == 0 {
            return Err(AcqError::Configuration(
                "sink.channel_capacity must be at least 1".to_string(),
            ));
        }

        if self.engine.pause_poll_ms == 0 || self.engine.wait_slice_ms == 0 {
            return Err(AcqError::Configuration(
                "engine poll intervals must be at least 1 ms".to_string(),
            ));
        }

        let factor = self.storage.disk_space_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(AcqError::Configuration(format!(
                "storage.disk_space_factor must be at least 1.0, got {}",
                factor
            )));
        }

        Ok(())
    }
}
