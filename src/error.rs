//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `AcqError`, used across the crate.
//! Variants are grouped by where they arise so that callers (and the user interface)
//! can decide how to react:
//!
//! - **Configuration**: the requested acquisition cannot be expressed (zero z-step,
//!   unsupported order, mismatched position lists, custom intervals). Fail fast,
//!   before any hardware is touched.
//! - **Resource**: the save location is missing or full. Recoverable: the user can
//!   fix the problem and try again.
//! - **Hardware / runtime**: the core or the engine refused an operation mid-run.
//! - **Per-image**: a single image could not be routed or stored. The run continues.
//! - **Resource exhaustion**: out of memory while converting images. Fatal for the run.
//!
//! Hook failures use the separate [`HookError`](crate::acquisition::hooks::HookError)
//! type and never propagate out of the dispatcher.

use crate::acquisition::settings::AcqOrderMode;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AcqError>;

/// Coarse classification of [`AcqError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid or unsupported acquisition settings.
    Configuration,
    /// Missing, unwritable or full save location, or a user cancellation.
    Resource,
    /// Hardware core or acquisition engine failure.
    Hardware,
    /// A single image could not be routed or stored.
    PerImage,
    /// Memory exhausted while handling image data.
    ResourceExhaustion,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Hardware => write!(f, "hardware"),
            ErrorCategory::PerImage => write!(f, "per-image"),
            ErrorCategory::ResourceExhaustion => write!(f, "resource exhaustion"),
        }
    }
}

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Configuration file error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Z step size is zero")]
    ZeroZStep,

    #[error("Acquisition order '{0}' is not supported by this engine")]
    UnsupportedOrder(AcqOrderMode),

    #[error("Expected {expected} position lists (one per sub-acquisition), got {actual}")]
    PositionListMismatch { expected: usize, actual: usize },

    #[error("No sub-acquisitions were supplied")]
    NoSubAcquisitions,

    #[error("Custom time intervals are not supported (sub-acquisition {0})")]
    CustomIntervalsUnsupported(usize),

    #[error("Event rejected on axis '{axis}': {reason}")]
    MonitorRejected { axis: String, reason: String },

    #[error("Unable to save data to {}", .0.display())]
    UnwritableDirectory(PathBuf),

    #[error("Not enough space on disk: {required} bytes required, {available} bytes available")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("Acquisition canceled")]
    Cancelled,

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Acquisition engine error: {0}")]
    Engine(String),

    #[error("Invalid driver state: {0}")]
    InvalidState(String),

    #[error("Acquisitions cannot be run on the user interface thread")]
    CalledOnUiThread,

    #[error("Image does not carry a sub-acquisition tag")]
    MissingRoutingTag,

    #[error("Image tagged for sub-acquisition {index}, but only {known} are known")]
    UnknownSubAcquisition { index: usize, known: usize },

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AcqError {
    /// Taxonomy bucket for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AcqError::Config(_)
            | AcqError::Configuration(_)
            | AcqError::ZeroZStep
            | AcqError::UnsupportedOrder(_)
            | AcqError::PositionListMismatch { .. }
            | AcqError::NoSubAcquisitions
            | AcqError::CustomIntervalsUnsupported(_)
            | AcqError::MonitorRejected { .. }
            | AcqError::Toml(_)
            | AcqError::Json(_) => ErrorCategory::Configuration,
            AcqError::UnwritableDirectory(_)
            | AcqError::InsufficientDiskSpace { .. }
            | AcqError::Cancelled
            | AcqError::Io(_) => ErrorCategory::Resource,
            AcqError::Hardware(_)
            | AcqError::Engine(_)
            | AcqError::InvalidState(_)
            | AcqError::CalledOnUiThread => ErrorCategory::Hardware,
            AcqError::MissingRoutingTag
            | AcqError::UnknownSubAcquisition { .. }
            | AcqError::Pipeline(_) => ErrorCategory::PerImage,
            AcqError::OutOfMemory(_) => ErrorCategory::ResourceExhaustion,
        }
    }

    /// Whether the user can reasonably fix the cause and start again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Resource | ErrorCategory::PerImage
        ) || matches!(self, AcqError::InvalidState(_))
    }
}
