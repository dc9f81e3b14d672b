//! Hardware abstraction.
//!
//! The acquisition engine talks to the microscope through [`MicroscopeCore`]
//! (focus and XY stages, channel presets, camera) and, optionally, through an
//! [`AutofocusManager`]. Calls are blocking: hooks run synchronously on the
//! engine's execution context and call straight into the core.
//!
//! Simulated implementations live in [`mock`].

pub mod mock;

use crate::error::AppResult;
use serde::{Deserialize, Serialize};

/// Camera image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageGeometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel (1 or 2).
    pub bytes_per_pixel: u32,
}

impl ImageGeometry {
    /// Geometry of a `width` × `height` camera with the given depth.
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
        }
    }

    /// Number of pixels per image.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Size of one image in bytes.
    pub fn bytes_per_image(&self) -> u64 {
        self.pixel_count().saturating_mul(u64::from(self.bytes_per_pixel))
    }
}

/// Native microscope core.
pub trait MicroscopeCore: Send + Sync {
    /// Name of the focus drive, if one is configured.
    fn focus_device(&self) -> Option<String>;

    /// Position of a single-axis stage, µm.
    fn position(&self, device: &str) -> AppResult<f64>;

    /// Move a single-axis stage, µm.
    fn set_position(&self, device: &str, position_um: f64) -> AppResult<()>;

    /// Move the XY stage, µm.
    fn set_xy_position(&self, x_um: f64, y_um: f64) -> AppResult<()>;

    /// Current channel group.
    fn channel_group(&self) -> String;

    /// Presets defined in `group`.
    fn available_configs(&self, group: &str) -> Vec<String>;

    /// Apply a preset.
    fn set_config(&self, group: &str, preset: &str) -> AppResult<()>;

    /// Name of the active camera.
    fn camera_device(&self) -> String;

    /// Current exposure, ms.
    fn exposure_ms(&self) -> AppResult<f64>;

    /// Set the exposure, ms.
    fn set_exposure_ms(&self, exposure_ms: f64) -> AppResult<()>;

    /// Dimensions of the images the camera produces.
    fn image_geometry(&self) -> ImageGeometry;

    /// Expose and return the raw pixel bytes.
    fn snap_image(&self) -> AppResult<Vec<u8>>;
}

/// Whether `preset` exists in the core's current channel group.
pub fn is_config_available(core: &dyn MicroscopeCore, group: &str, preset: &str) -> bool {
    core.available_configs(group).iter().any(|c| c == preset)
}

/// Software or hardware autofocus.
pub trait AutofocusManager: Send + Sync {
    /// Device name, used in logs.
    fn name(&self) -> &str;

    /// Whether continuous (hardware) focus is currently on.
    fn is_continuous_focus_enabled(&self) -> bool;

    /// Turn continuous focus on or off.
    fn enable_continuous_focus(&self, enabled: bool) -> AppResult<()>;

    /// Run a full focus search, leaving the focus drive at the result.
    fn full_focus(&self) -> AppResult<()>;
}
