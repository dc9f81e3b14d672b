//! Mock Hardware Implementations
//!
//! Provides a simulated microscope for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockCore` - Simulated focus drive, XY stage, channel presets and camera
//! - `MockAutofocus` - Autofocus that moves the focus drive to a fixed target
//!
//! Both record what was asked of them so tests can assert on the hardware
//! sequence an acquisition produced.

use crate::error::{AcqError, AppResult};
use crate::hardware::{AutofocusManager, ImageGeometry, MicroscopeCore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Name of the simulated focus drive.
pub const MOCK_FOCUS_DEVICE: &str = "Z";
/// Name of the simulated camera.
pub const MOCK_CAMERA: &str = "Camera";

#[derive(Debug, Default)]
struct CoreState {
    focus_um: f64,
    xy_um: (f64, f64),
    exposure_ms: f64,
    presets: Vec<(String, String)>,
    focus_moves: Vec<f64>,
}

// =============================================================================
// MockCore - Simulated Microscope
// =============================================================================

/// Simulated microscope core.
///
/// - Focus drive named [`MOCK_FOCUS_DEVICE`] starting at `0.0` µm
/// - Channel group `"Channel"` with presets `DAPI`, `FITC`, `Cy5`
/// - Camera producing deterministic ramp images of the configured geometry
///
/// # Example
///
/// ```rust,ignore
/// let core = MockCore::new(ImageGeometry::new(64, 64, 2));
/// core.set_position("Z", 12.5)?;
/// assert_eq!(core.position("Z")?, 12.5);
/// ```
#[derive(Debug)]
pub struct MockCore {
    state: Mutex<CoreState>,
    geometry: ImageGeometry,
    group: String,
    configs: Vec<String>,
    snaps: AtomicU64,
    fail_snaps: AtomicBool,
}

impl MockCore {
    /// Mock core with the given camera geometry.
    pub fn new(geometry: ImageGeometry) -> Self {
        Self {
            state: Mutex::new(CoreState {
                exposure_ms: 10.0,
                ..Default::default()
            }),
            geometry,
            group: "Channel".to_string(),
            configs: vec!["DAPI".into(), "FITC".into(), "Cy5".into()],
            snaps: AtomicU64::new(0),
            fail_snaps: AtomicBool::new(false),
        }
    }

    /// Start with the focus drive at `z_um`.
    pub fn with_focus(self, z_um: f64) -> Self {
        self.state.lock().focus_um = z_um;
        self
    }

    /// Make every subsequent snap fail.
    pub fn fail_snaps(&self, fail: bool) {
        self.fail_snaps.store(fail, Ordering::SeqCst);
    }

    /// Number of images snapped so far.
    pub fn snap_count(&self) -> u64 {
        self.snaps.load(Ordering::SeqCst)
    }

    /// Every focus target requested, in order.
    pub fn focus_history(&self) -> Vec<f64> {
        self.state.lock().focus_moves.clone()
    }

    /// Every preset applied, in order, as `(group, preset)`.
    pub fn preset_history(&self) -> Vec<(String, String)> {
        self.state.lock().presets.clone()
    }

    /// Current XY position.
    pub fn xy_position(&self) -> (f64, f64) {
        self.state.lock().xy_um
    }
}

impl Default for MockCore {
    fn default() -> Self {
        Self::new(ImageGeometry::new(32, 32, 2))
    }
}

impl MicroscopeCore for MockCore {
    fn focus_device(&self) -> Option<String> {
        Some(MOCK_FOCUS_DEVICE.to_string())
    }

    fn position(&self, device: &str) -> AppResult<f64> {
        if device != MOCK_FOCUS_DEVICE {
            return Err(AcqError::Hardware(format!("unknown stage '{}'", device)));
        }
        Ok(self.state.lock().focus_um)
    }

    fn set_position(&self, device: &str, position_um: f64) -> AppResult<()> {
        if device != MOCK_FOCUS_DEVICE {
            return Err(AcqError::Hardware(format!("unknown stage '{}'", device)));
        }
        let mut state = self.state.lock();
        state.focus_um = position_um;
        state.focus_moves.push(position_um);
        Ok(())
    }

    fn set_xy_position(&self, x_um: f64, y_um: f64) -> AppResult<()> {
        self.state.lock().xy_um = (x_um, y_um);
        Ok(())
    }

    fn channel_group(&self) -> String {
        self.group.clone()
    }

    fn available_configs(&self, group: &str) -> Vec<String> {
        if group == self.group {
            self.configs.clone()
        } else {
            Vec::new()
        }
    }

    fn set_config(&self, group: &str, preset: &str) -> AppResult<()> {
        self.state
            .lock()
            .presets
            .push((group.to_string(), preset.to_string()));
        Ok(())
    }

    fn camera_device(&self) -> String {
        MOCK_CAMERA.to_string()
    }

    fn exposure_ms(&self) -> AppResult<f64> {
        Ok(self.state.lock().exposure_ms)
    }

    fn set_exposure_ms(&self, exposure_ms: f64) -> AppResult<()> {
        self.state.lock().exposure_ms = exposure_ms;
        Ok(())
    }

    fn image_geometry(&self) -> ImageGeometry {
        self.geometry
    }

    fn snap_image(&self) -> AppResult<Vec<u8>> {
        if self.fail_snaps.load(Ordering::SeqCst) {
            return Err(AcqError::Hardware("camera timed out".to_string()));
        }
        let frame = self.snaps.fetch_add(1, Ordering::SeqCst);
        let len = self.geometry.bytes_per_image() as usize;
        debug!(frame, len, "MockCore: snapped image");
        Ok((0..len).map(|i| (i as u64 + frame) as u8).collect())
    }
}

// =============================================================================
// MockAutofocus
// =============================================================================

/// Autofocus moving the focus drive of a core to a fixed target.
pub struct MockAutofocus {
    core: Arc<dyn MicroscopeCore>,
    target_um: f64,
    continuous: AtomicBool,
    runs: AtomicU64,
    fail: AtomicBool,
}

impl MockAutofocus {
    /// Autofocus that always finds `target_um`.
    pub fn new(core: Arc<dyn MicroscopeCore>, target_um: f64) -> Self {
        Self {
            core,
            target_um,
            continuous: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Number of full focus runs.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Make focus searches fail.
    pub fn fail_focus(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl AutofocusManager for MockAutofocus {
    fn name(&self) -> &str {
        "MockAutofocus"
    }

    fn is_continuous_focus_enabled(&self) -> bool {
        self.continuous.load(Ordering::SeqCst)
    }

    fn enable_continuous_focus(&self, enabled: bool) -> AppResult<()> {
        self.continuous.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn full_focus(&self) -> AppResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AcqError::Hardware("focus search did not converge".into()));
        }
        match self.core.focus_device() {
            Some(device) => self.core.set_position(&device, self.target_um),
            None => Err(AcqError::Hardware("no focus device".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_core_tracks_focus_moves() {
        let core = MockCore::default().with_focus(3.0);
        assert_eq!(core.position(MOCK_FOCUS_DEVICE).unwrap(), 3.0);
        core.set_position(MOCK_FOCUS_DEVICE, 4.5).unwrap();
        assert_eq!(core.focus_history(), vec![4.5]);
        assert!(core.position("Piezo").is_err());
    }

    #[test]
    fn snapped_images_match_geometry() {
        let core = MockCore::new(ImageGeometry::new(4, 3, 2));
        let pixels = core.snap_image().unwrap();
        assert_eq!(pixels.len(), 24);
        assert_eq!(core.snap_count(), 1);

        core.fail_snaps(true);
        assert!(core.snap_image().is_err());
    }

    #[test]
    fn autofocus_moves_focus_drive() {
        let core = Arc::new(MockCore::default());
        let af = MockAutofocus::new(core.clone(), 42.0);
        af.full_focus().unwrap();
        assert_eq!(core.position(MOCK_FOCUS_DEVICE).unwrap(), 42.0);
        assert_eq!(af.runs(), 1);
    }
}
