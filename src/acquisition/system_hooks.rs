//! Hooks the driver installs on its own behalf.

use crate::acquisition::event::{AcquisitionEvent, Z_AXIS};
use crate::acquisition::hooks::{AcquisitionHook, HookError};
use crate::hardware::{AutofocusManager, MicroscopeCore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

type FocusKey = (usize, Option<u32>, Option<u32>);

/// Runs a full focus on the first event of each (timepoint, position).
///
/// Only sub-acquisitions listed in `skip_frames` are focused; the value is the
/// number of timepoints skipped between focus runs.
pub struct AutofocusHook {
    autofocus: Arc<dyn AutofocusManager>,
    skip_frames: HashMap<usize, u32>,
    last: Mutex<Option<FocusKey>>,
}

impl AutofocusHook {
    #[allow(missing_docs)]
    pub fn new(autofocus: Arc<dyn AutofocusManager>, skip_frames: HashMap<usize, u32>) -> Self {
        Self {
            autofocus,
            skip_frames,
            last: Mutex::new(None),
        }
    }
}

impl AcquisitionHook for AutofocusHook {
    fn name(&self) -> &str {
        "autofocus"
    }

    fn run(&self, event: AcquisitionEvent) -> Result<AcquisitionEvent, HookError> {
        let Some(acq_index) = event.acq_index() else {
            return Ok(event);
        };
        let Some(skip) = self.skip_frames.get(&acq_index) else {
            return Ok(event);
        };

        let key = (acq_index, event.time_index(), event.position_index());
        {
            let mut last = self.last.lock();
            if *last == Some(key) {
                return Ok(event);
            }
            *last = Some(key);
        }

        let frame = event.time_index().unwrap_or(0);
        if frame % skip.saturating_add(1) != 0 {
            return Ok(event);
        }

        info!(
            device = self.autofocus.name(),
            acq_index,
            frame,
            position = ?event.position_index(),
            "Running autofocus"
        );
        self.autofocus.full_focus()?;
        Ok(event)
    }
}

/// Moves focus back to a reference position after the last slice of a stack.
pub struct ZRestoreHook {
    core: Arc<dyn MicroscopeCore>,
    device: String,
    reference_um: f64,
    sub_acquisitions: HashSet<usize>,
}

impl ZRestoreHook {
    /// Restore `device` to `reference_um` for the listed sub-acquisitions.
    pub fn new(
        core: Arc<dyn MicroscopeCore>,
        device: impl Into<String>,
        reference_um: f64,
        sub_acquisitions: HashSet<usize>,
    ) -> Self {
        Self {
            core,
            device: device.into(),
            reference_um,
            sub_acquisitions,
        }
    }
}

impl AcquisitionHook for ZRestoreHook {
    fn name(&self) -> &str {
        "z-restore"
    }

    fn run(&self, event: AcquisitionEvent) -> Result<AcquisitionEvent, HookError> {
        let owned = event
            .acq_index()
            .is_some_and(|idx| self.sub_acquisitions.contains(&idx));
        if owned && event.is_terminal(Z_AXIS) {
            debug!(device = %self.device, z_um = self.reference_um, "Restoring focus after stack");
            self.core.set_position(&self.device, self.reference_um)?;
        }
        Ok(event)
    }
}
