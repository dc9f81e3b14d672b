//! Batch files: a master timelapse plus the sub-acquisitions to run.
//!
//! ```toml
//! [timelapse]
//! use_frames = true
//! num_frames = 3
//! interval_ms = 500.0
//!
//! [[acquisition]]
//! prefix = "overview"
//! use_channels = true
//! channel_group = "Channel"
//! channels = [{ config = "DAPI", exposure_ms = 5.0 }]
//! positions = [{ label = "A1", x_um = 0.0, y_um = 0.0 }]
//! ```

use crate::acquisition::position::PositionList;
use crate::acquisition::settings::AcquisitionSettings;
use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// One sub-acquisition of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub settings: AcquisitionSettings,
    /// Stage positions visited when the entry uses positions.
    #[serde(default)]
    pub positions: PositionList,
}

/// Contents of a batch file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchFile {
    /// Timing shared by every sub-acquisition.
    #[serde(default)]
    pub timelapse: AcquisitionSettings,
    /// Sub-acquisitions, in run order.
    #[serde(default)]
    pub acquisition: Vec<BatchEntry>,
}

impl BatchFile {
    /// Parse a batch file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let batch: BatchFile = toml::from_str(&text)?;
        debug!(
            path = %path.as_ref().display(),
            entries = batch.acquisition.len(),
            "Loaded batch file"
        );
        Ok(batch)
    }

    /// Settings of every entry.
    pub fn settings(&self) -> Vec<AcquisitionSettings> {
        self.acquisition.iter().map(|e| e.settings.clone()).collect()
    }

    /// Position lists of every entry.
    pub fn position_lists(&self) -> Vec<PositionList> {
        self.acquisition.iter().map(|e| e.positions.clone()).collect()
    }

    /// Save entries that name no root directory under `root`.
    pub fn with_default_root(mut self, root: &Path) -> Self {
        for entry in &mut self.acquisition {
            if entry.settings.save() && entry.settings.root().as_os_str().is_empty() {
                let prefix = entry.settings.prefix().to_string();
                entry.settings = entry.settings.to_builder().save_to(root, prefix).build();
            }
        }
        self
    }
}
