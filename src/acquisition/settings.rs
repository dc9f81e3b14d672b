//! Acquisition settings: what to acquire, along which axes, in which order.
//!
//! [`AcquisitionSettings`] is immutable once built. Use
//! [`AcquisitionSettings::builder`] (or [`AcquisitionSettings::to_builder`] for a
//! modified copy) to construct one. Settings are serde (de)serializable so that
//! batch files can describe them directly.

use crate::error::{AcqError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tolerance used when deriving a slice count from bottom/top/step, so that
/// e.g. `0.6 / 0.2` counts four slices rather than three.
const SLICE_COUNT_EPSILON: f64 = 1e-9;

/// Largest z-stack a single acquisition may request.
pub const MAX_SLICES: u32 = 100_000;

/// Nesting order of the acquisition axes, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcqOrderMode {
    /// time ⟶ position ⟶ channel ⟶ slice
    #[default]
    TimePosChannelSlice,
    /// time ⟶ position ⟶ slice ⟶ channel
    TimePosSliceChannel,
    /// position ⟶ time ⟶ channel ⟶ slice
    PosTimeChannelSlice,
    /// position ⟶ time ⟶ slice ⟶ channel
    PosTimeSliceChannel,
}

impl AcqOrderMode {
    /// Time is the outermost axis.
    pub fn is_time_first(self) -> bool {
        matches!(
            self,
            AcqOrderMode::TimePosChannelSlice | AcqOrderMode::TimePosSliceChannel
        )
    }

    /// Slices vary faster than channels.
    pub fn is_slices_first(self) -> bool {
        matches!(
            self,
            AcqOrderMode::TimePosChannelSlice | AcqOrderMode::PosTimeChannelSlice
        )
    }

    /// Human readable axis order, as shown in the acquisition summary.
    pub fn description(self) -> &'static str {
        match self {
            AcqOrderMode::TimePosChannelSlice => "Time, Position, Channel, Slice",
            AcqOrderMode::TimePosSliceChannel => "Time, Position, Slice, Channel",
            AcqOrderMode::PosTimeChannelSlice => "Position, Time, Channel, Slice",
            AcqOrderMode::PosTimeSliceChannel => "Position, Time, Slice, Channel",
        }
    }
}

impl fmt::Display for AcqOrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcqOrderMode::TimePosChannelSlice => write!(f, "time-pos-channel-slice"),
            AcqOrderMode::TimePosSliceChannel => write!(f, "time-pos-slice-channel"),
            AcqOrderMode::PosTimeChannelSlice => write!(f, "pos-time-channel-slice"),
            AcqOrderMode::PosTimeSliceChannel => write!(f, "pos-time-slice-channel"),
        }
    }
}

/// One entry of the channel list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSpec {
    /// Preset name within the channel group.
    pub config: String,
    /// Channel group; empty means "use the acquisition's channel group".
    pub channel_group: String,
    /// Exposure in milliseconds.
    pub exposure_ms: f64,
    /// Whether the channel takes part in the acquisition at all.
    pub use_channel: bool,
    /// Whether the channel is acquired at every slice or only the middle one.
    pub do_z_stack: bool,
    /// Number of frames skipped between acquisitions of this channel.
    pub skip_factor_frame: u32,
    /// Display colour as `0xRRGGBB`.
    pub color: u32,
}

impl Default for ChannelSpec {
    fn default() -> Self {
        Self {
            config: String::new(),
            channel_group: String::new(),
            exposure_ms: 10.0,
            use_channel: true,
            do_z_stack: true,
            skip_factor_frame: 0,
            color: 0xFF_FF_FF,
        }
    }
}

impl ChannelSpec {
    /// Channel using `config` with the given exposure.
    pub fn new(config: impl Into<String>, exposure_ms: f64) -> Self {
        Self {
            config: config.into(),
            exposure_ms,
            ..Default::default()
        }
    }

    /// Toggle z-stacking for this channel.
    pub fn with_z_stack(mut self, enabled: bool) -> Self {
        self.do_z_stack = enabled;
        self
    }

    /// Acquire only every `skip + 1`-th frame.
    pub fn with_skip_factor(mut self, skip: u32) -> Self {
        self.skip_factor_frame = skip;
        self
    }

    /// Exclude the channel from the acquisition.
    pub fn disabled(mut self) -> Self {
        self.use_channel = false;
        self
    }

    /// Whether the channel is acquired at the given timepoint.
    pub fn acquires_frame(&self, frame: u32) -> bool {
        frame % (self.skip_factor_frame.saturating_add(1)) == 0
    }

    /// Number of timepoints out of `frames` at which this channel is acquired.
    pub fn frames_acquired(&self, frames: u32) -> u32 {
        frames.div_ceil(self.skip_factor_frame.saturating_add(1))
    }
}

/// Z-stack definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceSettings {
    /// First slice, µm.
    pub bottom_um: f64,
    /// Last slice, µm.
    pub top_um: f64,
    /// Distance between slices, µm. Sign is ignored; direction follows bottom/top.
    pub step_um: f64,
    /// Slice positions are offsets from the focus position at acquisition start.
    pub relative: bool,
    /// Explicit slice positions. Must agree with the count implied by bottom/top/step.
    pub explicit: Option<Vec<f64>>,
}

impl SliceSettings {
    /// Slices from `bottom_um` to `top_um` every `step_um`.
    pub fn new(bottom_um: f64, top_um: f64, step_um: f64) -> Self {
        Self {
            bottom_um,
            top_um,
            step_um,
            relative: false,
            explicit: None,
        }
    }

    /// Mark the slices as relative to the current focus position.
    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    /// Number of slices, `1 + |top - bottom| / |step|`.
    pub fn count(&self) -> AppResult<u32> {
        if self.step_um == 0.0 {
            return Err(AcqError::ZeroZStep);
        }
        if !(self.step_um.is_finite() && self.bottom_um.is_finite() && self.top_um.is_finite())
        {
            return Err(AcqError::Configuration(format!(
                "slice settings must be finite (bottom {}, top {}, step {})",
                self.bottom_um, self.top_um, self.step_um
            )));
        }
        let span = (self.top_um - self.bottom_um).abs() / self.step_um.abs();
        let slices = (span + SLICE_COUNT_EPSILON).floor() + 1.0;
        if !slices.is_finite() || slices > f64::from(MAX_SLICES) {
            return Err(AcqError::Configuration(format!(
                "z-stack from {} to {} every {} µm exceeds {} slices",
                self.bottom_um, self.top_um, self.step_um, MAX_SLICES
            )));
        }
        // Bounded above, and at least 1.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = slices as u32;

        if let Some(explicit) = &self.explicit {
            if explicit.len() != count as usize {
                return Err(AcqError::Configuration(format!(
                    "explicit slice list has {} entries but bottom/top/step imply {}",
                    explicit.len(),
                    count
                )));
            }
        }
        Ok(count)
    }

    /// Step with its direction: negative when bottom lies above top.
    pub fn signed_step(&self) -> f64 {
        let step = self.step_um.abs();
        if self.bottom_um > self.top_um {
            -step
        } else {
            step
        }
    }

    /// Slice positions in acquisition order, before any relative offset.
    pub fn positions(&self) -> AppResult<Vec<f64>> {
        let count = self.count()?;
        if let Some(explicit) = &self.explicit {
            return Ok(explicit.clone());
        }
        let step = self.signed_step();
        Ok((0..count)
            .map(|i| self.bottom_um + f64::from(i) * step)
            .collect())
    }
}

/// Autofocus behaviour during the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusSettings {
    /// Run a full focus before each (timepoint, position).
    pub enabled: bool,
    /// Number of timepoints skipped between focus runs.
    pub skip_frames: u32,
}

impl AutofocusSettings {
    /// Whether focusing is due at `frame`.
    pub fn due_at(&self, frame: u32) -> bool {
        self.enabled && frame % (self.skip_frames.saturating_add(1)) == 0
    }
}

/// Complete description of one (sub-)acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    use_frames: bool,
    num_frames: u32,
    interval_ms: f64,
    use_custom_intervals: bool,
    custom_intervals_ms: Vec<f64>,
    use_positions: bool,
    use_channels: bool,
    channel_group: String,
    channels: Vec<ChannelSpec>,
    use_slices: bool,
    slices: SliceSettings,
    order: AcqOrderMode,
    autofocus: AutofocusSettings,
    save: bool,
    root: PathBuf,
    prefix: String,
    comment: String,
    should_display_images: bool,
    user_metadata: BTreeMap<String, String>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            use_frames: false,
            num_frames: 1,
            interval_ms: 0.0,
            use_custom_intervals: false,
            custom_intervals_ms: Vec::new(),
            use_positions: false,
            use_channels: false,
            channel_group: String::new(),
            channels: Vec::new(),
            use_slices: false,
            slices: SliceSettings::default(),
            order: AcqOrderMode::default(),
            autofocus: AutofocusSettings::default(),
            save: false,
            root: PathBuf::new(),
            prefix: "MDA".to_string(),
            comment: String::new(),
            should_display_images: true,
            user_metadata: BTreeMap::new(),
        }
    }
}

impl AcquisitionSettings {
    /// Start building settings from the defaults.
    pub fn builder() -> AcquisitionSettingsBuilder {
        AcquisitionSettingsBuilder {
            settings: Self::default(),
        }
    }

    /// Builder pre-populated with these settings.
    pub fn to_builder(&self) -> AcquisitionSettingsBuilder {
        AcquisitionSettingsBuilder {
            settings: self.clone(),
        }
    }

    /// Copy of these settings with the time-lapse axis taken from `master`.
    ///
    /// In a batch every sub-acquisition shares the master's frames and interval.
    pub fn with_timing_from(&self, master: &AcquisitionSettings) -> Self {
        let mut copy = self.clone();
        copy.use_frames = master.use_frames;
        copy.num_frames = master.num_frames;
        copy.interval_ms = master.interval_ms;
        copy.use_custom_intervals = master.use_custom_intervals;
        copy.custom_intervals_ms = master.custom_intervals_ms.clone();
        copy
    }

    #[allow(missing_docs)]
    pub fn use_frames(&self) -> bool {
        self.use_frames
    }

    #[allow(missing_docs)]
    pub fn num_frames(&self) -> u32 {
        self.num_frames
    }

    #[allow(missing_docs)]
    pub fn interval_ms(&self) -> f64 {
        self.interval_ms
    }

    /// Interval between timepoints. Non-finite or negative values count as zero.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_ms / 1000.0).unwrap_or(Duration::ZERO)
    }

    #[allow(missing_docs)]
    pub fn use_custom_intervals(&self) -> bool {
        self.use_custom_intervals
    }

    #[allow(missing_docs)]
    pub fn custom_intervals_ms(&self) -> &[f64] {
        &self.custom_intervals_ms
    }

    #[allow(missing_docs)]
    pub fn use_positions(&self) -> bool {
        self.use_positions
    }

    #[allow(missing_docs)]
    pub fn use_channels(&self) -> bool {
        self.use_channels
    }

    #[allow(missing_docs)]
    pub fn channel_group(&self) -> &str {
        &self.channel_group
    }

    /// Full channel list, including disabled channels.
    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    /// Channels that take part in the acquisition, in list order.
    ///
    /// Empty when the channel axis is off.
    pub fn enabled_channels(&self) -> Vec<ChannelSpec> {
        if !self.use_channels {
            return Vec::new();
        }
        self.channels
            .iter()
            .filter(|c| c.use_channel)
            .cloned()
            .collect()
    }

    #[allow(missing_docs)]
    pub fn use_slices(&self) -> bool {
        self.use_slices
    }

    #[allow(missing_docs)]
    pub fn slices(&self) -> &SliceSettings {
        &self.slices
    }

    #[allow(missing_docs)]
    pub fn order(&self) -> AcqOrderMode {
        self.order
    }

    #[allow(missing_docs)]
    pub fn autofocus(&self) -> AutofocusSettings {
        self.autofocus
    }

    #[allow(missing_docs)]
    pub fn save(&self) -> bool {
        self.save
    }

    #[allow(missing_docs)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[allow(missing_docs)]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[allow(missing_docs)]
    pub fn comment(&self) -> &str {
        &self.comment
    }

    #[allow(missing_docs)]
    pub fn should_display_images(&self) -> bool {
        self.should_display_images
    }

    /// Free-form metadata merged into the summary metadata.
    pub fn user_metadata(&self) -> &BTreeMap<String, String> {
        &self.user_metadata
    }

    /// Checks that do not depend on the rest of the batch or on hardware.
    pub fn validate(&self) -> AppResult<()> {
        if !self.interval_ms.is_finite() || self.interval_ms < 0.0 {
            return Err(AcqError::Configuration(format!(
                "interval must be a non-negative number of milliseconds, got {}",
                self.interval_ms
            )));
        }
        if !self.order.is_time_first() {
            return Err(AcqError::UnsupportedOrder(self.order));
        }
        if self.use_slices {
            self.slices.count()?;
        }
        for channel in self.channels.iter().filter(|c| c.use_channel) {
            if !channel.exposure_ms.is_finite() || channel.exposure_ms < 0.0 {
                return Err(AcqError::Configuration(format!(
                    "channel '{}' has invalid exposure {}",
                    channel.config, channel.exposure_ms
                )));
            }
        }
        if self.save && self.root.as_os_str().is_empty() {
            return Err(AcqError::Configuration(
                "saving is enabled but no root directory is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`AcquisitionSettings`].
#[derive(Debug, Clone)]
pub struct AcquisitionSettingsBuilder {
    settings: AcquisitionSettings,
}

impl AcquisitionSettingsBuilder {
    /// Enable the time axis with `num_frames` timepoints every `interval_ms`.
    pub fn frames(mut self, num_frames: u32, interval_ms: f64) -> Self {
        self.settings.use_frames = true;
        self.settings.num_frames = num_frames;
        self.settings.interval_ms = interval_ms;
        self
    }

    /// Toggle the time axis without changing frame count or interval.
    pub fn use_frames(mut self, enabled: bool) -> Self {
        self.settings.use_frames = enabled;
        self
    }

    /// Use a non-uniform list of intervals.
    pub fn custom_intervals(mut self, intervals_ms: Vec<f64>) -> Self {
        self.settings.use_custom_intervals = true;
        self.settings.custom_intervals_ms = intervals_ms;
        self
    }

    /// Toggle the stage-position axis.
    pub fn use_positions(mut self, enabled: bool) -> Self {
        self.settings.use_positions = enabled;
        self
    }

    /// Enable the channel axis with the given group and channels.
    pub fn channels(mut self, group: impl Into<String>, channels: Vec<ChannelSpec>) -> Self {
        self.settings.use_channels = true;
        self.settings.channel_group = group.into();
        self.settings.channels = channels;
        self
    }

    /// Toggle the channel axis without changing the channel list.
    pub fn use_channels(mut self, enabled: bool) -> Self {
        self.settings.use_channels = enabled;
        self
    }

    /// Enable the z axis.
    pub fn slices(mut self, slices: SliceSettings) -> Self {
        self.settings.use_slices = true;
        self.settings.slices = slices;
        self
    }

    /// Toggle the z axis without changing the slice settings.
    pub fn use_slices(mut self, enabled: bool) -> Self {
        self.settings.use_slices = enabled;
        self
    }

    #[allow(missing_docs)]
    pub fn order(mut self, order: AcqOrderMode) -> Self {
        self.settings.order = order;
        self
    }

    #[allow(missing_docs)]
    pub fn autofocus(mut self, autofocus: AutofocusSettings) -> Self {
        self.settings.autofocus = autofocus;
        self
    }

    /// Save under `root` using `prefix` for the dataset name.
    pub fn save_to(mut self, root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.settings.save = true;
        self.settings.root = root.into();
        self.settings.prefix = prefix.into();
        self
    }

    #[allow(missing_docs)]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.prefix = prefix.into();
        self
    }

    #[allow(missing_docs)]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.settings.comment = comment.into();
        self
    }

    #[allow(missing_docs)]
    pub fn display_images(mut self, enabled: bool) -> Self {
        self.settings.should_display_images = enabled;
        self
    }

    /// Add a user summary-metadata entry.
    pub fn user_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.user_metadata.insert(key.into(), value.into());
        self
    }

    /// Finish building.
    pub fn build(self) -> AcquisitionSettings {
        self.settings
    }
}
