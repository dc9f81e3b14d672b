//! Acquisition events: one hardware configuration plus one image.
//!
//! Events are built up by the axis factories while the sequence is expanded and
//! are not modified after they are handed to the engine (hooks receive an event
//! and return a possibly different one).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Name of the time axis.
pub const TIME_AXIS: &str = "time";
/// Name of the focus (slice) axis.
pub const Z_AXIS: &str = "z";
/// Name of the stage-position axis.
pub const POSITION_AXIS: &str = "position";
/// Name of the channel axis.
pub const CHANNEL_AXIS: &str = "channel";

/// Indices along the named axes of an acquisition.
///
/// The four well-known axes are fields; anything else lives in `extra` and is
/// addressed through the same [`get`](Self::get)/[`set`](Self::set) API.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AxisPositions {
    /// Timepoint index.
    pub time: Option<u32>,
    /// Slice index.
    pub z: Option<u32>,
    /// Stage position index.
    pub position: Option<u32>,
    /// Index within the enabled channel list.
    pub channel: Option<u32>,
    /// Additional axes.
    pub extra: BTreeMap<String, u32>,
}

impl AxisPositions {
    /// Whether `axis` is one of the four well-known axes.
    pub fn is_standard(axis: &str) -> bool {
        matches!(axis, TIME_AXIS | Z_AXIS | POSITION_AXIS | CHANNEL_AXIS)
    }

    /// Index along `axis`, if set.
    pub fn get(&self, axis: &str) -> Option<u32> {
        match axis {
            TIME_AXIS => self.time,
            Z_AXIS => self.z,
            POSITION_AXIS => self.position,
            CHANNEL_AXIS => self.channel,
            other => self.extra.get(other).copied(),
        }
    }

    /// Set the index along `axis`.
    pub fn set(&mut self, axis: &str, index: u32) {
        match axis {
            TIME_AXIS => self.time = Some(index),
            Z_AXIS => self.z = Some(index),
            POSITION_AXIS => self.position = Some(index),
            CHANNEL_AXIS => self.channel = Some(index),
            other => {
                self.extra.insert(other.to_string(), index);
            }
        }
    }

    /// All set axes, well-known ones first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        [
            (TIME_AXIS, self.time),
            (POSITION_AXIS, self.position),
            (CHANNEL_AXIS, self.channel),
            (Z_AXIS, self.z),
        ]
        .into_iter()
        .filter_map(|(name, index)| index.map(|i| (name, i)))
        .chain(self.extra.iter().map(|(name, index)| (name.as_str(), *index)))
    }

    /// Whether no axis is set.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Channel preset applied for an event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRef {
    /// Configuration group.
    pub group: String,
    /// Preset within the group.
    pub preset: String,
    /// Exposure in milliseconds.
    pub exposure_ms: f64,
}

/// A single acquisition step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcquisitionEvent {
    axes: AxisPositions,
    channel: Option<ChannelRef>,
    z_um: Option<f64>,
    xy_um: Option<(f64, f64)>,
    position_label: Option<String>,
    min_start_time: Option<Duration>,
    acq_index: Option<usize>,
    terminal_axes: BTreeSet<String>,
    tags: BTreeMap<String, String>,
}

impl AcquisitionEvent {
    /// Event with no axes set.
    pub fn new() -> Self {
        Self::default()
    }

    /// All axis indices.
    pub fn axes(&self) -> &AxisPositions {
        &self.axes
    }

    /// Index along `axis`, by name.
    pub fn axis_position(&self, axis: &str) -> Option<u32> {
        self.axes.get(axis)
    }

    /// Copy with the index along `axis` set.
    pub fn with_axis_position(mut self, axis: &str, index: u32) -> Self {
        self.axes.set(axis, index);
        self
    }

    #[allow(missing_docs)]
    pub fn time_index(&self) -> Option<u32> {
        self.axes.time
    }

    #[allow(missing_docs)]
    pub fn z_index(&self) -> Option<u32> {
        self.axes.z
    }

    #[allow(missing_docs)]
    pub fn position_index(&self) -> Option<u32> {
        self.axes.position
    }

    #[allow(missing_docs)]
    pub fn channel_index(&self) -> Option<u32> {
        self.axes.channel
    }

    /// Channel preset, when the channel axis is in use.
    pub fn channel(&self) -> Option<&ChannelRef> {
        self.channel.as_ref()
    }

    /// Copy with channel index and preset set.
    pub fn with_channel(mut self, index: u32, channel: ChannelRef) -> Self {
        self.axes.channel = Some(index);
        self.channel = Some(channel);
        self
    }

    /// Target focus position in µm.
    pub fn z_um(&self) -> Option<f64> {
        self.z_um
    }

    /// Copy with slice index and focus target set.
    pub fn with_z(mut self, index: u32, z_um: f64) -> Self {
        self.axes.z = Some(index);
        self.z_um = Some(z_um);
        self
    }

    /// Copy with only the focus target set (no slice index).
    pub fn with_z_target(mut self, z_um: f64) -> Self {
        self.z_um = Some(z_um);
        self
    }

    /// Target XY stage position in µm.
    pub fn xy_um(&self) -> Option<(f64, f64)> {
        self.xy_um
    }

    /// Label of the stage position.
    pub fn position_label(&self) -> Option<&str> {
        self.position_label.as_deref()
    }

    /// Copy with position index, XY target and label set.
    pub fn with_position(mut self, index: u32, label: impl Into<String>, x_um: f64, y_um: f64) -> Self {
        self.axes.position = Some(index);
        self.xy_um = Some((x_um, y_um));
        self.position_label = Some(label.into());
        self
    }

    /// Earliest start, relative to the start of the acquisition.
    pub fn min_start_time(&self) -> Option<Duration> {
        self.min_start_time
    }

    /// Copy with the earliest start set.
    pub fn with_min_start_time(mut self, offset: Duration) -> Self {
        self.min_start_time = Some(offset);
        self
    }

    /// Index of the sub-acquisition that owns this event.
    pub fn acq_index(&self) -> Option<usize> {
        self.acq_index
    }

    /// Copy tagged with the owning sub-acquisition.
    pub fn with_acq_index(mut self, acq_index: usize) -> Self {
        self.acq_index = Some(acq_index);
        self
    }

    /// Whether this event holds the last value along `axis`.
    pub fn is_terminal(&self, axis: &str) -> bool {
        self.terminal_axes.contains(axis)
    }

    /// Axes on which this event holds the last value.
    pub fn terminal_axes(&self) -> &BTreeSet<String> {
        &self.terminal_axes
    }

    /// Copy marked terminal on `axis`.
    pub fn with_terminal(mut self, axis: &str) -> Self {
        self.terminal_axes.insert(axis.to_string());
        self
    }

    /// Free-form tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Copy with a tag added.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
