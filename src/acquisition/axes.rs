//! Axis factories.
//!
//! Each enabled axis of an acquisition becomes an [`AxisFactory`]: given a base
//! event it yields one derived event per value along the axis. Expansion is lazy
//! ([`AxisIter`]), and a factory can be expanded again for every base event the
//! enclosing axis produces.
//!
//! Factories stamp the axis index, the values the hardware needs (preset,
//! exposure, focus or stage target), the owning sub-acquisition and a terminal
//! marker on the last value of the axis.

use crate::acquisition::event::{
    AcquisitionEvent, ChannelRef, CHANNEL_AXIS, POSITION_AXIS, Z_AXIS,
};
use crate::acquisition::position::PositionList;
use crate::acquisition::settings::{ChannelSpec, SliceSettings};
use crate::error::AppResult;
use std::fmt;
use std::sync::Arc;

/// Expands a base event along one axis.
pub trait AxisFactory: Send + Sync + fmt::Debug {
    /// Axis name, as used in event axis positions.
    fn axis(&self) -> &'static str;

    /// Number of values along the axis.
    fn len(&self) -> u32;

    /// Event for value `index`, or `None` if that value is skipped for `base`.
    fn event_at(&self, base: &AcquisitionEvent, index: u32) -> Option<AcquisitionEvent>;
}

/// Lazily expand `base` along `factory`.
pub fn expand(factory: &Arc<dyn AxisFactory>, base: AcquisitionEvent) -> AxisIter {
    AxisIter {
        factory: Arc::clone(factory),
        base,
        next: 0,
    }
}

/// Iterator over the events one factory derives from one base event.
#[derive(Debug)]
pub struct AxisIter {
    factory: Arc<dyn AxisFactory>,
    base: AcquisitionEvent,
    next: u32,
}

impl Iterator for AxisIter {
    type Item = AcquisitionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.factory.len() {
            let index = self.next;
            self.next += 1;
            if let Some(event) = self.factory.event_at(&self.base, index) {
                return Some(event);
            }
        }
        None
    }
}

/// Channel axis over the enabled channels of a sub-acquisition.
#[derive(Debug, Clone)]
pub struct ChannelAxis {
    channels: Vec<ChannelSpec>,
    group: String,
    middle_slice: Option<u32>,
    acq_index: usize,
}

impl ChannelAxis {
    /// Channel at `index` of the enabled list.
    pub fn channel(&self, index: u32) -> Option<&ChannelSpec> {
        self.channels.get(index as usize)
    }

    /// Whether channel `index` yields an event for `base`.
    fn emits(&self, base: &AcquisitionEvent, index: u32) -> bool {
        let Some(spec) = self.channels.get(index as usize) else {
            return false;
        };
        // No time axis means a single timepoint 0.
        if !spec.acquires_frame(base.time_index().unwrap_or(0)) {
            return false;
        }
        // Slice-outer order: only the middle slice carries a channel without a stack.
        match (spec.do_z_stack, self.middle_slice, base.z_index()) {
            (false, Some(middle), Some(z)) => z == middle,
            _ => true,
        }
    }
}

impl AxisFactory for ChannelAxis {
    fn axis(&self) -> &'static str {
        CHANNEL_AXIS
    }

    fn len(&self) -> u32 {
        self.channels.len() as u32
    }

    fn event_at(&self, base: &AcquisitionEvent, index: u32) -> Option<AcquisitionEvent> {
        if !self.emits(base, index) {
            return None;
        }
        let spec = self.channels.get(index as usize)?;

        let group = if spec.channel_group.is_empty() {
            self.group.clone()
        } else {
            spec.channel_group.clone()
        };
        let mut event = base.clone().with_channel(
            index,
            ChannelRef {
                group,
                preset: spec.config.clone(),
                exposure_ms: spec.exposure_ms,
            },
        );

        // Channel-outer order: pin the z axis below to the middle slice.
        if !spec.do_z_stack && base.z_index().is_none() {
            if let Some(middle) = self.middle_slice {
                event = event.with_axis_position(Z_AXIS, middle);
            }
        }

        // Terminal on the last channel actually emitted for this base.
        if !(index + 1..self.len()).any(|later| self.emits(base, later)) {
            event = event.with_terminal(CHANNEL_AXIS);
        }
        Some(event.with_acq_index(self.acq_index))
    }
}

/// Build the channel axis. `channels` must already be filtered to the enabled
/// ones; `slice_count` is the z-stack length when slices are in use.
pub fn channel_axis(
    channels: Vec<ChannelSpec>,
    group: impl Into<String>,
    slice_count: Option<u32>,
    acq_index: usize,
) -> ChannelAxis {
    ChannelAxis {
        channels,
        group: group.into(),
        middle_slice: slice_count.map(|n| n.saturating_sub(1) / 2),
        acq_index,
    }
}

/// Focus axis.
#[derive(Debug, Clone)]
pub struct ZStackAxis {
    positions_um: Vec<f64>,
    channels: Vec<ChannelSpec>,
    acq_index: usize,
}

impl ZStackAxis {
    /// Focus target of slice `index`.
    pub fn position_um(&self, index: u32) -> Option<f64> {
        self.positions_um.get(index as usize).copied()
    }

    fn base_skips_stack(&self, base: &AcquisitionEvent) -> bool {
        base.channel_index()
            .and_then(|c| self.channels.get(c as usize))
            .map(|spec| !spec.do_z_stack)
            .unwrap_or(false)
    }
}

impl AxisFactory for ZStackAxis {
    fn axis(&self) -> &'static str {
        Z_AXIS
    }

    fn len(&self) -> u32 {
        self.positions_um.len() as u32
    }

    fn event_at(&self, base: &AcquisitionEvent, index: u32) -> Option<AcquisitionEvent> {
        let z_um = self.position_um(index)?;
        let single_slice = self.base_skips_stack(base);
        if single_slice {
            let middle = self.len().saturating_sub(1) / 2;
            if index != base.z_index().unwrap_or(middle) {
                return None;
            }
        }

        let mut event = base.clone().with_z(index, z_um);
        if single_slice || index + 1 == self.len() {
            event = event.with_terminal(Z_AXIS);
        }
        Some(event.with_acq_index(self.acq_index))
    }
}

/// Build the focus axis.
///
/// `channels` is the enabled channel list (the same one given to the channel
/// axis) so that channels which do not z-stack get a single slice.
/// Slices start at the bottom, offset by `current_z_um` when relative.
pub fn z_stack_axis(
    slices: &SliceSettings,
    current_z_um: f64,
    channels: Vec<ChannelSpec>,
    acq_index: usize,
) -> AppResult<ZStackAxis> {
    let offset = if slices.relative { current_z_um } else { 0.0 };
    let positions_um = slices
        .positions()?
        .into_iter()
        .map(|z| z + offset)
        .collect();
    Ok(ZStackAxis {
        positions_um,
        channels,
        acq_index,
    })
}

/// Stage-position axis.
#[derive(Debug, Clone)]
pub struct PositionAxis {
    positions: PositionList,
    acq_index: usize,
}

impl AxisFactory for PositionAxis {
    fn axis(&self) -> &'static str {
        POSITION_AXIS
    }

    fn len(&self) -> u32 {
        self.positions.len() as u32
    }

    fn event_at(&self, base: &AcquisitionEvent, index: u32) -> Option<AcquisitionEvent> {
        let position = self.positions.get(index as usize)?;
        let mut event = base
            .clone()
            .with_position(index, position.label.clone(), position.x_um, position.y_um);
        if let Some(z_um) = position.z_um {
            event = event.with_z_target(z_um);
        }
        if index + 1 == self.len() {
            event = event.with_terminal(POSITION_AXIS);
        }
        Some(event.with_acq_index(self.acq_index))
    }
}

/// Build the stage-position axis.
pub fn position_axis(positions: PositionList, acq_index: usize) -> PositionAxis {
    PositionAxis {
        positions,
        acq_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::event::TIME_AXIS;
    use crate::acquisition::position::StagePosition;

    fn channels() -> Vec<ChannelSpec> {
        vec![
            ChannelSpec::new("DAPI", 10.0),
            ChannelSpec::new("FITC", 20.0).with_z_stack(false),
        ]
    }

    #[test]
    fn channel_axis_pins_non_stacking_channel() {
        let axis: Arc<dyn AxisFactory> = Arc::new(channel_axis(channels(), "Channel", Some(5), 0));
        let events: Vec<_> = expand(&axis, AcquisitionEvent::new()).collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].z_index(), None);
        assert_eq!(events[1].z_index(), Some(2));
        assert_eq!(events[1].channel().unwrap().preset, "FITC");
        assert_eq!(events[1].channel().unwrap().group, "Channel");
        assert!(events[1].is_terminal(CHANNEL_AXIS));
        assert!(events.iter().all(|e| e.acq_index() == Some(0)));
    }

    #[test]
    fn channel_axis_under_z_keeps_middle_slice_only() {
        let axis: Arc<dyn AxisFactory> = Arc::new(channel_axis(channels(), "Channel", Some(5), 0));
        let off_middle = AcquisitionEvent::new().with_z(0, 0.0);
        let middle = AcquisitionEvent::new().with_z(2, 2.0);

        assert_eq!(expand(&axis, off_middle).count(), 1);
        assert_eq!(expand(&axis, middle).count(), 2);
    }

    #[test]
    fn skip_factor_is_applied_per_timepoint() {
        let specs = vec![
            ChannelSpec::new("DAPI", 10.0),
            ChannelSpec::new("FITC", 20.0).with_skip_factor(1),
        ];
        let axis: Arc<dyn AxisFactory> = Arc::new(channel_axis(specs, "Channel", None, 0));

        let t1 = AcquisitionEvent::new().with_axis_position(TIME_AXIS, 1);
        let t2 = AcquisitionEvent::new().with_axis_position(TIME_AXIS, 2);
        assert_eq!(expand(&axis, t1).count(), 1);
        assert_eq!(expand(&axis, t2).count(), 2);
        // No time axis counts as timepoint 0.
        assert_eq!(expand(&axis, AcquisitionEvent::new()).count(), 2);
    }

    #[test]
    fn terminal_channel_is_last_emitted() {
        let specs = vec![
            ChannelSpec::new("DAPI", 10.0),
            ChannelSpec::new("FITC", 20.0).with_skip_factor(1),
        ];
        let axis: Arc<dyn AxisFactory> = Arc::new(channel_axis(specs, "Channel", None, 0));

        let skipped: Vec<_> =
            expand(&axis, AcquisitionEvent::new().with_axis_position(TIME_AXIS, 1)).collect();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].is_terminal(CHANNEL_AXIS));

        let full: Vec<_> =
            expand(&axis, AcquisitionEvent::new().with_axis_position(TIME_AXIS, 2)).collect();
        assert!(!full[0].is_terminal(CHANNEL_AXIS));
        assert!(full[1].is_terminal(CHANNEL_AXIS));

        // Slice-outer order: off the middle slice the stacking channel ends the sweep.
        let pinned: Arc<dyn AxisFactory> = Arc::new(channel_axis(channels(), "Channel", Some(5), 0));
        let off_middle: Vec<_> = expand(&pinned, AcquisitionEvent::new().with_z(0, 0.0)).collect();
        assert_eq!(off_middle.len(), 1);
        assert!(off_middle[0].is_terminal(CHANNEL_AXIS));
    }

    #[test]
    fn z_stack_respects_relative_origin_and_terminal() {
        let slices = SliceSettings::new(-1.0, 1.0, 1.0).relative();
        let axis: Arc<dyn AxisFactory> =
            Arc::new(z_stack_axis(&slices, 100.0, Vec::new(), 3).unwrap());
        let events: Vec<_> = expand(&axis, AcquisitionEvent::new()).collect();

        let targets: Vec<f64> = events.iter().filter_map(|e| e.z_um()).collect();
        assert_eq!(targets, vec![99.0, 100.0, 101.0]);
        assert!(events[2].is_terminal(Z_AXIS));
        assert!(!events[1].is_terminal(Z_AXIS));
        assert_eq!(events[0].acq_index(), Some(3));
    }

    #[test]
    fn z_stack_single_slice_for_pinned_channel() {
        let slices = SliceSettings::new(0.0, 4.0, 1.0);
        let z: Arc<dyn AxisFactory> = Arc::new(z_stack_axis(&slices, 0.0, channels(), 0).unwrap());
        let c: Arc<dyn AxisFactory> = Arc::new(channel_axis(channels(), "Channel", Some(5), 0));

        let mut per_channel = Vec::new();
        for channel_event in expand(&c, AcquisitionEvent::new()) {
            per_channel.push(expand(&z, channel_event).collect::<Vec<_>>());
        }
        assert_eq!(per_channel[0].len(), 5);
        assert_eq!(per_channel[1].len(), 1);
        assert_eq!(per_channel[1][0].z_um(), Some(2.0));
        assert!(per_channel[1][0].is_terminal(Z_AXIS));
    }

    #[test]
    fn zero_step_fails_to_build() {
        let slices = SliceSettings::new(0.0, 4.0, 0.0);
        assert!(z_stack_axis(&slices, 0.0, Vec::new(), 0).is_err());
    }

    #[test]
    fn position_axis_sets_stage_targets() {
        let positions: PositionList = vec![
            StagePosition::new("A1", 10.0, 20.0),
            StagePosition::new("A2", 30.0, 40.0).with_z(5.0),
        ]
        .into();
        let axis: Arc<dyn AxisFactory> = Arc::new(position_axis(positions, 1));
        let events: Vec<_> = expand(&axis, AcquisitionEvent::new()).collect();

        assert_eq!(events[0].xy_um(), Some((10.0, 20.0)));
        assert_eq!(events[0].position_label(), Some("A1"));
        assert_eq!(events[1].z_um(), Some(5.0));
        assert!(events[1].is_terminal(POSITION_AXIS));
    }
}
