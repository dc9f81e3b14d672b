//! Event sequencing.
//!
//! An [`EventSequencer`] nests the axis factories of one sub-acquisition in the
//! configured order and produces, per timepoint, a [`ComposedEvents`] stream.
//! Streams are lazy and single-use: the driver builds a fresh one for every
//! (timepoint, sub-acquisition) pair and hands it to the engine.
//!
//! Every event produced passes through an [`EventMonitor`] before it leaves the
//! stream. A rejected event ends the stream with an error.

use crate::acquisition::axes::{
    channel_axis, expand, position_axis, z_stack_axis, AxisFactory, AxisIter,
};
use crate::acquisition::event::{AcquisitionEvent, TIME_AXIS};
use crate::acquisition::position::PositionList;
use crate::acquisition::settings::{AcqOrderMode, AcquisitionSettings};
use crate::error::{AcqError, AppResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Inspects each event before it is handed out.
pub trait EventMonitor: Send {
    /// Reject the event by returning an error.
    fn check(&mut self, event: &AcquisitionEvent) -> AppResult<()>;
}

/// Earliest start of the most recently sequenced event, shared with the driver.
#[derive(Debug, Clone)]
pub struct NextWakeTime(Arc<AtomicI64>);

impl Default for NextWakeTime {
    fn default() -> Self {
        Self(Arc::new(AtomicI64::new(-1)))
    }
}

impl NextWakeTime {
    /// Current value, `None` until an event with a start time was sequenced.
    pub fn get(&self) -> Option<Duration> {
        let millis = self.0.load(Ordering::Relaxed);
        u64::try_from(millis).ok().map(Duration::from_millis)
    }

    /// Record a start time.
    pub fn set(&self, at: Duration) {
        let millis = i64::try_from(at.as_millis()).unwrap_or(i64::MAX);
        self.0.store(millis, Ordering::Relaxed);
    }

    /// Forget the recorded time.
    pub fn clear(&self) {
        self.0.store(-1, Ordering::Relaxed);
    }
}

/// Rejects events whose indices fall outside the declared axis lengths.
#[derive(Debug, Clone, Default)]
pub struct BoundsMonitor {
    bounds: BTreeMap<&'static str, u32>,
    wake: Option<NextWakeTime>,
}

impl BoundsMonitor {
    /// Monitor with the given `axis -> length` bounds.
    pub fn new(bounds: BTreeMap<&'static str, u32>) -> Self {
        Self { bounds, wake: None }
    }

    /// Also record each event's minimum start time in `wake`.
    pub fn with_wake_tracker(mut self, wake: NextWakeTime) -> Self {
        self.wake = Some(wake);
        self
    }
}

impl EventMonitor for BoundsMonitor {
    fn check(&mut self, event: &AcquisitionEvent) -> AppResult<()> {
        for (axis, index) in event.axes().iter() {
            if let Some(len) = self.bounds.get(axis) {
                if index >= *len {
                    return Err(AcqError::MonitorRejected {
                        axis: axis.to_string(),
                        reason: format!("index {} outside 0..{}", index, len),
                    });
                }
            }
        }
        if let (Some(wake), Some(at)) = (&self.wake, event.min_start_time()) {
            wake.set(at);
        }
        Ok(())
    }
}

/// Lazy, depth-first stream of the events for one timepoint.
pub struct ComposedEvents {
    factories: Vec<Arc<dyn AxisFactory>>,
    base: Option<AcquisitionEvent>,
    stack: Vec<AxisIter>,
    monitor: Box<dyn EventMonitor>,
    failed: bool,
}

impl ComposedEvents {
    /// Stream expanding `base` through `factories`, outermost first.
    pub fn new(
        factories: Vec<Arc<dyn AxisFactory>>,
        base: AcquisitionEvent,
        monitor: Box<dyn EventMonitor>,
    ) -> Self {
        Self {
            factories,
            base: Some(base),
            stack: Vec::new(),
            monitor,
            failed: false,
        }
    }

    fn monitored(&mut self, event: AcquisitionEvent) -> Option<AppResult<AcquisitionEvent>> {
        match self.monitor.check(&event) {
            Ok(()) => Some(Ok(event)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for ComposedEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedEvents")
            .field("axes", &self.factories.iter().map(|a| a.axis()).collect::<Vec<_>>())
            .field("depth", &self.stack.len())
            .field("failed", &self.failed)
            .finish()
    }
}

impl Iterator for ComposedEvents {
    type Item = AppResult<AcquisitionEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(base) = self.base.take() {
            // No axis at all: the base event is the only event.
            if self.factories.is_empty() {
                return self.monitored(base);
            }
            let outer = expand(&self.factories[0], base);
            self.stack.push(outer);
        }
        loop {
            let depth = self.stack.len();
            let next = self.stack.last_mut()?.next();
            match next {
                None => {
                    self.stack.pop();
                }
                Some(event) if depth == self.factories.len() => return self.monitored(event),
                Some(event) => {
                    let inner = expand(&self.factories[depth], event);
                    self.stack.push(inner);
                }
            }
        }
    }
}

/// Sequences one sub-acquisition.
#[derive(Debug, Clone)]
pub struct EventSequencer {
    acq_index: usize,
    factories: Vec<Arc<dyn AxisFactory>>,
    use_frames: bool,
    num_frames: u32,
    interval: Duration,
    bounds: BTreeMap<&'static str, u32>,
    wake: Option<NextWakeTime>,
}

impl EventSequencer {
    /// Build the axes of `settings` for sub-acquisition `acq_index`.
    ///
    /// `current_z_um` is the focus position used as origin for relative
    /// z-stacks. Fails for zero z-steps, inconsistent slice lists and
    /// position-outermost orders.
    pub fn new(
        settings: &AcquisitionSettings,
        positions: &PositionList,
        acq_index: usize,
        current_z_um: f64,
    ) -> AppResult<Self> {
        let order = settings.order();
        if !order.is_time_first() {
            return Err(AcqError::UnsupportedOrder(order));
        }

        let channels = settings.enabled_channels();
        let slice_count = if settings.use_slices() {
            Some(settings.slices().count()?)
        } else {
            None
        };

        let position_factory: Option<Arc<dyn AxisFactory>> =
            if settings.use_positions() && !positions.is_empty() {
                Some(Arc::new(position_axis(positions.clone(), acq_index)))
            } else {
                None
            };
        let channel_factory: Option<Arc<dyn AxisFactory>> = if channels.is_empty() {
            None
        } else {
            Some(Arc::new(channel_axis(
                channels.clone(),
                settings.channel_group(),
                slice_count,
                acq_index,
            )))
        };
        let z_factory: Option<Arc<dyn AxisFactory>> = if settings.use_slices() {
            Some(Arc::new(z_stack_axis(
                settings.slices(),
                current_z_um,
                channels,
                acq_index,
            )?))
        } else {
            None
        };

        let nested = match order {
            AcqOrderMode::TimePosChannelSlice => [position_factory, channel_factory, z_factory],
            _ => [position_factory, z_factory, channel_factory],
        };
        let factories: Vec<Arc<dyn AxisFactory>> = nested.into_iter().flatten().collect();

        let mut bounds: BTreeMap<&'static str, u32> =
            factories.iter().map(|f| (f.axis(), f.len())).collect();
        if settings.use_frames() {
            bounds.insert(TIME_AXIS, settings.num_frames());
        }

        Ok(Self {
            acq_index,
            factories,
            use_frames: settings.use_frames(),
            num_frames: settings.num_frames(),
            interval: settings.interval(),
            bounds,
            wake: None,
        })
    }

    /// Record minimum start times of sequenced events in `wake`.
    pub fn with_wake_tracker(mut self, wake: NextWakeTime) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Sub-acquisition this sequencer belongs to.
    pub fn acq_index(&self) -> usize {
        self.acq_index
    }

    /// Number of timepoints the driver iterates.
    pub fn timepoints(&self) -> u32 {
        if self.use_frames {
            self.num_frames
        } else {
            1
        }
    }

    /// Axis names from outermost to innermost, time excluded.
    pub fn axis_order(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.axis()).collect()
    }

    /// Events of timepoint `frame`.
    pub fn events_for_timepoint(&self, frame: u32) -> ComposedEvents {
        let mut base = AcquisitionEvent::new().with_acq_index(self.acq_index);
        if self.use_frames {
            base = base
                .with_axis_position(TIME_AXIS, frame)
                .with_min_start_time(self.interval * frame);
        }
        if self.use_frames && frame + 1 == self.num_frames {
            base = base.with_terminal(TIME_AXIS);
        }

        let mut monitor = BoundsMonitor::new(self.bounds.clone());
        if let Some(wake) = &self.wake {
            monitor = monitor.with_wake_tracker(wake.clone());
        }
        ComposedEvents::new(self.factories.clone(), base, Box::new(monitor))
    }

    /// Every event of the sub-acquisition, all timepoints in order.
    pub fn full_run(&self) -> impl Iterator<Item = AppResult<AcquisitionEvent>> {
        let sequencer = self.clone();
        (0..self.timepoints()).flat_map(move |frame| sequencer.events_for_timepoint(frame))
    }
}
