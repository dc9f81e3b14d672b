//! User runnables bound to acquisition coordinates.
//!
//! A [`RunnableBinding`] pairs a callback with a (frame, position, channel,
//! slice) predicate, where [`WILDCARD`] matches any index. Bindings live in a
//! [`RunnableRegistry`] shared with the [`RunnableDispatchHook`], so bindings
//! attached while a run is in progress take effect on the next event.

use crate::acquisition::event::AcquisitionEvent;
use crate::acquisition::hooks::{AcquisitionHook, HookError};
use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Index value matching any position along an axis.
pub const WILDCARD: i32 = -1;

/// Callback invoked for matching events.
pub type RunnableCallback = Arc<dyn Fn() + Send + Sync>;

/// A callback plus the coordinates at which it runs.
#[derive(Clone)]
pub struct RunnableBinding {
    /// Timepoint, or [`WILDCARD`].
    pub frame: i32,
    /// Stage position, or [`WILDCARD`].
    pub position: i32,
    /// Channel, or [`WILDCARD`].
    pub channel: i32,
    /// Slice, or [`WILDCARD`].
    pub slice: i32,
    callback: RunnableCallback,
}

impl RunnableBinding {
    /// Bind `callback` to the given indices.
    pub fn new(frame: i32, position: i32, channel: i32, slice: i32, callback: RunnableCallback) -> Self {
        Self {
            frame,
            position,
            channel,
            slice,
            callback,
        }
    }

    /// Whether all four predicates accept `event`.
    ///
    /// An axis the event does not carry matches any bound index.
    pub fn matches(&self, event: &AcquisitionEvent) -> bool {
        axis_matches(self.frame, event.time_index())
            && axis_matches(self.position, event.position_index())
            && axis_matches(self.channel, event.channel_index())
            && axis_matches(self.slice, event.z_index())
    }

    /// Invoke the callback, containing panics. Returns whether it completed.
    pub fn run(&self) -> bool {
        catch_unwind(AssertUnwindSafe(|| (self.callback)())).is_ok()
    }
}

fn axis_matches(bound: i32, actual: Option<u32>) -> bool {
    match actual {
        None => true,
        Some(index) => bound == WILDCARD || i64::from(bound) == i64::from(index),
    }
}

impl fmt::Debug for RunnableBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableBinding")
            .field("frame", &self.frame)
            .field("position", &self.position)
            .field("channel", &self.channel)
            .field("slice", &self.slice)
            .finish_non_exhaustive()
    }
}

/// Shared list of bindings.
#[derive(Clone, Default)]
pub struct RunnableRegistry {
    bindings: Arc<RwLock<Vec<RunnableBinding>>>,
}

impl RunnableRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn attach(&self, binding: RunnableBinding) {
        self.bindings.write().push(binding);
    }

    /// Remove every binding.
    pub fn clear(&self) {
        self.bindings.write().clear();
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    /// Whether no bindings are attached.
    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Copy of the current bindings, so callbacks run without holding the lock.
    pub fn snapshot(&self) -> Vec<RunnableBinding> {
        self.bindings.read().clone()
    }
}

impl fmt::Debug for RunnableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableRegistry")
            .field("bindings", &self.len())
            .finish()
    }
}

/// Hook running matching bindings once hardware is in position.
#[derive(Debug)]
pub struct RunnableDispatchHook {
    registry: RunnableRegistry,
    sub_acquisitions: usize,
    invoked: AtomicU64,
}

impl RunnableDispatchHook {
    /// Dispatch hook for a run with `sub_acquisitions` sub-acquisitions.
    pub fn new(registry: RunnableRegistry, sub_acquisitions: usize) -> Self {
        Self {
            registry,
            sub_acquisitions,
            invoked: AtomicU64::new(0),
        }
    }

    /// Number of callbacks invoked so far.
    pub fn invoked(&self) -> u64 {
        self.invoked.load(Ordering::Relaxed)
    }
}

impl AcquisitionHook for RunnableDispatchHook {
    fn name(&self) -> &str {
        "user-runnables"
    }

    fn run(&self, event: AcquisitionEvent) -> Result<AcquisitionEvent, HookError> {
        let Some(acq_index) = event.acq_index() else {
            warn!("Event carries no sub-acquisition tag; skipping runnables");
            return Ok(event);
        };
        if acq_index >= self.sub_acquisitions {
            error!(
                acq_index,
                known = self.sub_acquisitions,
                "Event tagged for an unknown sub-acquisition; skipping runnables"
            );
            return Ok(event);
        }

        for binding in self.registry.snapshot() {
            if !binding.matches(&event) {
                continue;
            }
            trace!(?binding, acq_index, "Running attached runnable");
            self.invoked.fetch_add(1, Ordering::Relaxed);
            if !binding.run() {
                error!(?binding, "Attached runnable panicked");
            }
        }
        Ok(event)
    }
}
