//! Acquisition hooks.
//!
//! Hooks are synchronous callbacks the engine runs at four fixed points of every
//! event. A hook receives the event and returns the event to continue with. A
//! failing or panicking hook never aborts the acquisition: the dispatcher logs
//! the failure and continues with the event as it was before the hook ran.

use crate::acquisition::event::AcquisitionEvent;
use crate::error::AcqError;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Point in the execution of an event at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookStage {
    /// Before any hardware is moved.
    BeforeHardware,
    /// Hardware is in position, camera not yet started.
    AfterHardware,
    /// Camera armed, exposure about to begin.
    AfterCamera,
    /// Exposure complete.
    AfterExposure,
}

impl HookStage {
    /// Every stage, in execution order.
    pub const ALL: [HookStage; 4] = [
        HookStage::BeforeHardware,
        HookStage::AfterHardware,
        HookStage::AfterCamera,
        HookStage::AfterExposure,
    ];
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::BeforeHardware => write!(f, "before-hardware"),
            HookStage::AfterHardware => write!(f, "after-hardware"),
            HookStage::AfterCamera => write!(f, "after-camera"),
            HookStage::AfterExposure => write!(f, "after-exposure"),
        }
    }
}

/// Failure reported by a hook.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct HookError {
    reason: String,
}

impl HookError {
    /// Hook failure with a message.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<AcqError> for HookError {
    fn from(err: AcqError) -> Self {
        Self::new(err.to_string())
    }
}

/// A callback run by the engine at one [`HookStage`].
pub trait AcquisitionHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process `event` and return the event to continue with.
    fn run(&self, event: AcquisitionEvent) -> Result<AcquisitionEvent, HookError>;

    /// Called once when the acquisition ends.
    fn close(&self) {}
}

/// Hook backed by a closure.
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> AcquisitionHook for FnHook<F>
where
    F: Fn(AcquisitionEvent) -> Result<AcquisitionEvent, HookError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, event: AcquisitionEvent) -> Result<AcquisitionEvent, HookError> {
        (self.f)(event)
    }
}

/// Wrap a closure as a hook.
pub fn hook_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn AcquisitionHook>
where
    F: Fn(AcquisitionEvent) -> Result<AcquisitionEvent, HookError> + Send + Sync + 'static,
{
    Arc::new(FnHook {
        name: name.into(),
        f,
    })
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Per-run registry of hooks, invoked by the engine.
#[derive(Default)]
pub struct HookDispatcher {
    hooks: RwLock<BTreeMap<HookStage, Vec<Arc<dyn AcquisitionHook>>>>,
    installed: Mutex<HashSet<String>>,
    failures: AtomicU64,
}

impl HookDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `hook` at `stage`. Hooks at one stage run in installation order.
    pub fn install(&self, stage: HookStage, hook: Arc<dyn AcquisitionHook>) {
        debug!(hook = hook.name(), %stage, "Installing acquisition hook");
        self.hooks.write().entry(stage).or_default().push(hook);
    }

    /// Add `hook` unless a hook was already installed under `key`.
    ///
    /// Returns whether the hook was installed.
    pub fn install_once(&self, key: &str, stage: HookStage, hook: Arc<dyn AcquisitionHook>) -> bool {
        if !self.installed.lock().insert(key.to_string()) {
            debug!(key, "Hook already installed");
            return false;
        }
        self.install(stage, hook);
        true
    }

    /// Number of hooks at `stage`.
    pub fn hook_count(&self, stage: HookStage) -> usize {
        self.hooks.read().get(&stage).map_or(0, Vec::len)
    }

    /// Number of hook invocations that failed or panicked.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run every hook at `stage` on `event`.
    pub fn dispatch(&self, stage: HookStage, event: AcquisitionEvent) -> AcquisitionEvent {
        let hooks = match self.hooks.read().get(&stage) {
            Some(hooks) => hooks.clone(),
            None => return event,
        };

        let mut current = event;
        for hook in hooks {
            let before = current.clone();
            match catch_unwind(AssertUnwindSafe(|| hook.run(current))) {
                Ok(Ok(next)) => current = next,
                Ok(Err(err)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(hook = hook.name(), %stage, error = %err, "Acquisition hook failed");
                    current = before;
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(hook = hook.name(), %stage, "Acquisition hook panicked");
                    current = before;
                }
            }
        }
        current
    }

    /// Close every installed hook and empty the dispatcher.
    pub fn close_all(&self) {
        let hooks = std::mem::take(&mut *self.hooks.write());
        self.installed.lock().clear();
        for hook in hooks.into_values().flatten() {
            if catch_unwind(AssertUnwindSafe(|| hook.close())).is_err() {
                error!(hook = hook.name(), "Acquisition hook panicked while closing");
            }
        }
    }
}

impl fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        let counts: BTreeMap<HookStage, usize> =
            hooks.iter().map(|(stage, list)| (*stage, list.len())).collect();
        f.debug_struct("HookDispatcher")
            .field("hooks", &counts)
            .field("failures", &self.failures())
            .finish()
    }
}
