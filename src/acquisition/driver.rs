//! Acquisition driver: runs a batch of sub-acquisitions end to end.
//!
//! A run goes through four phases:
//!
//! 1. **Validate** configuration (before any hardware call) and resources
//!    (save directories, disk space; may prompt the user).
//! 2. **Start**: allocate one datastore and pipeline per sub-acquisition,
//!    spawn the data sink, snapshot focus and continuous-focus state,
//!    subscribe to shutdown requests and post `AcquisitionStarted`.
//! 3. **Drive**: for every timepoint and every sub-acquisition, build a fresh
//!    event stream and submit it to the engine, stopping once abort is
//!    requested.
//! 4. **Finish**: end the engine stream, wait for the sink, restore hardware
//!    state and return to [`DriverState::Idle`]. The same teardown runs when
//!    Start or Drive fail, so listeners always see `AcquisitionEnded` for
//!    every sub-acquisition that was announced.

use crate::acquisition::event::AcquisitionEvent;
use crate::acquisition::hooks::{HookDispatcher, HookStage};
use crate::acquisition::position::PositionList;
use crate::acquisition::runnables::{RunnableBinding, RunnableDispatchHook, RunnableRegistry};
use crate::acquisition::sequencer::{EventSequencer, NextWakeTime};
use crate::acquisition::settings::AcquisitionSettings;
use crate::acquisition::state::DriverState;
use crate::acquisition::summary::{summary_metadata, total_memory};
use crate::acquisition::system_hooks::{AutofocusHook, ZRestoreHook};
use crate::context::AppContext;
use crate::data::datastore::{Datastore, StoreRequest};
use crate::data::sink::{DataSink, SinkContext, SinkHandle, SinkMessage, SubAcquisition};
use crate::engine::AcquisitionEngine;
use crate::error::{AcqError, AppResult};
use crate::events::{AcquisitionEnded, AcquisitionStarted, ShutdownCommencing, SubscriptionId};
use crate::hardware::is_config_available;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Routes of the active run, shared with prompts and the shutdown handler.
struct RunContext {
    run_id: Uuid,
    routes: Arc<[SubAcquisition]>,
}

/// Focus position captured at run start.
#[derive(Debug, Clone)]
struct FocusSnapshot {
    device: String,
    position_um: f64,
}

/// Everything a run acquires that teardown has to release.
#[derive(Default)]
struct RunResources {
    run_id: Uuid,
    routes: Option<Arc<[SubAcquisition]>>,
    output: Option<mpsc::Sender<SinkMessage>>,
    sink: Option<SinkHandle>,
    focus: Option<FocusSnapshot>,
    continuous_focus_was_on: Option<bool>,
    shutdown_sub: Option<SubscriptionId>,
    started_posted: bool,
}

struct DriverInner {
    ctx: AppContext,
    engine: Arc<dyn AcquisitionEngine>,
    state: RwLock<DriverState>,
    runnables: RunnableRegistry,
    run: Mutex<Option<RunContext>>,
    wake: NextWakeTime,
    /// Set by every abort of the current run, including before the engine starts.
    abort_pending: AtomicBool,
}

/// Runs multi-dimensional acquisitions.
///
/// Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct AcquisitionDriver {
    inner: Arc<DriverInner>,
}

impl AcquisitionDriver {
    /// Driver executing through `engine` with the collaborators in `ctx`.
    pub fn new(ctx: AppContext, engine: Arc<dyn AcquisitionEngine>) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                ctx,
                engine,
                state: RwLock::new(DriverState::Idle),
                runnables: RunnableRegistry::new(),
                run: Mutex::new(None),
                wake: NextWakeTime::default(),
                abort_pending: AtomicBool::new(false),
            }),
        }
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Run every sub-acquisition of `subs`, using the timing of `master`.
    ///
    /// `position_lists` holds one list per sub-acquisition. Returns the
    /// datastores, in sub-acquisition order, once the run has finished or was
    /// aborted.
    #[instrument(skip_all, fields(subs = subs.len()), err)]
    pub async fn run_acquisition(
        &self,
        master: &AcquisitionSettings,
        subs: &[AcquisitionSettings],
        position_lists: &[PositionList],
    ) -> AppResult<Vec<Arc<dyn Datastore>>> {
        if self.inner.ctx.ui.is_ui_thread() {
            return Err(AcqError::CalledOnUiThread);
        }
        {
            let mut state = self.inner.state.write();
            if *state != DriverState::Idle {
                return Err(AcqError::InvalidState(format!(
                    "cannot start an acquisition while {}",
                    *state
                )));
            }
            *state = DriverState::Validating;
            self.inner.abort_pending.store(false, Ordering::SeqCst);
        }

        let settings = match self.validate(master, subs, position_lists) {
            Ok(settings) => settings,
            Err(err) => {
                if !matches!(err, AcqError::Cancelled) {
                    self.inner.ctx.ui.show_error(&err.to_string());
                }
                self.set_state(DriverState::Idle);
                return Err(err);
            }
        };

        if self.inner.abort_pending.load(Ordering::SeqCst) {
            info!("Acquisition stopped during validation");
            self.set_state(DriverState::Idle);
            return Err(AcqError::Cancelled);
        }

        let mut resources = RunResources {
            run_id: Uuid::new_v4(),
            ..Default::default()
        };
        info!(run_id = %resources.run_id, subs = settings.len(), "Starting acquisition");

        let outcome = self
            .start_and_drive(&settings, position_lists, &mut resources)
            .await;
        if let Err(err) = &outcome {
            error!(run_id = %resources.run_id, error = %err, "Acquisition failed");
            self.inner
                .ctx
                .ui
                .show_error(&format!("Acquisition failed: {}", err));
            self.inner.engine.abort();
        }

        let stores = resources
            .routes
            .as_ref()
            .map(|routes| routes.iter().map(|s| s.store.clone()).collect())
            .unwrap_or_default();
        self.teardown(resources).await;
        outcome.map(|()| stores)
    }

    fn validate(
        &self,
        master: &AcquisitionSettings,
        subs: &[AcquisitionSettings],
        position_lists: &[PositionList],
    ) -> AppResult<Vec<AcquisitionSettings>> {
        let settings = self.validate_configuration(master, subs, position_lists)?;
        self.validate_resources(&settings, position_lists)?;
        Ok(settings)
    }

    fn validate_configuration(
        &self,
        master: &AcquisitionSettings,
        subs: &[AcquisitionSettings],
        position_lists: &[PositionList],
    ) -> AppResult<Vec<AcquisitionSettings>> {
        if subs.is_empty() {
            return Err(AcqError::NoSubAcquisitions);
        }
        if position_lists.len() != subs.len() {
            return Err(AcqError::PositionListMismatch {
                expected: subs.len(),
                actual: position_lists.len(),
            });
        }

        let core = self.inner.ctx.core.as_ref();
        let mut merged = Vec::with_capacity(subs.len());
        for (acq_index, sub) in subs.iter().enumerate() {
            let settings = sub.with_timing_from(master);
            if settings.use_custom_intervals() {
                return Err(AcqError::CustomIntervalsUnsupported(acq_index));
            }
            settings.validate()?;

            for channel in settings.enabled_channels() {
                let group = [channel.channel_group.clone(), settings.channel_group().to_string()]
                    .into_iter()
                    .find(|g| !g.is_empty())
                    .unwrap_or_else(|| core.channel_group());
                if !is_config_available(core, &group, &channel.config) {
                    return Err(AcqError::Configuration(format!(
                        "channel '{}' is not a preset of group '{}'",
                        channel.config, group
                    )));
                }
            }
            merged.push(settings);
        }
        Ok(merged)
    }

    /// Save directories exist (or are created on request) and have room for
    /// the whole run.
    fn validate_resources(
        &self,
        settings: &[AcquisitionSettings],
        position_lists: &[PositionList],
    ) -> AppResult<()> {
        let ctx = &self.inner.ctx;
        let geometry = ctx.core.image_geometry();

        let mut required: BTreeMap<PathBuf, u64> = BTreeMap::new();
        for (sub, positions) in settings.iter().zip(position_lists) {
            if !sub.save() {
                continue;
            }
            let bytes = total_memory(sub, positions, geometry)?;
            let total = required.entry(sub.root().to_path_buf()).or_default();
            *total = total.saturating_add(bytes);
        }

        for (root, bytes) in required {
            if !root.is_dir() {
                let create = ctx.ui.confirm(
                    "Create directory?",
                    &format!("The directory {} does not exist. Create it?", root.display()),
                );
                if !create {
                    return Err(AcqError::Cancelled);
                }
                if let Err(err) = std::fs::create_dir_all(&root) {
                    warn!(root = %root.display(), error = %err, "Could not create save directory");
                    return Err(AcqError::UnwritableDirectory(root));
                }
            }
            let readonly = std::fs::metadata(&root)
                .map(|m| m.permissions().readonly())
                .unwrap_or(true);
            if readonly {
                return Err(AcqError::UnwritableDirectory(root));
            }

            let needed = (bytes as f64 * ctx.config.storage.disk_space_factor).ceil() as u64;
            let available = ctx.disk.usable_space(&root)?;
            debug!(root = %root.display(), needed, available, "Disk space check");
            if needed > available {
                return Err(AcqError::InsufficientDiskSpace {
                    required: needed,
                    available,
                });
            }
        }
        Ok(())
    }

    async fn start_and_drive(
        &self,
        settings: &[AcquisitionSettings],
        position_lists: &[PositionList],
        resources: &mut RunResources,
    ) -> AppResult<()> {
        let hooks = self.start(settings, position_lists, resources)?;
        self.set_state(DriverState::Running);

        let output = resources
            .output
            .take()
            .ok_or_else(|| AcqError::Engine("engine output already handed out".to_string()))?;
        self.inner.engine.start(hooks, output).await?;
        // Starting the engine resets its abort flag.
        if self.inner.abort_pending.load(Ordering::SeqCst) {
            self.inner.engine.abort();
        }
        self.drive(settings, position_lists).await
    }

    fn start(
        &self,
        settings: &[AcquisitionSettings],
        position_lists: &[PositionList],
        resources: &mut RunResources,
    ) -> AppResult<Arc<HookDispatcher>> {
        let ctx = &self.inner.ctx;
        let run_id = resources.run_id;
        let geometry = ctx.core.image_geometry();
        let camera = ctx.core.camera_device();

        let mut routes = Vec::with_capacity(settings.len());
        for (acq_index, (sub, positions)) in settings.iter().zip(position_lists).enumerate() {
            let request = StoreRequest {
                acq_index,
                root: sub.save().then(|| sub.root().to_path_buf()),
                prefix: sub.prefix().to_string(),
                display: sub.should_display_images(),
            };
            let (store, pipeline) = ctx.storage.create(&request)?;
            store.set_summary_metadata(summary_metadata(sub, positions, geometry, &camera, run_id)?)?;
            routes.push(SubAcquisition {
                acq_index,
                store,
                pipeline,
            });
        }
        let routes: Arc<[SubAcquisition]> = routes.into();
        resources.routes = Some(routes.clone());

        let (tx, rx) = mpsc::channel(ctx.config.sink.channel_capacity.max(1));
        resources.output = Some(tx);
        let engine = self.inner.engine.clone();
        resources.sink = Some(DataSink::spawn(
            rx,
            routes.clone(),
            SinkContext {
                run_id,
                events: ctx.events.clone(),
                ui: ctx.ui.clone(),
            },
            Box::new(move || engine.abort()),
        )?);

        if let Some(device) = ctx.core.focus_device() {
            let position_um = ctx.core.position(&device)?;
            resources.focus = Some(FocusSnapshot {
                device,
                position_um,
            });
        }
        resources.continuous_focus_was_on = ctx
            .autofocus
            .as_ref()
            .map(|af| af.is_continuous_focus_enabled());

        *self.inner.run.lock() = Some(RunContext {
            run_id,
            routes: routes.clone(),
        });
        let weak: Weak<DriverInner> = Arc::downgrade(&self.inner);
        resources.shutdown_sub = Some(ctx.events.on_shutdown(move |request| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_shutdown(request);
            }
        }));

        for (sub, route) in settings.iter().zip(routes.iter()) {
            ctx.events.post_started(AcquisitionStarted {
                run_id,
                acq_index: route.acq_index,
                store: route.store.clone(),
                settings: sub.clone(),
            });
        }
        resources.started_posted = true;

        Ok(self.install_hooks(settings, resources.focus.as_ref()))
    }

    fn install_hooks(
        &self,
        settings: &[AcquisitionSettings],
        focus: Option<&FocusSnapshot>,
    ) -> Arc<HookDispatcher> {
        let ctx = &self.inner.ctx;
        let hooks = Arc::new(HookDispatcher::new());

        if let Some(autofocus) = &ctx.autofocus {
            let skip_frames: HashMap<usize, u32> = settings
                .iter()
                .enumerate()
                .filter(|(_, s)| s.autofocus().enabled)
                .map(|(i, s)| (i, s.autofocus().skip_frames))
                .collect();
            if !skip_frames.is_empty() {
                hooks.install_once(
                    "autofocus",
                    HookStage::BeforeHardware,
                    Arc::new(AutofocusHook::new(autofocus.clone(), skip_frames)),
                );
            }
        }

        if let Some(focus) = focus {
            let stacked: HashSet<usize> = settings
                .iter()
                .enumerate()
                .filter(|(_, s)| s.use_slices())
                .map(|(i, _)| i)
                .collect();
            if !stacked.is_empty() {
                hooks.install_once(
                    "z-restore",
                    HookStage::AfterExposure,
                    Arc::new(ZRestoreHook::new(
                        ctx.core.clone(),
                        focus.device.clone(),
                        focus.position_um,
                        stacked,
                    )),
                );
            }
        }

        hooks.install_once(
            "runnables",
            HookStage::AfterHardware,
            Arc::new(RunnableDispatchHook::new(
                self.inner.runnables.clone(),
                settings.len(),
            )),
        );
        hooks
    }

    async fn drive(
        &self,
        settings: &[AcquisitionSettings],
        position_lists: &[PositionList],
    ) -> AppResult<()> {
        let engine = &self.inner.engine;
        let core = &self.inner.ctx.core;

        // Sub-acquisitions share the master timing.
        let timepoints = settings
            .iter()
            .map(|s| if s.use_frames() { s.num_frames() } else { 1 })
            .max()
            .unwrap_or(0);

        'frames: for frame in 0..timepoints {
            for (acq_index, (sub, positions)) in settings.iter().zip(position_lists).enumerate() {
                if engine.is_abort_requested() {
                    info!(frame, acq_index, "Abort requested; no further events submitted");
                    break 'frames;
                }

                let current_z = match (sub.use_slices() && sub.slices().relative, core.focus_device()) {
                    (true, Some(device)) => core.position(&device)?,
                    _ => 0.0,
                };
                let sequencer = EventSequencer::new(sub, positions, acq_index, current_z)?
                    .with_wake_tracker(self.inner.wake.clone());
                if frame >= sequencer.timepoints() {
                    continue;
                }
                debug!(frame, acq_index, axes = ?sequencer.axis_order(), "Submitting timepoint");
                engine.submit(sequencer.events_for_timepoint(frame)).await?;
            }
        }
        Ok(())
    }

    /// Release everything `resources` holds and return to `Idle`.
    async fn teardown(&self, mut resources: RunResources) {
        let ctx = &self.inner.ctx;
        self.set_state(DriverState::Finishing);

        if let Err(err) = self.inner.engine.finish().await {
            warn!(error = %err, "Engine did not finish cleanly");
        }
        // Closes the channel if the engine never took it.
        drop(resources.output.take());

        let mut ended_posted = false;
        if let Some(sink) = resources.sink.take() {
            match sink.join().await {
                Ok(report) => {
                    ended_posted = report.ended_posted;
                    if !report.anything_acquired {
                        warn!(run_id = %resources.run_id, "No images were acquired");
                    }
                    info!(
                        run_id = %resources.run_id,
                        routed = report.images_routed,
                        dropped = report.images_dropped,
                        failed = report.failed_inserts,
                        "Acquisition data flushed"
                    );
                }
                Err(err) => error!(error = %err, "Data sink failed"),
            }
        }

        if resources.started_posted && !ended_posted {
            if let Some(routes) = &resources.routes {
                for route in routes.iter() {
                    route.pipeline.halt();
                    route.store.lock();
                    ctx.events.post_ended(AcquisitionEnded {
                        run_id: resources.run_id,
                        acq_index: route.acq_index,
                        store: route.store.clone(),
                    });
                }
            }
        }

        if let Some(focus) = resources.focus.take() {
            if let Err(err) = ctx.core.set_position(&focus.device, focus.position_um) {
                warn!(device = %focus.device, error = %err, "Could not restore focus position");
            }
        }
        if let (Some(autofocus), Some(was_on)) = (&ctx.autofocus, resources.continuous_focus_was_on) {
            if let Err(err) = autofocus.enable_continuous_focus(was_on) {
                warn!(device = autofocus.name(), error = %err, "Could not restore continuous focus");
            }
        }
        if let Some(id) = resources.shutdown_sub.take() {
            ctx.events.unregister(id);
        }

        *self.inner.run.lock() = None;
        self.inner.wake.clear();
        self.set_state(DriverState::Idle);
        info!(run_id = %resources.run_id, "Acquisition finished");
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Stop the running acquisition after the in-flight event.
    pub fn stop(&self, interrupted: bool) {
        if !self.is_running() {
            return;
        }
        info!(interrupted, "Stopping acquisition");
        self.inner.abort();
    }

    /// Ask the user to confirm aborting; abort when every store is confirmed.
    ///
    /// Returns whether the acquisition was aborted.
    pub fn abort_request(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let names: Vec<String> = self
            .inner
            .run
            .lock()
            .as_ref()
            .map(|run| run.routes.iter().map(|s| s.store.name().to_string()).collect())
            .unwrap_or_default();
        for name in names {
            let confirmed = self.inner.ctx.ui.confirm(
                "Abort acquisition?",
                &format!("Do you really want to abort acquisition '{}'?", name),
            );
            if !confirmed {
                return false;
            }
        }
        self.stop(true);
        true
    }

    /// Pause or resume the engine.
    pub fn set_pause(&self, paused: bool) {
        let next = {
            let state = *self.inner.state.read();
            match (state, paused) {
                (DriverState::Running, true) => DriverState::Paused,
                (DriverState::Paused, false) => DriverState::Running,
                _ => return,
            }
        };
        self.inner.engine.set_paused(paused);
        self.set_state(next);
    }

    /// Whether the engine is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.engine.is_paused()
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Whether abort was requested for the current run.
    pub fn abort_requested(&self) -> bool {
        self.inner.engine.is_abort_requested()
    }

    /// Whether the engine finished its last run.
    pub fn is_finished(&self) -> bool {
        self.inner.engine.are_events_finished()
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> DriverState {
        *self.inner.state.read()
    }

    /// Identifier of the run in progress.
    pub fn run_id(&self) -> Option<Uuid> {
        self.inner.run.lock().as_ref().map(|run| run.run_id)
    }

    /// Minimum start time of the most recently sequenced event, relative to
    /// the start of the run.
    pub fn next_wake_time(&self) -> Option<Duration> {
        self.inner.wake.get()
    }

    // =========================================================================
    // Runnables
    // =========================================================================

    /// Run `callback` whenever an event matches the given indices (`-1` for any).
    pub fn attach_runnable<F>(&self, frame: i32, position: i32, channel: i32, slice: i32, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.runnables.attach(RunnableBinding::new(
            frame,
            position,
            channel,
            slice,
            Arc::new(callback),
        ));
    }

    /// Remove every attached runnable.
    pub fn clear_runnables(&self) {
        self.inner.runnables.clear();
    }

    /// Number of attached runnables.
    pub fn runnable_count(&self) -> usize {
        self.inner.runnables.len()
    }

    /// Whether any attached runnable matches `event`.
    pub fn has_runnable_for(&self, event: &AcquisitionEvent) -> bool {
        self.inner
            .runnables
            .snapshot()
            .iter()
            .any(|binding| binding.matches(event))
    }

    fn set_state(&self, next: DriverState) {
        self.inner.set_state(next);
    }
}

impl DriverInner {
    fn set_state(&self, next: DriverState) {
        let mut state = self.state.write();
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            debug!(from = %*state, to = %next, "Unusual driver state transition");
        }
        debug!(from = %*state, to = %next, "Driver state change");
        *state = next;
    }

    fn abort(&self) {
        self.abort_pending.store(true, Ordering::SeqCst);
        self.engine.abort();
        let state = *self.state.read();
        if state.is_running() {
            self.set_state(DriverState::Aborting);
        }
    }

    fn handle_shutdown(&self, request: &ShutdownCommencing) {
        if !self.state.read().is_active() {
            return;
        }
        let discard = self.ctx.ui.confirm(
            "Acquisition in progress",
            "An acquisition is running. Exit and discard the acquired data?",
        );
        if discard {
            info!("Shutdown confirmed; aborting acquisition");
            self.abort();
        } else {
            info!("Shutdown cancelled by user");
            request.cancel_shutdown();
        }
    }
}

impl std::fmt::Debug for AcquisitionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionDriver")
            .field("state", &self.state())
            .field("runnables", &self.runnable_count())
            .finish_non_exhaustive()
    }
}
