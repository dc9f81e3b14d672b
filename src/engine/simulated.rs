//! In-process acquisition engine.
//!
//! Executes events against a [`MicroscopeCore`]: applies the preset and
//! exposure, moves the stages, snaps the camera and sends the tagged image.
//! Waiting for an event's start time and waiting while paused are both
//! chunked so abort is noticed promptly.

use crate::acquisition::event::AcquisitionEvent;
use crate::acquisition::hooks::{HookDispatcher, HookStage};
use crate::acquisition::sequencer::ComposedEvents;
use crate::config::EngineTimingConfig;
use crate::data::image::{ImageTags, TaggedImage};
use crate::data::sink::SinkMessage;
use crate::engine::AcquisitionEngine;
use crate::error::{AcqError, AppResult};
use crate::hardware::MicroscopeCore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, instrument, trace};

struct ActiveRun {
    hooks: Arc<HookDispatcher>,
    output: mpsc::Sender<SinkMessage>,
    started_at: Instant,
}

/// Engine executing events against a [`MicroscopeCore`].
pub struct SimulatedEngine {
    core: Arc<dyn MicroscopeCore>,
    run: Mutex<Option<ActiveRun>>,
    abort_requested: AtomicBool,
    paused: AtomicBool,
    events_finished: AtomicBool,
    executed: AtomicU64,
    pause_poll: Duration,
    wait_slice: Duration,
}

impl SimulatedEngine {
    /// Engine with default timing.
    pub fn new(core: Arc<dyn MicroscopeCore>) -> Self {
        Self::with_timing(core, &EngineTimingConfig::default())
    }

    /// Engine with the given poll intervals.
    pub fn with_timing(core: Arc<dyn MicroscopeCore>, timing: &EngineTimingConfig) -> Self {
        Self {
            core,
            run: Mutex::new(None),
            abort_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            events_finished: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            pause_poll: Duration::from_millis(timing.pause_poll_ms.max(1)),
            wait_slice: Duration::from_millis(timing.wait_slice_ms.max(1)),
        }
    }

    /// Events executed since the engine was created.
    pub fn events_executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    async fn wait_while_paused(&self) {
        if !self.is_paused() {
            return;
        }
        info!("Engine paused");
        while self.is_paused() && !self.is_abort_requested() {
            sleep(self.pause_poll).await;
        }
        info!(aborted = self.is_abort_requested(), "Engine resumed");
    }

    /// Sleep until `deadline`, returning early on abort.
    async fn wait_until(&self, deadline: Instant) {
        loop {
            if self.is_abort_requested() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            sleep(self.wait_slice.min(deadline - now)).await;
        }
    }

    fn apply_hardware(&self, event: &AcquisitionEvent) -> AppResult<()> {
        if let Some(channel) = event.channel() {
            self.core.set_config(&channel.group, &channel.preset)?;
            self.core.set_exposure_ms(channel.exposure_ms)?;
        }
        if let Some((x, y)) = event.xy_um() {
            self.core.set_xy_position(x, y)?;
        }
        if let Some(z) = event.z_um() {
            let device = self.core.focus_device().ok_or_else(|| {
                AcqError::Hardware("event moves focus but no focus device is set".into())
            })?;
            self.core.set_position(&device, z)?;
        }
        Ok(())
    }

    fn tags_for(&self, event: &AcquisitionEvent, started_at: Instant) -> AppResult<ImageTags> {
        Ok(ImageTags {
            acq_index: event.acq_index(),
            axes: event.axes().clone(),
            terminal_axes: event.terminal_axes().clone(),
            geometry: self.core.image_geometry(),
            camera: self.core.camera_device(),
            exposure_ms: self.core.exposure_ms()?,
            channel_name: event.channel().map(|c| c.preset.clone()),
            z_um: event.z_um(),
            xy_um: event.xy_um(),
            position_name: event.position_label().map(str::to_string),
            elapsed_ms: started_at.elapsed().as_secs_f64() * 1000.0,
            extra: event.tags().clone(),
        })
    }

    async fn execute(
        &self,
        hooks: &HookDispatcher,
        output: &mpsc::Sender<SinkMessage>,
        started_at: Instant,
        event: AcquisitionEvent,
    ) -> AppResult<()> {
        let event = hooks.dispatch(HookStage::BeforeHardware, event);
        self.apply_hardware(&event)?;
        let event = hooks.dispatch(HookStage::AfterHardware, event);
        let event = hooks.dispatch(HookStage::AfterCamera, event);

        let pixels = self.core.snap_image()?;
        let tags = self.tags_for(&event, started_at)?;
        hooks.dispatch(HookStage::AfterExposure, event);

        output
            .send(SinkMessage::Image(TaggedImage { pixels, tags }))
            .await
            .map_err(|_| AcqError::Engine("image output channel closed".to_string()))?;
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn active(&self) -> AppResult<(Arc<HookDispatcher>, mpsc::Sender<SinkMessage>, Instant)> {
        let run = self.run.lock();
        let run = run
            .as_ref()
            .ok_or_else(|| AcqError::Engine("engine was not started".to_string()))?;
        Ok((run.hooks.clone(), run.output.clone(), run.started_at))
    }
}

#[async_trait]
impl AcquisitionEngine for SimulatedEngine {
    async fn start(&self, hooks: Arc<HookDispatcher>, output: mpsc::Sender<SinkMessage>) -> AppResult<()> {
        let mut run = self.run.lock();
        if run.is_some() {
            return Err(AcqError::Engine(
                "engine is already running an acquisition".to_string(),
            ));
        }
        self.abort_requested.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.events_finished.store(false, Ordering::SeqCst);
        *run = Some(ActiveRun {
            hooks,
            output,
            started_at: Instant::now(),
        });
        debug!("Simulated engine started");
        Ok(())
    }

    #[instrument(skip(self, events), err)]
    async fn submit(&self, events: ComposedEvents) -> AppResult<()> {
        let (hooks, output, started_at) = self.active()?;

        for item in events {
            if self.is_abort_requested() {
                debug!("Abort requested; skipping remaining events");
                break;
            }
            let event = item?;

            self.wait_while_paused().await;
            if let Some(offset) = event.min_start_time() {
                self.wait_until(started_at + offset).await;
            }
            if self.is_abort_requested() {
                break;
            }

            trace!(axes = ?event.axes(), "Executing event");
            self.execute(&hooks, &output, started_at, event).await?;
        }
        Ok(())
    }

    async fn finish(&self) -> AppResult<()> {
        let run = self.run.lock().take();
        self.events_finished.store(true, Ordering::SeqCst);
        if let Some(run) = run {
            run.hooks.close_all();
            // The sink may already be gone after a fatal error.
            if run.output.send(SinkMessage::Finished).await.is_err() {
                debug!("Output channel closed before end-of-stream");
            }
        }
        debug!(executed = self.events_executed(), "Simulated engine finished");
        Ok(())
    }

    fn abort(&self) {
        info!("Abort requested");
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn are_events_finished(&self) -> bool {
        self.events_finished.load(Ordering::SeqCst)
    }
}
