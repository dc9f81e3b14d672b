//! Data sink: routes engine output into per-sub-acquisition pipelines.
//!
//! The sink owns the receiving end of the engine's output channel and runs
//! on its own named thread, blocking until an image or
//! [`SinkMessage::Finished`] arrives. Each image is routed by its
//! sub-acquisition tag, converted to an [`Image`] and inserted into that
//! sub-acquisition's pipeline.
//!
//! Per-image failures (missing tag, unknown index, malformed pixels, a
//! pipeline error) drop that image and keep going. Running out of memory
//! while converting is fatal: the user is told, `on_fatal` runs (the driver
//! passes an engine abort) and the remaining images are drained unprocessed.

use crate::acquisition::event::AxisPositions;
use crate::data::coords::Coords;
use crate::data::datastore::{Datastore, Pipeline};
use crate::data::image::{ConversionError, Image, TaggedImage};
use crate::error::{AcqError, AppResult};
use crate::events::{AcquisitionEnded, EventBus};
use crate::ui::UserInterface;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name of the sink thread.
pub const SINK_THREAD_NAME: &str = "mda-sink";

/// What the engine sends to the sink.
#[derive(Debug)]
pub enum SinkMessage {
    /// An acquired image.
    Image(TaggedImage),
    /// No more images will follow.
    Finished,
}

/// Storage of one sub-acquisition.
#[derive(Clone)]
pub struct SubAcquisition {
    /// Index of the sub-acquisition, equal to its position in the routes.
    pub acq_index: usize,
    #[allow(missing_docs)]
    pub store: Arc<dyn Datastore>,
    #[allow(missing_docs)]
    pub pipeline: Arc<dyn Pipeline>,
}

impl std::fmt::Debug for SubAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAcquisition")
            .field("acq_index", &self.acq_index)
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}

/// Collaborators of the sink thread.
#[derive(Clone)]
pub struct SinkContext {
    /// Run the images belong to.
    pub run_id: Uuid,
    /// Where acquisition-ended events are posted.
    pub events: Arc<EventBus>,
    /// Where insertion errors and fatal conditions are reported.
    pub ui: Arc<dyn UserInterface>,
}

/// Callback run once when the sink hits a fatal error.
pub type FatalCallback = Box<dyn Fn() + Send + 'static>;

#[derive(Debug, Default)]
struct SinkStats {
    anything_acquired: AtomicBool,
    routed: AtomicU64,
    dropped: AtomicU64,
    failed_inserts: AtomicU64,
    fatal: AtomicBool,
    ended_posted: AtomicBool,
}

/// Outcome of a sink run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkReport {
    /// At least one image reached a datastore.
    pub anything_acquired: bool,
    /// Images inserted successfully.
    pub images_routed: u64,
    /// Images discarded before reaching a pipeline.
    pub images_dropped: u64,
    /// Images a pipeline refused.
    pub failed_inserts: u64,
    /// Whether the sink stopped on a fatal error.
    pub fatal: bool,
    /// Whether acquisition-ended events were posted by the sink.
    pub ended_posted: bool,
}

impl SinkStats {
    fn report(&self) -> SinkReport {
        SinkReport {
            anything_acquired: self.anything_acquired.load(Ordering::SeqCst),
            images_routed: self.routed.load(Ordering::SeqCst),
            images_dropped: self.dropped.load(Ordering::SeqCst),
            failed_inserts: self.failed_inserts.load(Ordering::SeqCst),
            fatal: self.fatal.load(Ordering::SeqCst),
            ended_posted: self.ended_posted.load(Ordering::SeqCst),
        }
    }
}

/// Handle on a running sink thread.
pub struct SinkHandle {
    thread: JoinHandle<()>,
    stats: Arc<SinkStats>,
}

impl SinkHandle {
    /// Whether any image reached a datastore so far.
    pub fn anything_acquired(&self) -> bool {
        self.stats.anything_acquired.load(Ordering::SeqCst)
    }

    /// Images inserted so far.
    pub fn images_routed(&self) -> u64 {
        self.stats.routed.load(Ordering::SeqCst)
    }

    /// Images dropped so far.
    pub fn images_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::SeqCst)
    }

    /// Wait for the sink thread to exit.
    ///
    /// Returns once the output channel delivered `Finished` or closed.
    pub async fn join(self) -> AppResult<SinkReport> {
        let SinkHandle { thread, stats } = self;
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| AcqError::Engine(format!("sink join task failed: {}", e)))?
            .map_err(|_| AcqError::Engine("data sink thread panicked".to_string()))?;
        Ok(stats.report())
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("report", &self.stats.report())
            .finish()
    }
}

/// Routes images from the engine into datastores.
pub struct DataSink {
    rx: mpsc::Receiver<SinkMessage>,
    routes: Arc<[SubAcquisition]>,
    ctx: SinkContext,
    on_fatal: FatalCallback,
    stats: Arc<SinkStats>,
}

impl DataSink {
    /// Start the sink thread.
    ///
    /// `routes` must be indexed by sub-acquisition index.
    pub fn spawn(
        rx: mpsc::Receiver<SinkMessage>,
        routes: Arc<[SubAcquisition]>,
        ctx: SinkContext,
        on_fatal: FatalCallback,
    ) -> AppResult<SinkHandle> {
        let stats = Arc::new(SinkStats::default());
        let sink = DataSink {
            rx,
            routes,
            ctx,
            on_fatal,
            stats: stats.clone(),
        };
        let thread = thread::Builder::new()
            .name(SINK_THREAD_NAME.to_string())
            .spawn(move || sink.run())?;
        Ok(SinkHandle { thread, stats })
    }

    fn run(mut self) {
        info!(run_id = %self.ctx.run_id, routes = self.routes.len(), "Data sink started");
        let mut finished = false;
        while let Some(message) = self.rx.blocking_recv() {
            match message {
                SinkMessage::Image(image) => {
                    if self.stats.fatal.load(Ordering::SeqCst) {
                        self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    self.route(image);
                }
                SinkMessage::Finished => {
                    finished = true;
                    break;
                }
            }
        }

        self.close_storage();
        if finished {
            self.post_ended();
        } else {
            warn!(run_id = %self.ctx.run_id, "Engine output closed without end-of-stream");
        }
        let report = self.stats.report();
        info!(
            run_id = %self.ctx.run_id,
            routed = report.images_routed,
            dropped = report.images_dropped,
            failed = report.failed_inserts,
            "Data sink finished"
        );
    }

    fn route(&self, tagged: TaggedImage) {
        let Some(acq_index) = tagged.tags.acq_index else {
            warn!(error = %AcqError::MissingRoutingTag, "Dropping image");
            self.stats.dropped.fetch_add(1, Ordering::SeqCst);
            return;
        };
        let Some(sub) = self.routes.get(acq_index) else {
            let err = AcqError::UnknownSubAcquisition {
                index: acq_index,
                known: self.routes.len(),
            };
            warn!(error = %err, "Dropping image");
            self.stats.dropped.fetch_add(1, Ordering::SeqCst);
            return;
        };

        let coords = coords_for(&tagged.tags.axes, tagged.tags.terminal_axes.iter());
        let image = match Image::from_tagged(tagged, coords) {
            Ok(image) => image,
            Err(ConversionError::OutOfMemory(bytes)) => {
                self.fail_fatally(AcqError::OutOfMemory(format!(
                    "unable to allocate {} bytes for image data",
                    bytes
                )));
                self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Err(err) => {
                warn!(acq_index, error = %err, "Dropping image");
                self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        match sub.pipeline.insert_image(image) {
            Ok(()) => {
                self.stats.routed.fetch_add(1, Ordering::SeqCst);
                self.stats.anything_acquired.store(true, Ordering::SeqCst);
            }
            Err(err) => {
                self.stats.failed_inserts.fetch_add(1, Ordering::SeqCst);
                self.ctx.ui.show_error(&format!(
                    "Failed to store image in '{}': {}",
                    sub.store.name(),
                    err
                ));
                sub.pipeline.clear_exceptions();
            }
        }
    }

    fn fail_fatally(&self, err: AcqError) {
        if self.stats.fatal.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(error = %err, "Data sink stopping; remaining images will be discarded");

        // Notify without blocking routing on the prompt.
        let ui = self.ctx.ui.clone();
        let message = format!("Acquisition aborted: {}", err);
        if let Err(spawn_err) = thread::Builder::new()
            .name(format!("{}-notify", SINK_THREAD_NAME))
            .spawn(move || ui.show_error(&message))
        {
            warn!(error = %spawn_err, "Could not notify user of fatal sink error");
        }
        (self.on_fatal)();
    }

    fn close_storage(&self) {
        for sub in self.routes.iter() {
            sub.pipeline.halt();
            sub.store.lock();
            debug!(acq_index = sub.acq_index, images = sub.store.num_images(), "Store closed");
        }
    }

    fn post_ended(&self) {
        for sub in self.routes.iter() {
            self.ctx.events.post_ended(AcquisitionEnded {
                run_id: self.ctx.run_id,
                acq_index: sub.acq_index,
                store: sub.store.clone(),
            });
        }
        self.stats.ended_posted.store(true, Ordering::SeqCst);
    }
}

/// Coordinates of an image: standard axes, then extension axes and
/// terminal markers.
fn coords_for<'a>(axes: &AxisPositions, terminal: impl Iterator<Item = &'a String>) -> Coords {
    let mut coords = Coords::from_standard_axes(axes);
    for (axis, index) in axes.iter() {
        if !AxisPositions::is_standard(axis) {
            coords = coords.with_axis(axis, index);
        }
    }
    for axis in terminal {
        coords = coords.with_terminal(axis.as_str());
    }
    coords
}
