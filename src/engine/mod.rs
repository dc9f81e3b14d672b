//! Acquisition engine interface.
//!
//! The engine executes event streams: it runs hooks at the four
//! [`HookStage`](crate::acquisition::hooks::HookStage)s, applies the hardware
//! state each event asks for, snaps an image and sends it, tagged, on the
//! output channel given to [`AcquisitionEngine::start`]. After
//! [`AcquisitionEngine::finish`] the output channel receives
//! [`SinkMessage::Finished`].
//!
//! [`simulated::SimulatedEngine`] drives a [`MicroscopeCore`](crate::hardware::MicroscopeCore)
//! in-process.

pub mod simulated;

use crate::acquisition::hooks::HookDispatcher;
use crate::acquisition::sequencer::ComposedEvents;
use crate::data::sink::SinkMessage;
use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Executes acquisition events.
#[async_trait]
pub trait AcquisitionEngine: Send + Sync {
    /// Prepare a run: hooks to invoke and where to send images.
    async fn start(&self, hooks: Arc<HookDispatcher>, output: mpsc::Sender<SinkMessage>) -> AppResult<()>;

    /// Execute every event of `events`, returning once the last one completed
    /// or abort was requested.
    async fn submit(&self, events: ComposedEvents) -> AppResult<()>;

    /// No more events will be submitted; signal end-of-stream on the output.
    async fn finish(&self) -> AppResult<()>;

    /// Stop after the event in flight.
    fn abort(&self);

    /// Whether abort was requested.
    fn is_abort_requested(&self) -> bool;

    /// Pause or resume before the next event.
    fn set_paused(&self, paused: bool);

    /// Whether the engine is paused.
    fn is_paused(&self) -> bool;

    /// Whether [`finish`](Self::finish) completed.
    fn are_events_finished(&self) -> bool;
}
