//! Acquisition sequencing and control.
//!
//! - [`settings`], [`position`], [`batch`]: what to acquire
//! - [`event`], [`axes`], [`sequencer`]: turning settings into event streams
//! - [`hooks`], [`runnables`], [`system_hooks`]: code run by the engine per event
//! - [`summary`]: derived counts, memory and duration
//! - [`driver`], [`state`]: running a batch end to end

pub mod axes;
pub mod batch;
pub mod driver;
pub mod event;
pub mod hooks;
pub mod position;
pub mod runnables;
pub mod sequencer;
pub mod settings;
pub mod state;
pub mod summary;
pub mod system_hooks;
