//! # mda-engine
//!
//! Sequencing engine for multi-dimensional microscope acquisitions: time
//! lapses over stage positions, channels and z-stacks.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: settings, event sequencing, hooks and the
//!   [`AcquisitionDriver`](acquisition::driver::AcquisitionDriver) that runs a
//!   batch of sub-acquisitions.
//! - **`engine`**: the [`AcquisitionEngine`](engine::AcquisitionEngine) trait
//!   and an in-process implementation.
//! - **`data`**: coordinates, images, datastore traits, in-memory storage and
//!   the data sink routing engine output.
//! - **`hardware`**: the microscope core and autofocus traits, plus mocks.
//! - **`events`**: lifecycle event bus.
//! - **`context`**, **`ui`**: collaborators handed to the driver.
//! - **`config`**, **`logging`**, **`error`**: configuration, tracing setup and
//!   the crate error type.

pub mod acquisition;
pub mod config;
pub mod context;
pub mod data;
pub mod engine;
pub mod error;
pub mod events;
pub mod hardware;
pub mod logging;
pub mod ui;
