//! Images, storage and routing of engine output.
pub mod coords;
pub mod datastore;
pub mod image;
pub mod memory;
pub mod sink;
