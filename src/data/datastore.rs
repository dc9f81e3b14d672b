//! Storage traits.
//!
//! Each sub-acquisition writes into its own [`Datastore`] through a
//! [`Pipeline`]. Both are created together by a [`DatastoreFactory`] when a run
//! starts.

use crate::acquisition::summary::SummaryMetadata;
use crate::data::coords::Coords;
use crate::data::image::Image;
use crate::error::AppResult;
use std::path::PathBuf;
use std::sync::Arc;

/// Holds the images of one dataset.
pub trait Datastore: Send + Sync {
    /// Dataset name, used in logs and prompts.
    fn name(&self) -> &str;

    /// Store an image at its coordinates, replacing any previous one.
    fn put_image(&self, image: Image) -> AppResult<()>;

    /// Image at `coords`.
    fn image(&self, coords: &Coords) -> Option<Image>;

    /// Number of stored images.
    fn num_images(&self) -> usize;

    /// Dataset-level metadata.
    fn summary_metadata(&self) -> SummaryMetadata;

    /// Replace the dataset-level metadata.
    fn set_summary_metadata(&self, metadata: SummaryMetadata) -> AppResult<()>;

    /// Refuse further writes.
    fn lock(&self);

    /// Whether writes are refused.
    fn is_locked(&self) -> bool;
}

impl std::fmt::Debug for dyn Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore").field("name", &self.name()).finish_non_exhaustive()
    }
}

/// Processing chain in front of a datastore.
pub trait Pipeline: Send + Sync {
    /// Process `image` and store the result.
    fn insert_image(&self, image: Image) -> AppResult<()>;

    /// Stop accepting images.
    fn halt(&self);

    /// Whether the pipeline was halted.
    fn is_halted(&self) -> bool;

    /// Errors raised by processors since the last clear.
    fn exceptions(&self) -> Vec<String>;

    /// Forget recorded errors so that further images are processed.
    fn clear_exceptions(&self);
}

/// What a factory needs to set up storage for one sub-acquisition.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Index of the sub-acquisition.
    pub acq_index: usize,
    /// Save directory, `None` for memory-only datasets.
    pub root: Option<PathBuf>,
    /// Dataset name prefix.
    pub prefix: String,
    /// Whether images should be shown while acquired.
    pub display: bool,
}

/// Creates a datastore and its pipeline.
pub trait DatastoreFactory: Send + Sync {
    /// Allocate storage for one sub-acquisition.
    fn create(&self, request: &StoreRequest) -> AppResult<(Arc<dyn Datastore>, Arc<dyn Pipeline>)>;
}
