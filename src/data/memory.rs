//! In-memory storage.

use crate::acquisition::summary::SummaryMetadata;
use crate::data::coords::Coords;
use crate::data::datastore::{Datastore, DatastoreFactory, Pipeline, StoreRequest};
use crate::data::image::Image;
use crate::error::{AcqError, AppResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Processing step of an [`InMemoryPipeline`].
pub type ImageProcessor = Arc<dyn Fn(Image) -> AppResult<Image> + Send + Sync>;

/// Datastore keeping every image in a map keyed by coordinates.
#[derive(Debug)]
pub struct InMemoryDatastore {
    name: String,
    images: RwLock<HashMap<Coords, Image>>,
    summary: RwLock<SummaryMetadata>,
    locked: AtomicBool,
}

impl InMemoryDatastore {
    /// Empty, unlocked datastore.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            images: RwLock::new(HashMap::new()),
            summary: RwLock::new(SummaryMetadata::default()),
            locked: AtomicBool::new(false),
        }
    }

    /// Coordinates of every stored image.
    pub fn coords(&self) -> Vec<Coords> {
        self.images.read().keys().cloned().collect()
    }
}

impl Datastore for InMemoryDatastore {
    fn name(&self) -> &str {
        &self.name
    }

    fn put_image(&self, image: Image) -> AppResult<()> {
        if self.is_locked() {
            return Err(AcqError::Pipeline(format!(
                "datastore '{}' is locked",
                self.name
            )));
        }
        self.images.write().insert(image.coords().clone(), image);
        Ok(())
    }

    fn image(&self, coords: &Coords) -> Option<Image> {
        self.images.read().get(coords).cloned()
    }

    fn num_images(&self) -> usize {
        self.images.read().len()
    }

    fn summary_metadata(&self) -> SummaryMetadata {
        self.summary.read().clone()
    }

    fn set_summary_metadata(&self, metadata: SummaryMetadata) -> AppResult<()> {
        if self.is_locked() {
            return Err(AcqError::Pipeline(format!(
                "datastore '{}' is locked",
                self.name
            )));
        }
        *self.summary.write() = metadata;
        Ok(())
    }

    fn lock(&self) {
        debug!(store = %self.name, "Locking datastore");
        self.locked.store(true, Ordering::SeqCst);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

/// Pipeline running processors in order, then storing the result.
///
/// A processor error is recorded and returned; while errors are recorded the
/// pipeline refuses new images until [`Pipeline::clear_exceptions`] is called.
pub struct InMemoryPipeline {
    store: Arc<dyn Datastore>,
    processors: Vec<ImageProcessor>,
    halted: AtomicBool,
    exceptions: Mutex<Vec<String>>,
}

impl InMemoryPipeline {
    /// Pipeline writing into `store`.
    pub fn new(store: Arc<dyn Datastore>, processors: Vec<ImageProcessor>) -> Self {
        Self {
            store,
            processors,
            halted: AtomicBool::new(false),
            exceptions: Mutex::new(Vec::new()),
        }
    }
}

impl Pipeline for InMemoryPipeline {
    fn insert_image(&self, image: Image) -> AppResult<()> {
        if self.is_halted() {
            return Err(AcqError::Pipeline("pipeline is halted".to_string()));
        }
        if !self.exceptions.lock().is_empty() {
            return Err(AcqError::Pipeline(
                "pipeline has unhandled exceptions".to_string(),
            ));
        }

        let mut image = image;
        for processor in &self.processors {
            image = match processor(image) {
                Ok(next) => next,
                Err(err) => {
                    warn!(store = self.store.name(), error = %err, "Image processor failed");
                    self.exceptions.lock().push(err.to_string());
                    return Err(err);
                }
            };
        }
        self.store.put_image(image)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().clone()
    }

    fn clear_exceptions(&self) {
        self.exceptions.lock().clear();
    }
}

/// Factory for in-memory stores, remembering what it created.
#[derive(Default)]
pub struct InMemoryStorage {
    processors: Vec<ImageProcessor>,
    created: Mutex<Vec<Arc<InMemoryDatastore>>>,
}

impl InMemoryStorage {
    /// Factory with no processors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor to every pipeline created from now on.
    pub fn with_processor(mut self, processor: ImageProcessor) -> Self {
        self.processors.push(processor);
        self
    }

    /// Every store created so far.
    pub fn stores(&self) -> Vec<Arc<InMemoryDatastore>> {
        self.created.lock().clone()
    }
}

impl DatastoreFactory for InMemoryStorage {
    fn create(&self, request: &StoreRequest) -> AppResult<(Arc<dyn Datastore>, Arc<dyn Pipeline>)> {
        let name = format!("{}_{}", request.prefix, request.acq_index + 1);
        let store = Arc::new(InMemoryDatastore::new(name));
        self.created.lock().push(store.clone());

        let dyn_store: Arc<dyn Datastore> = store;
        let pipeline = Arc::new(InMemoryPipeline::new(
            dyn_store.clone(),
            self.processors.clone(),
        ));
        Ok((dyn_store, pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::image::{ImageTags, TaggedImage};
    use crate::hardware::ImageGeometry;

    fn image_at(z: u32) -> Image {
        let tagged = TaggedImage {
            pixels: vec![0; 4],
            tags: ImageTags {
                geometry: ImageGeometry::new(2, 2, 1),
                ..Default::default()
            },
        };
        Image::from_tagged(tagged, Coords::new().with_axis("z", z)).unwrap()
    }

    #[test]
    fn pipeline_stores_processed_images() {
        let store = Arc::new(InMemoryDatastore::new("test"));
        let pipeline = InMemoryPipeline::new(store.clone(), Vec::new());
        pipeline.insert_image(image_at(0)).unwrap();
        pipeline.insert_image(image_at(1)).unwrap();
        assert_eq!(store.num_images(), 2);
        assert!(store.image(&Coords::new().with_axis("z", 1)).is_some());
    }

    #[test]
    fn processor_error_blocks_until_cleared() {
        let store = Arc::new(InMemoryDatastore::new("test"));
        let failing: ImageProcessor = Arc::new(|image: Image| {
            if image.coords().z() == Some(1) {
                Err(AcqError::Pipeline("bad frame".into()))
            } else {
                Ok(image)
            }
        });
        let pipeline = InMemoryPipeline::new(store.clone(), vec![failing]);

        assert!(pipeline.insert_image(image_at(1)).is_err());
        assert_eq!(pipeline.exceptions().len(), 1);
        assert!(pipeline.insert_image(image_at(2)).is_err());

        pipeline.clear_exceptions();
        pipeline.insert_image(image_at(2)).unwrap();
        assert_eq!(store.num_images(), 1);
    }

    #[test]
    fn locked_store_refuses_writes() {
        let store = InMemoryDatastore::new("test");
        store.lock();
        assert!(store.put_image(image_at(0)).is_err());
    }
}
