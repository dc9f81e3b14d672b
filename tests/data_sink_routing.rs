//! Routing of engine output through the data sink.

use mda_engine::acquisition::event::{AxisPositions, TIME_AXIS, Z_AXIS};
use mda_engine::data::coords::Coords;
use mda_engine::data::datastore::{Datastore, Pipeline};
use mda_engine::data::image::{ImageTags, TaggedImage};
use mda_engine::data::memory::{InMemoryDatastore, InMemoryPipeline};
use mda_engine::data::sink::{DataSink, SinkContext, SinkMessage, SubAcquisition};
use mda_engine::events::EventBus;
use mda_engine::hardware::ImageGeometry;
use mda_engine::ui::HeadlessUi;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const GEOMETRY: ImageGeometry = ImageGeometry {
    width: 4,
    height: 4,
    bytes_per_pixel: 1,
};

fn single_route() -> (Arc<[SubAcquisition]>, Arc<InMemoryDatastore>) {
    let store = Arc::new(InMemoryDatastore::new("routing"));
    let dyn_store: Arc<dyn Datastore> = store.clone();
    let pipeline: Arc<dyn Pipeline> = Arc::new(InMemoryPipeline::new(dyn_store.clone(), Vec::new()));
    let routes: Arc<[SubAcquisition]> = vec![SubAcquisition {
        acq_index: 0,
        store: dyn_store,
        pipeline,
    }]
    .into();
    (routes, store)
}

fn tagged(acq_index: Option<usize>, axes: AxisPositions) -> SinkMessage {
    SinkMessage::Image(TaggedImage {
        pixels: vec![7; GEOMETRY.bytes_per_image() as usize],
        tags: ImageTags {
            acq_index,
            axes,
            geometry: GEOMETRY,
            camera: "Camera".into(),
            ..Default::default()
        },
    })
}

fn spawn(
    routes: Arc<[SubAcquisition]>,
    ui: Arc<HeadlessUi>,
) -> (mpsc::Sender<SinkMessage>, mda_engine::data::sink::SinkHandle) {
    let (tx, rx) = mpsc::channel(16);
    let ctx = SinkContext {
        run_id: Uuid::new_v4(),
        events: Arc::new(EventBus::default()),
        ui,
    };
    let handle = DataSink::spawn(rx, routes, ctx, Box::new(|| {})).expect("spawn sink");
    (tx, handle)
}

#[tokio::test]
async fn test_untagged_image_is_dropped() {
    let (routes, store) = single_route();
    let ui = Arc::new(HeadlessUi::default());
    let (tx, handle) = spawn(routes, ui.clone());

    tx.send(tagged(None, AxisPositions::default())).await.unwrap();
    tx.send(SinkMessage::Finished).await.unwrap();
    let report = handle.join().await.expect("sink joins");

    assert!(!report.anything_acquired);
    assert_eq!(report.images_dropped, 1);
    assert_eq!(store.num_images(), 0);
    // Dropping is logged, not reported to the user.
    assert!(ui.errors().is_empty());
}

#[tokio::test]
async fn test_untagged_image_does_not_hide_good_ones() {
    let (routes, store) = single_route();
    let (tx, handle) = spawn(routes, Arc::new(HeadlessUi::default()));

    let mut axes = AxisPositions::default();
    axes.set(TIME_AXIS, 0);
    tx.send(tagged(None, axes.clone())).await.unwrap();
    tx.send(tagged(Some(0), axes)).await.unwrap();
    tx.send(SinkMessage::Finished).await.unwrap();
    let report = handle.join().await.expect("sink joins");

    assert!(report.anything_acquired);
    assert_eq!(report.images_routed, 1);
    assert_eq!(report.images_dropped, 1);
    assert_eq!(store.num_images(), 1);
}

#[tokio::test]
async fn test_extension_axes_are_part_of_coords() {
    let (routes, store) = single_route();
    let (tx, handle) = spawn(routes, Arc::new(HeadlessUi::default()));

    for angle in 0..3 {
        let mut axes = AxisPositions::default();
        axes.set(Z_AXIS, 1);
        axes.set("angle", angle);
        tx.send(tagged(Some(0), axes)).await.unwrap();
    }
    tx.send(SinkMessage::Finished).await.unwrap();
    handle.join().await.expect("sink joins");

    // Same z, distinct angles: three separate images.
    assert_eq!(store.num_images(), 3);
    let coords = Coords::new().with_axis(Z_AXIS, 1).with_axis("angle", 2);
    let image = store.image(&coords).expect("image at angle 2");
    assert_eq!(image.metadata().camera, "Camera");
}

#[tokio::test]
async fn test_terminal_markers_survive_routing() {
    let (routes, store) = single_route();
    let (tx, handle) = spawn(routes, Arc::new(HeadlessUi::default()));

    let mut axes = AxisPositions::default();
    axes.set(Z_AXIS, 4);
    let mut message = tagged(Some(0), axes);
    if let SinkMessage::Image(image) = &mut message {
        image.tags.terminal_axes = BTreeSet::from([Z_AXIS.to_string()]);
    }
    tx.send(message).await.unwrap();
    tx.send(SinkMessage::Finished).await.unwrap();
    handle.join().await.expect("sink joins");

    let stored = store.coords();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_terminal(Z_AXIS));
}

#[tokio::test]
async fn test_malformed_image_is_dropped() {
    let (routes, store) = single_route();
    let (tx, handle) = spawn(routes, Arc::new(HeadlessUi::default()));

    let mut message = tagged(Some(0), AxisPositions::default());
    if let SinkMessage::Image(image) = &mut message {
        image.pixels.truncate(3);
    }
    tx.send(message).await.unwrap();
    tx.send(SinkMessage::Finished).await.unwrap();
    let report = handle.join().await.expect("sink joins");

    assert_eq!(report.images_dropped, 1);
    assert_eq!(store.num_images(), 0);
    assert!(store.is_locked());
}
