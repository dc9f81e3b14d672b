//! Integration tests for the acquisition driver lifecycle.
//!
//! Runs complete batches through the simulated engine against the mock core
//! and in-memory storage.

use mda_engine::acquisition::driver::AcquisitionDriver;
use mda_engine::acquisition::position::{PositionList, StagePosition};
use mda_engine::acquisition::settings::{
    AcqOrderMode, AcquisitionSettings, AutofocusSettings, ChannelSpec, SliceSettings,
};
use mda_engine::acquisition::state::DriverState;
use mda_engine::context::{AppContext, DiskSpaceProbe, FixedDiskSpace};
use mda_engine::data::datastore::Datastore;
use mda_engine::data::image::Image;
use mda_engine::data::memory::{ImageProcessor, InMemoryStorage};
use mda_engine::engine::simulated::SimulatedEngine;
use mda_engine::error::{AcqError, AppResult};
use mda_engine::events::{EventBus, LifecycleEvent, ShutdownCommencing};
use mda_engine::hardware::mock::{MockAutofocus, MockCore, MOCK_FOCUS_DEVICE};
use mda_engine::hardware::MicroscopeCore;
use mda_engine::ui::HeadlessUi;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

struct Harness {
    core: Arc<MockCore>,
    ui: Arc<HeadlessUi>,
    storage: Arc<InMemoryStorage>,
    events: Arc<EventBus>,
    driver: AcquisitionDriver,
}

fn harness_with(core: MockCore, storage: InMemoryStorage, disk: u64) -> Harness {
    let core = Arc::new(core);
    let ui = Arc::new(HeadlessUi::new(true));
    let storage = Arc::new(storage);
    let ctx = AppContext::new(core.clone(), ui.clone(), storage.clone())
        .with_disk_probe(Arc::new(FixedDiskSpace(disk)));
    let events = ctx.events.clone();
    let driver = AcquisitionDriver::new(ctx, Arc::new(SimulatedEngine::new(core.clone())));
    Harness {
        core,
        ui,
        storage,
        events,
        driver,
    }
}

fn harness() -> Harness {
    harness_with(MockCore::default(), InMemoryStorage::new(), u64::MAX)
}

fn count_ended(events: &EventBus) -> Arc<AtomicUsize> {
    let ended = Arc::new(AtomicUsize::new(0));
    let counter = ended.clone();
    events.on_ended(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    ended
}

fn two_channel_stack() -> AcquisitionSettings {
    AcquisitionSettings::builder()
        .channels(
            "Channel",
            vec![
                ChannelSpec::new("DAPI", 5.0),
                ChannelSpec::new("FITC", 10.0).with_z_stack(false),
            ],
        )
        .slices(SliceSettings::new(0.0, 4.0, 1.0))
        .build()
}

fn frames(n: u32) -> AcquisitionSettings {
    AcquisitionSettings::builder().frames(n, 0.0).build()
}

#[tokio::test]
async fn test_full_run_stores_every_image() {
    let h = harness();
    let ended = count_ended(&h.events);
    let mut lifecycle = h.events.subscribe();

    let stores = h
        .driver
        .run_acquisition(&frames(3), &[two_channel_stack()], &[PositionList::new()])
        .await
        .expect("run should succeed");

    assert_eq!(stores.len(), 1);
    assert_eq!(stores[0].num_images(), 18);
    assert!(stores[0].is_locked());
    assert_eq!(h.core.snap_count(), 18);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert!(h.ui.errors().is_empty());
    assert_eq!(h.driver.state(), DriverState::Idle);
    assert!(h.driver.is_finished());
    assert!(h.driver.run_id().is_none());

    assert!(matches!(lifecycle.recv().await, Ok(LifecycleEvent::Started(_))));
    assert!(matches!(lifecycle.recv().await, Ok(LifecycleEvent::Ended(_))));

    let summary = stores[0].summary_metadata();
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.slices, 5);
    assert_eq!(summary.channel_names, vec!["DAPI", "FITC"]);
}

#[tokio::test]
async fn test_driver_is_reusable() {
    let h = harness();
    for _ in 0..2 {
        let stores = h
            .driver
            .run_acquisition(&frames(2), &[AcquisitionSettings::default()], &[PositionList::new()])
            .await
            .expect("run should succeed");
        assert_eq!(stores[0].num_images(), 2);
    }
    assert_eq!(h.storage.stores().len(), 2);
}

#[tokio::test]
async fn test_multiple_sub_acquisitions_share_timing() {
    let h = harness();
    let ended = count_ended(&h.events);
    let tiles = AcquisitionSettings::builder().use_positions(true).build();
    let positions: PositionList = vec![
        StagePosition::new("A1", 0.0, 0.0),
        StagePosition::new("A2", 100.0, 0.0),
    ]
    .into();

    let stores = h
        .driver
        .run_acquisition(
            &frames(2),
            &[AcquisitionSettings::default(), tiles],
            &[PositionList::new(), positions],
        )
        .await
        .expect("run should succeed");

    assert_eq!(stores[0].num_images(), 2);
    assert_eq!(stores[1].num_images(), 4);
    assert_eq!(ended.load(Ordering::SeqCst), 2);
    assert_eq!(h.core.xy_position(), (100.0, 0.0));
}

#[tokio::test]
async fn test_position_list_mismatch_allocates_nothing() {
    let h = harness();
    let err = h
        .driver
        .run_acquisition(
            &frames(1),
            &[AcquisitionSettings::default(), AcquisitionSettings::default()],
            &[PositionList::new()],
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AcqError::PositionListMismatch {
            expected: 2,
            actual: 1
        }
    ));
    assert!(h.storage.stores().is_empty());
    assert_eq!(h.core.snap_count(), 0);
    assert_eq!(h.driver.state(), DriverState::Idle);
}

#[tokio::test]
async fn test_unsupported_order_is_rejected() {
    let h = harness();
    let sub = two_channel_stack()
        .to_builder()
        .order(AcqOrderMode::PosTimeSliceChannel)
        .build();
    let err = h
        .driver
        .run_acquisition(&frames(2), &[sub], &[PositionList::new()])
        .await
        .unwrap_err();
    assert!(matches!(err, AcqError::UnsupportedOrder(_)));
    assert!(h.storage.stores().is_empty());
}

#[tokio::test]
async fn test_zero_z_step_is_rejected() {
    let h = harness();
    let sub = AcquisitionSettings::builder()
        .slices(SliceSettings::new(0.0, 5.0, 0.0))
        .build();
    let err = h
        .driver
        .run_acquisition(&frames(1), &[sub], &[PositionList::new()])
        .await
        .unwrap_err();
    assert!(matches!(err, AcqError::ZeroZStep));
}

#[tokio::test]
async fn test_one_failed_insert_among_ten() {
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = failed_once.clone();
    let processor: ImageProcessor = Arc::new(move |image: Image| {
        if image.coords().time() == Some(4) && !flag.swap(true, Ordering::SeqCst) {
            return Err(AcqError::Pipeline("processor rejected frame".into()));
        }
        Ok(image)
    });
    let h = harness_with(
        MockCore::default(),
        InMemoryStorage::new().with_processor(processor),
        u64::MAX,
    );
    let ended = count_ended(&h.events);

    let stores = h
        .driver
        .run_acquisition(&frames(10), &[AcquisitionSettings::default()], &[PositionList::new()])
        .await
        .expect("run should succeed despite a failed insert");

    assert_eq!(stores[0].num_images(), 9);
    assert_eq!(h.ui.errors().len(), 1);
    assert!(h.ui.errors()[0].contains("processor rejected frame"));
    assert_eq!(ended.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_runnables_fire_on_matching_events() {
    let h = harness();
    let every = Arc::new(AtomicUsize::new(0));
    let third_frame = Arc::new(AtomicUsize::new(0));
    let e = every.clone();
    h.driver.attach_runnable(-1, -1, -1, -1, move || {
        e.fetch_add(1, Ordering::SeqCst);
    });
    let t = third_frame.clone();
    h.driver.attach_runnable(2, -1, -1, -1, move || {
        t.fetch_add(1, Ordering::SeqCst);
    });

    let sub = AcquisitionSettings::builder()
        .slices(SliceSettings::new(0.0, 1.0, 1.0))
        .build();
    h.driver
        .run_acquisition(&frames(3), &[sub], &[PositionList::new()])
        .await
        .expect("run should succeed");

    assert_eq!(every.load(Ordering::SeqCst), 6);
    assert_eq!(third_frame.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cleared_runnables_never_fire() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    h.driver.clear_runnables();
    let c = calls.clone();
    h.driver.attach_runnable(-1, -1, -1, -1, move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    h.driver.clear_runnables();
    assert_eq!(h.driver.runnable_count(), 0);

    h.driver
        .run_acquisition(&frames(2), &[AcquisitionSettings::default()], &[PositionList::new()])
        .await
        .expect("run should succeed");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_skips_remaining_events() {
    let h = harness();
    let ended = count_ended(&h.events);
    let driver = h.driver.clone();
    h.driver.attach_runnable(0, -1, -1, -1, move || driver.stop(true));

    let stores = h
        .driver
        .run_acquisition(&frames(5), &[AcquisitionSettings::default()], &[PositionList::new()])
        .await
        .expect("aborted runs still return their stores");
    h.driver.clear_runnables();

    // The in-flight event completes.
    assert_eq!(stores[0].num_images(), 1);
    assert!(h.driver.abort_requested());
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(h.driver.state(), DriverState::Idle);
}

#[tokio::test]
async fn test_shutdown_prompt_can_veto() {
    let h = harness();
    h.ui.set_answer(false);
    let vetoed = Arc::new(AtomicBool::new(false));
    let (events, flag) = (h.events.clone(), vetoed.clone());
    h.driver.attach_runnable(0, -1, -1, -1, move || {
        let request = ShutdownCommencing::new();
        events.post_shutdown(&request);
        flag.store(request.is_cancelled(), Ordering::SeqCst);
    });

    let stores = h
        .driver
        .run_acquisition(&frames(3), &[AcquisitionSettings::default()], &[PositionList::new()])
        .await
        .expect("run should succeed");
    h.driver.clear_runnables();

    assert!(vetoed.load(Ordering::SeqCst));
    assert_eq!(stores[0].num_images(), 3);
    assert_eq!(h.ui.prompts().len(), 1);
    // The shutdown listener is gone once the run finished.
    assert_eq!(h.events.handler_count(), 0);
}

#[tokio::test]
async fn test_shutdown_prompt_can_abort() {
    let h = harness();
    let events = h.events.clone();
    h.driver.attach_runnable(0, -1, -1, -1, move || {
        events.post_shutdown(&ShutdownCommencing::new());
    });

    let stores = h
        .driver
        .run_acquisition(&frames(4), &[AcquisitionSettings::default()], &[PositionList::new()])
        .await
        .expect("aborted runs still return their stores");
    h.driver.clear_runnables();

    assert_eq!(stores[0].num_images(), 1);
    assert!(h.driver.abort_requested());
}

#[tokio::test]
async fn test_ui_thread_is_refused() {
    let h = harness();
    h.ui.mark_current_thread_as_ui();
    let err = h
        .driver
        .run_acquisition(&frames(1), &[AcquisitionSettings::default()], &[PositionList::new()])
        .await
        .unwrap_err();
    assert!(matches!(err, AcqError::CalledOnUiThread));
    assert_eq!(h.driver.state(), DriverState::Idle);
}

#[tokio::test]
async fn test_insufficient_disk_space() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness_with(MockCore::default(), InMemoryStorage::new(), 1024);
    let sub = AcquisitionSettings::builder()
        .save_to(dir.path(), "run")
        .build();

    let err = h
        .driver
        .run_acquisition(&frames(2), &[sub], &[PositionList::new()])
        .await
        .unwrap_err();

    // 2 images of 32x32x2 bytes, times 1.25.
    assert!(matches!(
        err,
        AcqError::InsufficientDiskSpace {
            required: 5120,
            available: 1024
        }
    ));
    assert!(h.storage.stores().is_empty());
}

#[tokio::test]
async fn test_declined_directory_cancels() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("new").join("run");
    let h = harness();
    h.ui.set_answer(false);
    let sub = AcquisitionSettings::builder().save_to(&root, "run").build();

    let err = h
        .driver
        .run_acquisition(&frames(1), &[sub.clone()], &[PositionList::new()])
        .await
        .unwrap_err();
    assert!(matches!(err, AcqError::Cancelled));
    assert!(!root.exists());
    // Cancelling is not reported as an error.
    assert!(h.ui.errors().is_empty());

    h.ui.set_answer(true);
    h.driver
        .run_acquisition(&frames(1), &[sub], &[PositionList::new()])
        .await
        .expect("run should succeed once the directory is created");
    assert!(root.is_dir());
}

#[tokio::test]
async fn test_relative_stack_restores_focus() {
    let h = harness_with(MockCore::default().with_focus(5.0), InMemoryStorage::new(), u64::MAX);
    let sub = AcquisitionSettings::builder()
        .slices(SliceSettings::new(-1.0, 1.0, 1.0).relative())
        .build();

    h.driver
        .run_acquisition(&frames(1), &[sub], &[PositionList::new()])
        .await
        .expect("run should succeed");

    assert_eq!(h.core.focus_history(), vec![4.0, 5.0, 6.0, 5.0, 5.0]);
    assert_eq!(h.core.position(MOCK_FOCUS_DEVICE).expect("focus"), 5.0);
}

#[tokio::test]
async fn test_autofocus_runs_per_due_timepoint() {
    let core = Arc::new(MockCore::default());
    let ui = Arc::new(HeadlessUi::new(true));
    let autofocus = Arc::new(MockAutofocus::new(core.clone(), 0.0));
    let ctx = AppContext::new(core.clone(), ui, Arc::new(InMemoryStorage::new()))
        .with_autofocus(autofocus.clone());
    let driver = AcquisitionDriver::new(ctx, Arc::new(SimulatedEngine::new(core)));

    let sub = AcquisitionSettings::builder()
        .autofocus(AutofocusSettings {
            enabled: true,
            skip_frames: 1,
        })
        .build();
    driver
        .run_acquisition(&frames(4), &[sub], &[PositionList::new()])
        .await
        .expect("run should succeed");

    // Frames 0 and 2.
    assert_eq!(autofocus.runs(), 2);
}

#[tokio::test]
async fn test_camera_failure_is_reported_and_cleaned_up() {
    let h = harness();
    h.core.fail_snaps(true);
    let ended = count_ended(&h.events);

    let err = h
        .driver
        .run_acquisition(&frames(2), &[AcquisitionSettings::default()], &[PositionList::new()])
        .await
        .unwrap_err();

    assert!(matches!(err, AcqError::Hardware(_)));
    assert_eq!(h.ui.errors().len(), 1);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert!(h.storage.stores()[0].is_locked());
    assert_eq!(h.driver.state(), DriverState::Idle);
}

#[tokio::test]
async fn test_pause_holds_events_until_resumed() {
    let h = harness();
    let seen_paused = Arc::new(AtomicBool::new(false));
    let (driver, flag) = (h.driver.clone(), seen_paused.clone());
    h.driver.attach_runnable(1, -1, -1, -1, move || {
        driver.set_pause(true);
        flag.store(
            driver.is_paused() && driver.state() == DriverState::Paused,
            Ordering::SeqCst,
        );
    });

    let watcher = async {
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.driver.state() != DriverState::Paused {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("driver pauses");

        let snapped = h.core.snap_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.core.snap_count(), snapped, "no events execute while paused");
        assert!(h.driver.is_paused());

        h.driver.set_pause(false);
        assert_eq!(h.driver.state(), DriverState::Running);
        snapped
    };
    let (master, subs, positions) = (frames(4), [AcquisitionSettings::default()], [PositionList::new()]);
    let run = h.driver.run_acquisition(&master, &subs, &positions);
    let (stores, snapped_while_paused) = tokio::join!(run, watcher);
    let stores = stores.expect("run should succeed");
    h.driver.clear_runnables();

    assert!(seen_paused.load(Ordering::SeqCst));
    assert_eq!(snapped_while_paused, 2);
    assert_eq!(stores[0].num_images(), 4);
    assert!(!h.driver.abort_requested());
    assert_eq!(h.driver.state(), DriverState::Idle);
}

#[tokio::test]
async fn test_abort_request_needs_every_confirmation() {
    let h = harness();
    let ended = count_ended(&h.events);
    let declined = Arc::new(AtomicBool::new(false));
    let confirmed = Arc::new(AtomicBool::new(false));

    let (driver, ui, flag) = (h.driver.clone(), h.ui.clone(), declined.clone());
    let once = AtomicBool::new(false);
    h.driver.attach_runnable(0, -1, -1, -1, move || {
        if !once.swap(true, Ordering::SeqCst) {
            ui.set_answer(false);
            flag.store(!driver.abort_request(), Ordering::SeqCst);
        }
    });
    let (driver, ui, flag) = (h.driver.clone(), h.ui.clone(), confirmed.clone());
    let once = AtomicBool::new(false);
    h.driver.attach_runnable(1, -1, -1, -1, move || {
        if !once.swap(true, Ordering::SeqCst) {
            ui.set_answer(true);
            flag.store(driver.abort_request(), Ordering::SeqCst);
        }
    });

    let subs = [AcquisitionSettings::default(), AcquisitionSettings::default()];
    let stores = h
        .driver
        .run_acquisition(&frames(4), &subs, &[PositionList::new(), PositionList::new()])
        .await
        .expect("aborted runs still return their stores");
    h.driver.clear_runnables();

    assert!(declined.load(Ordering::SeqCst), "a declined prompt keeps the run going");
    assert!(confirmed.load(Ordering::SeqCst));
    // One declined prompt, then one confirmation per store.
    assert_eq!(h.ui.prompts().len(), 3);
    // Sub 0 reached frame 1; sub 1 never got past frame 0.
    assert_eq!(stores[0].num_images(), 2);
    assert_eq!(stores[1].num_images(), 1);
    assert!(h.driver.abort_requested());
    assert_eq!(ended.load(Ordering::SeqCst), 2);
}

/// Disk probe that stops the driver the first time it is queried.
struct StoppingProbe {
    driver: OnceLock<AcquisitionDriver>,
    fired: AtomicBool,
    state_seen: AtomicBool,
}

impl DiskSpaceProbe for StoppingProbe {
    fn usable_space(&self, _path: &Path) -> AppResult<u64> {
        if let Some(driver) = self.driver.get() {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.state_seen
                    .store(driver.state() == DriverState::Validating, Ordering::SeqCst);
                driver.stop(true);
            }
        }
        Ok(u64::MAX)
    }
}

#[tokio::test]
async fn test_stop_during_validation_is_not_lost() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = Arc::new(MockCore::default());
    let ui = Arc::new(HeadlessUi::new(true));
    let storage = Arc::new(InMemoryStorage::new());
    let probe = Arc::new(StoppingProbe {
        driver: OnceLock::new(),
        fired: AtomicBool::new(false),
        state_seen: AtomicBool::new(false),
    });
    let ctx = AppContext::new(core.clone(), ui.clone(), storage.clone()).with_disk_probe(probe.clone());
    let ended = count_ended(&ctx.events);
    let driver = AcquisitionDriver::new(ctx, Arc::new(SimulatedEngine::new(core.clone())));
    assert!(probe.driver.set(driver.clone()).is_ok());

    let sub = AcquisitionSettings::builder().save_to(dir.path(), "run").build();
    let err = driver
        .run_acquisition(&frames(3), &[sub.clone()], &[PositionList::new()])
        .await
        .unwrap_err();

    assert!(probe.state_seen.load(Ordering::SeqCst));
    assert!(matches!(err, AcqError::Cancelled));
    assert!(storage.stores().is_empty());
    assert_eq!(core.snap_count(), 0);
    assert_eq!(ended.load(Ordering::SeqCst), 0);
    assert!(ui.errors().is_empty());
    assert_eq!(driver.state(), DriverState::Idle);

    // The next run starts clean.
    let stores = driver
        .run_acquisition(&frames(3), &[sub], &[PositionList::new()])
        .await
        .expect("run should succeed");
    assert_eq!(stores[0].num_images(), 3);
}
