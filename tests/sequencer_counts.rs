//! Sequencer output against the summary calculators.

use mda_engine::acquisition::event::{AcquisitionEvent, CHANNEL_AXIS, POSITION_AXIS, TIME_AXIS, Z_AXIS};
use mda_engine::acquisition::position::{PositionList, StagePosition};
use mda_engine::acquisition::sequencer::EventSequencer;
use mda_engine::acquisition::settings::{AcqOrderMode, AcquisitionSettings, ChannelSpec, SliceSettings};
use mda_engine::acquisition::summary::total_images;
use mda_engine::data::coords::Coords;
use mda_engine::error::AcqError;
use std::collections::HashSet;

fn positions(n: usize) -> PositionList {
    (0..n)
        .map(|i| StagePosition::new(format!("Pos{}", i), i as f64 * 100.0, 0.0))
        .collect()
}

fn run(settings: &AcquisitionSettings, positions: &PositionList) -> Vec<AcquisitionEvent> {
    EventSequencer::new(settings, positions, 0, 0.0)
        .expect("valid settings")
        .full_run()
        .collect::<Result<Vec<_>, _>>()
        .expect("no rejected events")
}

fn cases() -> Vec<(AcquisitionSettings, PositionList)> {
    let channels = vec![
        ChannelSpec::new("DAPI", 5.0),
        ChannelSpec::new("FITC", 10.0).with_z_stack(false),
        ChannelSpec::new("Cy5", 20.0).with_skip_factor(2),
        ChannelSpec::new("TRITC", 20.0).disabled(),
    ];
    let stack = SliceSettings::new(2.0, -2.0, 0.5);
    vec![
        (AcquisitionSettings::default(), PositionList::new()),
        (
            AcquisitionSettings::builder().frames(7, 0.0).build(),
            PositionList::new(),
        ),
        (
            AcquisitionSettings::builder()
                .frames(5, 0.0)
                .channels("Channel", channels.clone())
                .slices(stack.clone())
                .build(),
            PositionList::new(),
        ),
        (
            AcquisitionSettings::builder()
                .frames(4, 0.0)
                .use_positions(true)
                .channels("Channel", channels.clone())
                .slices(stack.clone())
                .order(AcqOrderMode::TimePosSliceChannel)
                .build(),
            positions(3),
        ),
        (
            // Channels listed but the axis is off.
            AcquisitionSettings::builder()
                .channels("Channel", channels)
                .use_channels(false)
                .slices(stack)
                .build(),
            positions(2),
        ),
    ]
}

#[test]
fn test_event_count_matches_total_images() {
    for (settings, positions) in cases() {
        let events = run(&settings, &positions);
        let expected = total_images(&settings, &positions).expect("valid settings");
        assert_eq!(events.len() as u64, expected, "settings: {:?}", settings);
    }
}

#[test]
fn test_events_have_unique_coordinates() {
    for (settings, positions) in cases() {
        let coords: HashSet<Coords> = run(&settings, &positions)
            .iter()
            .map(|e| Coords::from_standard_axes(e.axes()))
            .collect();
        let expected = total_images(&settings, &positions).expect("valid settings");
        assert_eq!(coords.len() as u64, expected);
    }
}

#[test]
fn test_two_channel_stack_yields_eighteen_images() {
    let settings = AcquisitionSettings::builder()
        .frames(3, 0.0)
        .channels(
            "Channel",
            vec![
                ChannelSpec::new("DAPI", 5.0),
                ChannelSpec::new("FITC", 5.0).with_z_stack(false),
            ],
        )
        .slices(SliceSettings::new(0.0, 4.0, 1.0))
        .build();

    assert_eq!(total_images(&settings, &PositionList::new()).unwrap(), 18);
    let events = run(&settings, &PositionList::new());
    assert_eq!(events.len(), 18);

    // The channel without a stack is acquired on the middle slice only.
    let fitc: Vec<_> = events
        .iter()
        .filter(|e| e.channel_index() == Some(1))
        .collect();
    assert_eq!(fitc.len(), 3);
    assert!(fitc.iter().all(|e| e.z_index() == Some(2)));
}

#[test]
fn test_zero_z_step_is_a_configuration_error() {
    let settings = AcquisitionSettings::builder()
        .slices(SliceSettings::new(0.0, 10.0, 0.0))
        .build();
    let err = EventSequencer::new(&settings, &PositionList::new(), 0, 0.0).unwrap_err();
    assert!(matches!(err, AcqError::ZeroZStep));
    assert!(total_images(&settings, &PositionList::new()).is_err());
}

#[test]
fn test_position_outermost_orders_produce_no_events() {
    for order in [AcqOrderMode::PosTimeChannelSlice, AcqOrderMode::PosTimeSliceChannel] {
        let settings = AcquisitionSettings::builder()
            .frames(2, 0.0)
            .order(order)
            .build();
        let err = EventSequencer::new(&settings, &PositionList::new(), 0, 0.0).unwrap_err();
        assert!(matches!(err, AcqError::UnsupportedOrder(o) if o == order));
    }
}

#[test]
fn test_axis_indices_round_trip_by_name() {
    let settings = AcquisitionSettings::builder()
        .frames(2, 0.0)
        .use_positions(true)
        .channels("Channel", vec![ChannelSpec::new("DAPI", 5.0)])
        .slices(SliceSettings::new(0.0, 2.0, 1.0))
        .build();
    for event in run(&settings, &positions(2)) {
        let coords = Coords::from_standard_axes(event.axes());
        for axis in [TIME_AXIS, POSITION_AXIS, CHANNEL_AXIS, Z_AXIS] {
            assert_eq!(coords.index(axis), event.axis_position(axis), "axis {}", axis);
        }
        assert_eq!(event.acq_index(), Some(0));
    }
}

#[test]
fn test_last_timepoint_is_terminal() {
    let settings = AcquisitionSettings::builder().frames(3, 50.0).build();
    let events = run(&settings, &PositionList::new());
    assert!(!events[1].is_terminal(TIME_AXIS));
    assert!(events[2].is_terminal(TIME_AXIS));
    assert_eq!(
        events[2].min_start_time(),
        Some(std::time::Duration::from_millis(100))
    );
}
