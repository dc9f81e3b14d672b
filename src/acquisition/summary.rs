//! Derived quantities of an acquisition: image counts, memory, duration, and the
//! summary metadata attached to each datastore.
//!
//! Counts follow exactly what the sequencer produces, so
//! [`total_images`] always equals the number of events of a full run.

use crate::acquisition::position::PositionList;
use crate::acquisition::settings::AcquisitionSettings;
use crate::error::{AcqError, AppResult};
use crate::hardware::ImageGeometry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Channel name recorded when the acquisition has no channel axis.
pub const DEFAULT_CHANNEL_NAME: &str = "Default";

/// Metadata describing a whole dataset.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryMetadata {
    pub prefix: String,
    pub directory: Option<PathBuf>,
    pub channel_group: String,
    pub channel_names: Vec<String>,
    pub channel_colors: Vec<u32>,
    pub frames: u32,
    pub slices: u32,
    pub channels: u32,
    pub positions: u32,
    pub position_labels: Vec<String>,
    pub slices_first: bool,
    pub time_first: bool,
    pub interval_ms: f64,
    pub z_step_um: f64,
    pub comment: String,
    pub camera: String,
    pub geometry: ImageGeometry,
    pub run_id: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub software_version: String,
    /// User-supplied entries, kept apart from the computed fields.
    pub user_data: BTreeMap<String, String>,
}

/// Timepoints in the acquisition.
pub fn num_frames(settings: &AcquisitionSettings) -> u32 {
    if settings.use_custom_intervals() {
        settings.custom_intervals_ms().len() as u32
    } else if settings.use_frames() {
        settings.num_frames()
    } else {
        1
    }
}

/// Slices per stack, 1 without a z axis.
pub fn num_slices(settings: &AcquisitionSettings) -> AppResult<u32> {
    if settings.use_slices() {
        settings.slices().count()
    } else {
        Ok(1)
    }
}

/// Enabled channels, 1 without a channel axis.
pub fn num_channels(settings: &AcquisitionSettings) -> u32 {
    match settings.enabled_channels().len() {
        0 => 1,
        n => n as u32,
    }
}

/// Stage positions, 1 without a position axis.
pub fn num_positions(settings: &AcquisitionSettings, positions: &PositionList) -> u32 {
    if settings.use_positions() && !positions.is_empty() {
        positions.len() as u32
    } else {
        1
    }
}

/// Number of images the acquisition produces, honouring skip factors and
/// per-channel z-stack toggles.
pub fn total_images(settings: &AcquisitionSettings, positions: &PositionList) -> AppResult<u64> {
    let frames = num_frames(settings);
    let slices = u64::from(num_slices(settings)?);
    let positions = u64::from(num_positions(settings, positions));
    let channels = settings.enabled_channels();

    let per_position = if channels.is_empty() {
        u64::from(frames).checked_mul(slices)
    } else {
        channels.iter().try_fold(0u64, |acc, channel| {
            let stack = if channel.do_z_stack { slices } else { 1 };
            u64::from(channel.frames_acquired(frames))
                .checked_mul(stack)
                .and_then(|n| acc.checked_add(n))
        })
    };
    per_position
        .and_then(|n| n.checked_mul(positions))
        .ok_or_else(|| too_large("image count"))
}

/// Memory needed to hold every image, bytes.
pub fn total_memory(
    settings: &AcquisitionSettings,
    positions: &PositionList,
    geometry: ImageGeometry,
) -> AppResult<u64> {
    total_images(settings, positions)?
        .checked_mul(geometry.bytes_per_image())
        .ok_or_else(|| too_large("memory requirement"))
}

fn too_large(what: &str) -> AcqError {
    AcqError::Configuration(format!("acquisition {} overflows", what))
}

/// Sum of exposures in one timepoint, ms. Without channels every image uses
/// `current_exposure_ms`.
pub fn exposure_per_timepoint_ms(
    settings: &AcquisitionSettings,
    positions: &PositionList,
    current_exposure_ms: f64,
) -> AppResult<f64> {
    let slices = f64::from(num_slices(settings)?);
    let positions = f64::from(num_positions(settings, positions));
    let channels = settings.enabled_channels();

    let per_position = if channels.is_empty() {
        current_exposure_ms * slices
    } else {
        channels
            .iter()
            .map(|c| c.exposure_ms * if c.do_z_stack { slices } else { 1.0 })
            .sum()
    };
    Ok(per_position * positions)
}

/// Lower bound on the acquisition's duration.
pub fn minimum_duration(
    settings: &AcquisitionSettings,
    positions: &PositionList,
    current_exposure_ms: f64,
) -> AppResult<Duration> {
    let frames = num_frames(settings);
    if frames == 0 {
        return Ok(Duration::ZERO);
    }
    let exposure = exposure_per_timepoint_ms(settings, positions, current_exposure_ms)?;
    let interval = settings.interval_ms().max(exposure);
    let total_ms = interval * f64::from(frames - 1) + exposure;
    Ok(Duration::try_from_secs_f64(total_ms / 1000.0).unwrap_or(Duration::ZERO))
}

/// Axis order, when there is more than one axis to order.
pub fn order_description(settings: &AcquisitionSettings) -> Option<&'static str> {
    let axes = [
        settings.use_frames(),
        settings.use_positions(),
        !settings.enabled_channels().is_empty(),
        settings.use_slices(),
    ];
    if axes.iter().filter(|on| **on).count() > 1 {
        Some(settings.order().description())
    } else {
        None
    }
}

/// Multi-line, human readable summary.
pub fn verbose_summary(
    settings: &AcquisitionSettings,
    positions: &PositionList,
    geometry: ImageGeometry,
    current_exposure_ms: f64,
) -> AppResult<String> {
    let mut out = String::new();
    // Writing to a String never fails.
    let _ = writeln!(out, "Number of time points: {}", num_frames(settings));
    let _ = writeln!(out, "Number of positions: {}", num_positions(settings, positions));
    let _ = writeln!(out, "Number of slices: {}", num_slices(settings)?);
    let _ = writeln!(out, "Number of channels: {}", num_channels(settings));
    let _ = writeln!(out, "Total images: {}", total_images(settings, positions)?);
    let _ = writeln!(
        out,
        "Total memory: {}",
        format_memory(total_memory(settings, positions, geometry)?)
    );
    let _ = write!(
        out,
        "Minimum duration: {}",
        format_duration(minimum_duration(settings, positions, current_exposure_ms)?)
    );
    if let Some(order) = order_description(settings) {
        let _ = write!(out, "\nOrder: {}", order);
    }
    Ok(out)
}

/// Summary metadata for one sub-acquisition.
pub fn summary_metadata(
    settings: &AcquisitionSettings,
    positions: &PositionList,
    geometry: ImageGeometry,
    camera: &str,
    run_id: Uuid,
) -> AppResult<SummaryMetadata> {
    let channels = settings.enabled_channels();
    let position_labels = if settings.use_positions() {
        positions.iter().map(|p| p.label.clone()).collect()
    } else {
        Vec::new()
    };
    Ok(SummaryMetadata {
        prefix: settings.prefix().to_string(),
        directory: settings.save().then(|| settings.root().to_path_buf()),
        channel_group: settings.channel_group().to_string(),
        channel_names: if channels.is_empty() {
            vec![DEFAULT_CHANNEL_NAME.to_string()]
        } else {
            channels.iter().map(|c| c.config.clone()).collect()
        },
        channel_colors: channels.iter().map(|c| c.color).collect(),
        frames: num_frames(settings),
        slices: num_slices(settings)?,
        channels: num_channels(settings),
        positions: num_positions(settings, positions),
        position_labels,
        slices_first: settings.order().is_slices_first(),
        time_first: settings.order().is_time_first(),
        interval_ms: settings.interval_ms(),
        z_step_um: if settings.use_slices() {
            settings.slices().signed_step()
        } else {
            0.0
        },
        comment: settings.comment().to_string(),
        camera: camera.to_string(),
        geometry,
        run_id: Some(run_id),
        start_time: Some(Utc::now()),
        software_version: env!("CARGO_PKG_VERSION").to_string(),
        user_data: settings.user_metadata().clone(),
    })
}

/// `1536 MB` style memory string; GB above 1024 MB.
pub fn format_memory(bytes: u64) -> String {
    let mb = bytes as f64 / BYTES_PER_MB;
    if mb > 1024.0 {
        format!("{} GB", display_number(mb / 1024.0))
    } else {
        format!("{} MB", display_number(mb))
    }
}

/// `1h 2m 3.5s` style duration string.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = total - hours * 3600.0 - minutes * 60.0;

    let mut out = String::new();
    if hours > 0.0 {
        let _ = write!(out, "{}h ", hours);
    }
    if hours > 0.0 || minutes > 0.0 {
        let _ = write!(out, "{}m ", minutes);
    }
    let _ = write!(out, "{}s", display_number(seconds));
    out
}

fn display_number(value: f64) -> String {
    let text = format!("{:.2}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() || text == "-" {
        "0".to_string()
    } else {
        text.to_string()
    }
}
