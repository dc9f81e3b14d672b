//! Tagged engine output and converted images.

use crate::acquisition::event::AxisPositions;
use crate::data::coords::Coords;
use crate::hardware::ImageGeometry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Metadata the engine attaches to every raw image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageTags {
    /// Owning sub-acquisition. Images without one cannot be routed.
    pub acq_index: Option<usize>,
    /// Axis indices, including extension axes.
    pub axes: AxisPositions,
    /// Axes on which this image holds the last value.
    pub terminal_axes: BTreeSet<String>,
    /// Camera geometry at the time of the snap.
    pub geometry: ImageGeometry,
    /// Camera device name.
    pub camera: String,
    /// Exposure, ms.
    pub exposure_ms: f64,
    /// Channel preset, when the channel axis is in use.
    pub channel_name: Option<String>,
    /// Focus position, µm.
    pub z_um: Option<f64>,
    /// XY stage position, µm.
    pub xy_um: Option<(f64, f64)>,
    /// Stage position label.
    pub position_name: Option<String>,
    /// Time since the acquisition started, ms.
    pub elapsed_ms: f64,
    /// Free-form tags copied from the event.
    pub extra: BTreeMap<String, String>,
}

/// Raw engine output: pixel bytes plus tags.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedImage {
    /// Little-endian pixel bytes.
    pub pixels: Vec<u8>,
    #[allow(missing_docs)]
    pub tags: ImageTags,
}

/// Pixel storage.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel) - Common for scientific cameras
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Get the number of pixels
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len() * 2,
        }
    }

    /// Pixel value at `index`, widened.
    pub fn get(&self, index: usize) -> Option<u16> {
        match self {
            PixelBuffer::U8(data) => data.get(index).map(|v| u16::from(*v)),
            PixelBuffer::U16(data) => data.get(index).copied(),
        }
    }
}

/// Per-image metadata kept alongside the pixels.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    pub camera: String,
    pub exposure_ms: f64,
    pub channel_name: Option<String>,
    pub z_um: Option<f64>,
    pub xy_um: Option<(f64, f64)>,
    pub position_name: Option<String>,
    pub elapsed_ms: f64,
    pub received: DateTime<Utc>,
    pub user_data: BTreeMap<String, String>,
}

/// Why a tagged image could not be converted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversionError {
    /// The pixel data does not fit in memory.
    #[error("unable to allocate {0} bytes for pixel data")]
    OutOfMemory(usize),
    /// Pixel bytes and geometry disagree.
    #[error("malformed image: {0}")]
    Malformed(String),
}

/// An image ready for a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: PixelBuffer,
    width: u32,
    height: u32,
    coords: Coords,
    metadata: Metadata,
}

impl Image {
    /// Convert raw engine output, placing it at `coords`.
    pub fn from_tagged(tagged: TaggedImage, coords: Coords) -> Result<Self, ConversionError> {
        let TaggedImage { pixels, tags } = tagged;
        let geometry = tags.geometry;
        let expected = geometry.bytes_per_image();
        if pixels.len() as u64 != expected {
            return Err(ConversionError::Malformed(format!(
                "{} bytes for a {}x{}x{} image",
                pixels.len(),
                geometry.width,
                geometry.height,
                geometry.bytes_per_pixel
            )));
        }

        let buffer = match geometry.bytes_per_pixel {
            1 => PixelBuffer::U8(pixels),
            2 => {
                let count = pixels.len() / 2;
                let mut data: Vec<u16> = Vec::new();
                data.try_reserve_exact(count)
                    .map_err(|_| ConversionError::OutOfMemory(pixels.len()))?;
                data.extend(
                    pixels
                        .chunks_exact(2)
                        .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
                );
                PixelBuffer::U16(data)
            }
            other => {
                return Err(ConversionError::Malformed(format!(
                    "unsupported pixel depth of {} bytes",
                    other
                )))
            }
        };

        let metadata = Metadata {
            camera: tags.camera,
            exposure_ms: tags.exposure_ms,
            channel_name: tags.channel_name,
            z_um: tags.z_um,
            xy_um: tags.xy_um,
            position_name: tags.position_name,
            elapsed_ms: tags.elapsed_ms,
            received: Utc::now(),
            user_data: tags.extra,
        };
        Ok(Self {
            pixels: buffer,
            width: geometry.width,
            height: geometry.height,
            coords,
            metadata,
        })
    }

    #[allow(missing_docs)]
    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    #[allow(missing_docs)]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[allow(missing_docs)]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[allow(missing_docs)]
    pub fn coords(&self) -> &Coords {
        &self.coords
    }

    #[allow(missing_docs)]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Copy placed at different coordinates.
    pub fn with_coords(mut self, coords: Coords) -> Self {
        self.coords = coords;
        self
    }
}
