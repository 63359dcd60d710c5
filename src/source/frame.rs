//! Decoded frame types

use bytes::Bytes;
use serde::Deserialize;

/// Packed pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Bgr24,
    Rgb24,
    Gray8,
}

impl PixelFormat {
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgr24 | Self::Rgb24 => 3,
            Self::Gray8 => 1,
        }
    }

    /// Name understood by ffmpeg's `-pix_fmt`.
    #[must_use]
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Bgr24 => "bgr24",
            Self::Rgb24 => "rgb24",
            Self::Gray8 => "gray",
        }
    }
}

/// Output dimensions and layout of every frame in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl FrameGeometry {
    #[must_use]
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }

    /// Bytes in one packed frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }
}

/// A decoded image. Once yielded, the source keeps no reference to it.
#[derive(Debug, Clone)]
pub struct Frame {
    index: u64,
    geometry: FrameGeometry,
    data: Bytes,
}

impl Frame {
    pub(crate) fn new(index: u64, geometry: FrameGeometry, data: Bytes) -> Self {
        Self {
            index,
            geometry,
            data,
        }
    }

    /// Position in playback order: 0, 1, 2, ... with no gaps.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        self.geometry.pixel_format
    }

    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Bytes {
        self.data
    }
}
