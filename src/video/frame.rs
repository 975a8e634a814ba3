//! Frame data structures for the capture-to-publish path

use bytes::Bytes;
use serde::Serialize;

use super::format::PixelFormat;

/// A frame as dequeued from the capture device.
///
/// Owned by the pipeline iteration that read it; `normalize` consumes it,
/// so the payload is released before the next read on every path.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Raw pixel data, packed, no padding rows
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawFrame {
    /// Expected packed payload size for the frame's dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Whether the payload carries at least one full frame
    pub fn is_complete(&self) -> bool {
        !self.data.is_empty() && self.data.len() >= self.expected_len()
    }
}

/// Channel layout of a normalized frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Single luminance channel
    Gray,
    /// Canonical 3-channel RGB
    Rgb,
    /// 4-channel RGBA, alpha preserved
    Rgba,
}

impl PixelLayout {
    pub fn channels(&self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            PixelLayout::Rgb => 3,
            PixelLayout::Rgba => 4,
        }
    }
}

/// A normalized frame in canonical channel order.
///
/// Dimensions always equal those of the raw frame it was built from.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

/// A composited canvas, exactly viewport-sized, always 3-channel RGB.
///
/// Pixel data is skipped during serialization; events carrying a canvas
/// serialize only its dimensions.
#[derive(Debug, Clone, Serialize)]
pub struct Canvas {
    #[serde(skip_serializing)]
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}
