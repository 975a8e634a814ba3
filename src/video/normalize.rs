//! Channel-order normalization
//!
//! Capture delivers whatever packed layout the driver negotiated; everything
//! downstream (compositor, encoder) expects canonical channel order. The
//! normalizer is a pure function: no I/O, no retained state.

use tracing::trace;

use super::frame::{PixelLayout, RawFrame, RgbFrame};
use crate::video::format::PixelFormat;

/// Channel layout a raw format normalizes into.
///
/// Lets the encoder fix its caps from the negotiated capture format before
/// any frame has been normalized.
pub fn layout_of(format: PixelFormat) -> PixelLayout {
    match format {
        PixelFormat::Bgr24 | PixelFormat::Rgb24 => PixelLayout::Rgb,
        PixelFormat::Rgba32 => PixelLayout::Rgba,
        PixelFormat::Grey => PixelLayout::Gray,
    }
}

/// Normalize a raw frame into canonical channel order.
///
/// BGR24 gets its channels swapped to RGB (drivers deliver blue-first and
/// downstream consumers assume red-first, so the swap is mandatory for
/// color correctness). GREY passes through as a single channel, RGBA32
/// passes through in order, RGB24 passes through unchanged.
///
/// Consumes the raw frame, releasing its payload when normalization ends.
/// Returns `None` for an empty or truncated payload; the caller skips the
/// frame and keeps the pipeline running.
pub fn normalize(frame: RawFrame) -> Option<RgbFrame> {
    if !frame.is_complete() {
        trace!(
            "Skipping incomplete frame: {} bytes, expected {}",
            frame.data.len(),
            frame.expected_len()
        );
        return None;
    }

    let len = frame.expected_len();
    let data = match frame.format {
        PixelFormat::Bgr24 => {
            let mut rgb = frame.data[..len].to_vec();
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            rgb
        }
        PixelFormat::Rgb24 | PixelFormat::Rgba32 | PixelFormat::Grey => {
            frame.data[..len].to_vec()
        }
    };

    Some(RgbFrame {
        data,
        width: frame.width,
        height: frame.height,
        layout: layout_of(frame.format),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn raw(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> RawFrame {
        RawFrame {
            data: Bytes::from(data),
            width,
            height,
            format,
        }
    }

    #[test]
    fn test_bgr_channels_swapped() {
        // One blue pixel followed by one red pixel, BGR order
        let frame = raw(vec![255, 0, 0, 0, 0, 255], 2, 1, PixelFormat::Bgr24);
        let rgb = normalize(frame).unwrap();

        assert_eq!(rgb.layout, PixelLayout::Rgb);
        assert_eq!(&rgb.data, &[0, 0, 255, 255, 0, 0]);
    }

    #[test]
    fn test_rgb_passthrough() {
        let frame = raw(vec![10, 20, 30, 40, 50, 60], 2, 1, PixelFormat::Rgb24);
        let rgb = normalize(frame).unwrap();
        assert_eq!(&rgb.data, &[10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_grey_keeps_single_channel() {
        let frame = raw(vec![7, 8, 9, 10], 2, 2, PixelFormat::Grey);
        let gray = normalize(frame).unwrap();
        assert_eq!(gray.layout, PixelLayout::Gray);
        assert_eq!(gray.data.len(), 4);
    }

    #[test]
    fn test_rgba_preserved_in_order() {
        let frame = raw(vec![1, 2, 3, 4, 5, 6, 7, 8], 2, 1, PixelFormat::Rgba32);
        let rgba = normalize(frame).unwrap();
        assert_eq!(rgba.layout, PixelLayout::Rgba);
        assert_eq!(&rgba.data, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_truncated_frame_skipped() {
        let frame = raw(vec![0u8; 5], 2, 1, PixelFormat::Bgr24);
        assert!(normalize(frame).is_none());
    }

    #[test]
    fn test_empty_frame_skipped() {
        let frame = raw(Vec::new(), 2, 1, PixelFormat::Grey);
        assert!(normalize(frame).is_none());
    }

    #[test]
    fn test_dimensions_preserved() {
        let frame = raw(vec![0u8; 4 * 3 * 3], 4, 3, PixelFormat::Bgr24);
        let rgb = normalize(frame).unwrap();
        assert_eq!((rgb.width, rgb.height), (4, 3));
    }

    #[test]
    fn test_layout_mapping() {
        assert_eq!(layout_of(PixelFormat::Bgr24), PixelLayout::Rgb);
        assert_eq!(layout_of(PixelFormat::Rgb24), PixelLayout::Rgb);
        assert_eq!(layout_of(PixelFormat::Rgba32), PixelLayout::Rgba);
        assert_eq!(layout_of(PixelFormat::Grey), PixelLayout::Gray);
    }

    #[test]
    fn test_excess_payload_truncated() {
        // Drivers sometimes report trailing padding in bytesused
        let frame = raw(vec![0u8; 2 * 1 * 3 + 16], 2, 1, PixelFormat::Rgb24);
        let rgb = normalize(frame).unwrap();
        assert_eq!(rgb.data.len(), 6);
    }
}
