//! Aspect-preserving composition onto a viewport canvas
//!
//! Scales a normalized frame to fit a viewport without distortion and
//! centers it on a black canvas of exactly the viewport size (letterbox or
//! pillarbox as the aspect ratios dictate).

use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::trace;

use super::frame::{Canvas, PixelLayout, RgbFrame};

/// Viewports with either dimension at or below this are skipped; they show
/// up transiently while a window manager is still laying out the surface.
const MIN_VIEWPORT_DIM: u32 = 10;

/// Fit a frame into a viewport, preserving aspect ratio.
///
/// Returns `None` when the viewport is degenerate or the frame payload does
/// not match its dimensions. The canvas is always 3-channel RGB and exactly
/// `viewport_w` x `viewport_h`; the scaled frame is centered and the
/// remainder stays black.
pub fn fit(frame: &RgbFrame, viewport_w: u32, viewport_h: u32) -> Option<Canvas> {
    if viewport_w <= MIN_VIEWPORT_DIM || viewport_h <= MIN_VIEWPORT_DIM {
        trace!("Skipping degenerate viewport {}x{}", viewport_w, viewport_h);
        return None;
    }
    if frame.width == 0 || frame.height == 0 {
        return None;
    }

    let rgb = expand_to_rgb(frame)?;

    let ratio = f64::min(
        viewport_w as f64 / frame.width as f64,
        viewport_h as f64 / frame.height as f64,
    );
    let target_w = ((frame.width as f64 * ratio) as u32).max(1);
    let target_h = ((frame.height as f64 * ratio) as u32).max(1);

    let scaled = imageops::resize(&rgb, target_w, target_h, FilterType::Triangle);

    let mut canvas = RgbImage::new(viewport_w, viewport_h);
    let x = (viewport_w - target_w) / 2;
    let y = (viewport_h - target_h) / 2;
    imageops::replace(&mut canvas, &scaled, x as i64, y as i64);

    Some(Canvas {
        data: canvas.into_raw(),
        width: viewport_w,
        height: viewport_h,
    })
}

/// Expand a normalized frame to 3-channel RGB for scaling.
///
/// Grayscale is replicated across channels, RGBA drops alpha. Returns
/// `None` when the payload length does not match the declared layout.
fn expand_to_rgb(frame: &RgbFrame) -> Option<RgbImage> {
    let pixels = frame.width as usize * frame.height as usize;
    if frame.data.len() < pixels * frame.layout.channels() {
        return None;
    }

    let rgb = match frame.layout {
        PixelLayout::Rgb => frame.data[..pixels * 3].to_vec(),
        PixelLayout::Gray => frame.data[..pixels]
            .iter()
            .flat_map(|&y| [y, y, y])
            .collect(),
        PixelLayout::Rgba => frame.data[..pixels * 4]
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
    };

    RgbImage::from_raw(frame.width, frame.height, rgb)
}
