//! Camera probing and enumeration
//!
//! Scans a fixed range of V4L2 device indices, validating each candidate by
//! actually dequeuing frames. A device that opens but never delivers a frame
//! is not listed.

use serde::Serialize;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

/// Highest device index probed (exclusive)
const PROBE_INDEX_LIMIT: u32 = 5;

/// Settle delay after opening a device before the first read
const PROBE_SETTLE: Duration = Duration::from_millis(300);

/// Validation reads per candidate device
const PROBE_READ_ATTEMPTS: u32 = 3;

/// Backoff between validation reads
const PROBE_READ_BACKOFF: Duration = Duration::from_millis(100);

/// Pause between probing consecutive indices
const PROBE_INDEX_PAUSE: Duration = Duration::from_millis(150);

/// A camera discovered during probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraDescriptor {
    /// V4L2 device index (/dev/video{index})
    pub index: u32,
    /// Width the device reported while probed
    pub probed_width: u32,
    /// Height the device reported while probed
    pub probed_height: u32,
}

/// Probe device indices 0..5 and return every camera that delivered
/// at least one frame.
///
/// Blocking; run inside `spawn_blocking` from async contexts. Devices that
/// fail to open or never produce a frame are skipped silently (logged at
/// debug level).
pub fn probe_cameras() -> Vec<CameraDescriptor> {
    let mut cameras = Vec::new();

    for index in 0..PROBE_INDEX_LIMIT {
        match probe_index(index) {
            Some(descriptor) => {
                info!(
                    "Camera found at index {}: {}x{}",
                    index, descriptor.probed_width, descriptor.probed_height
                );
                cameras.push(descriptor);
            }
            None => debug!("No usable camera at index {}", index),
        }
        thread::sleep(PROBE_INDEX_PAUSE);
    }

    info!("Probe complete: {} camera(s) found", cameras.len());
    cameras
}

/// Probe a single index. None when the device is absent, busy, or
/// never delivers a frame within the attempt bound.
fn probe_index(index: u32) -> Option<CameraDescriptor> {
    let dev = Device::new(index as usize).ok()?;

    // Some cameras need a moment after open before they stream
    thread::sleep(PROBE_SETTLE);

    let fmt = dev.format().ok()?;
    let mut stream = MmapStream::with_buffers(&dev, Type::VideoCapture, 2).ok()?;

    for attempt in 0..PROBE_READ_ATTEMPTS {
        match stream.next() {
            Ok((buf, meta)) if meta.bytesused > 0 || !buf.is_empty() => {
                return Some(CameraDescriptor {
                    index,
                    probed_width: fmt.width,
                    probed_height: fmt.height,
                });
            }
            Ok(_) => debug!("Empty frame from index {} (attempt {})", index, attempt + 1),
            Err(e) => debug!(
                "Read failed on index {} (attempt {}): {}",
                index,
                attempt + 1,
                e
            ),
        }
        thread::sleep(PROBE_READ_BACKOFF);
    }

    None
}
