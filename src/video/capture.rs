//! V4L2 capture session
//!
//! One open handle per session, memory-mapped buffers, blocking reads.
//! Sessions are owned by a single pipeline instance and released when the
//! pipeline's loop exits.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::format::{PixelFormat, Resolution};
use super::frame::RawFrame;
use crate::error::{AppError, Result};

/// Number of memory-mapped capture buffers
const BUFFER_COUNT: u32 = 4;

/// Settle delay after opening the device, before format negotiation
const OPEN_SETTLE: Duration = Duration::from_millis(500);

/// An exclusive capture handle on one camera.
///
/// `open` negotiates the pixel format and stores what the driver actually
/// granted; callers must use `actual_width`/`actual_height` rather than the
/// requested values. At most one underlying device handle exists per
/// session, released on drop.
pub struct DeviceSession {
    dev: Device,
    index: u32,
    format: PixelFormat,
    width: u32,
    height: u32,
    closing: Arc<AtomicBool>,
}

impl DeviceSession {
    /// Open `/dev/video{index}` and negotiate a capture format.
    ///
    /// Resolution and frame rate are best-effort hints; drivers may grant
    /// something else and the session records the granted values. Open
    /// failure is returned as `DeviceUnavailable` and never retried here.
    pub fn open(index: u32, resolution: Resolution, fps: u32) -> Result<Self> {
        let dev = Device::new(index as usize).map_err(|e| AppError::DeviceUnavailable {
            index,
            reason: format!("open failed: {}", e),
        })?;

        // Some cameras reject ioctls issued immediately after open
        thread::sleep(OPEN_SETTLE);

        let (format, width, height) = negotiate_format(&dev, index, resolution)?;

        if let Err(e) = dev.set_params(&Parameters::with_fps(fps)) {
            warn!("Device {} rejected fps hint {}: {}", index, fps, e);
        }

        info!(
            "Device {} opened: {}x{} {} (requested {})",
            index, width, height, format, resolution
        );

        Ok(Self {
            dev,
            index,
            format,
            width,
            height,
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Width the driver granted, not the requested one
    pub fn actual_width(&self) -> u32 {
        self.width
    }

    /// Height the driver granted, not the requested one
    pub fn actual_height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    /// Start streaming and return a frame reader borrowing this session.
    pub fn reader(&self) -> Result<FrameReader<'_>> {
        let stream = MmapStream::with_buffers(&self.dev, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| AppError::DeviceUnavailable {
                index: self.index,
                reason: format!("stream start failed: {}", e),
            })?;
        Ok(FrameReader {
            stream,
            width: self.width,
            height: self.height,
            format: self.format,
            closing: self.closing.clone(),
        })
    }

    /// Mark the session as closing.
    ///
    /// Idempotent and safe to call while a validated read is retrying on
    /// another thread; the retry loop observes the flag between attempts.
    /// The device handle itself is released when the session drops.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            debug!("Device {} session closing", self.index);
        }
    }
}

/// Try the format preference order and return the first one the driver
/// actually grants. Falls back to the driver's current format when no
/// request sticks but the current format is one we can normalize.
fn negotiate_format(
    dev: &Device,
    index: u32,
    resolution: Resolution,
) -> Result<(PixelFormat, u32, u32)> {
    for &candidate in PixelFormat::PREFERENCE {
        let request = Format::new(resolution.width, resolution.height, candidate.to_fourcc());
        match dev.set_format(&request) {
            Ok(actual) => {
                if PixelFormat::from_fourcc(actual.fourcc) == Some(candidate) {
                    return Ok((candidate, actual.width, actual.height));
                }
                debug!(
                    "Device {} substituted {} for requested {}",
                    index, actual.fourcc, candidate
                );
            }
            Err(e) => debug!("Device {} rejected {}: {}", index, candidate, e),
        }
    }

    let current = dev.format().map_err(|e| AppError::DeviceUnavailable {
        index,
        reason: format!("format query failed: {}", e),
    })?;
    match PixelFormat::from_fourcc(current.fourcc) {
        Some(format) => {
            warn!(
                "Device {} kept its native format {} ({}x{})",
                index, format, current.width, current.height
            );
            Ok((format, current.width, current.height))
        }
        None => Err(AppError::DeviceUnavailable {
            index,
            reason: format!(
                "no supported pixel format (driver offers {})",
                current.fourcc
            ),
        }),
    }
}

/// Dequeues frames from a started session.
///
/// Borrows the session's device; dropping the reader stops streaming while
/// leaving the session open for a later restart.
pub struct FrameReader<'a> {
    stream: MmapStream<'a>,
    width: u32,
    height: u32,
    format: PixelFormat,
    closing: Arc<AtomicBool>,
}

impl FrameReader<'_> {
    /// One dequeue attempt. Transient failures surface as `ReadFailed`;
    /// the caller decides whether to retry or skip.
    pub fn read_frame(&mut self) -> Result<RawFrame> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(AppError::ReadFailed("session closing".into()));
        }

        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| AppError::ReadFailed(e.to_string()))?;

        let used = if meta.bytesused > 0 {
            (meta.bytesused as usize).min(buf.len())
        } else {
            buf.len()
        };
        if used == 0 {
            return Err(AppError::ReadFailed("empty frame".into()));
        }

        Ok(RawFrame {
            data: Bytes::copy_from_slice(&buf[..used]),
            width: self.width,
            height: self.height,
            format: self.format,
        })
    }

    /// Bounded retry read used during pipeline startup validation.
    /// Checks the session's closing flag and the caller's cancellation token
    /// between attempts so a concurrent stop cuts the retries short instead
    /// of waiting out the full window.
    pub fn read_frame_validated(
        &mut self,
        attempts: u32,
        backoff: Duration,
        cancel: &CancellationToken,
    ) -> Result<RawFrame> {
        let closing = self.closing.clone();
        retry_read(
            attempts,
            backoff,
            || closing.load(Ordering::Relaxed) || cancel.is_cancelled(),
            || self.read_frame(),
        )
    }
}

/// Retries `read` up to `attempts` times with `backoff` between failures.
/// The `aborted` check runs before every attempt and again before each
/// backoff sleep, so an abort raised mid-window returns without sleeping.
fn retry_read<T>(
    attempts: u32,
    backoff: Duration,
    mut aborted: impl FnMut() -> bool,
    mut read: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut last_error = None;
    for attempt in 0..attempts {
        if aborted() {
            return Err(AppError::ReadFailed("session closing".into()));
        }
        match read() {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("Validation read {}/{} failed: {}", attempt + 1, attempts, e);
                last_error = Some(e);
                if aborted() {
                    return Err(AppError::ReadFailed("session closing".into()));
                }
                thread::sleep(backoff);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| AppError::ReadFailed("no read attempts made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    #[test]
    fn test_retry_returns_first_success() {
        let reads = AtomicU32::new(0);
        let result = retry_read(
            5,
            Duration::from_millis(1),
            || false,
            || {
                let n = reads.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(AppError::ReadFailed("not ready".into()))
                } else {
                    Ok(n)
                }
            },
        );
        assert_eq!(result.ok(), Some(1));
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_skips_reads_once_aborted() {
        let reads = AtomicU32::new(0);
        let result: Result<()> = retry_read(
            10,
            Duration::from_millis(1),
            || true,
            || {
                reads.fetch_add(1, Ordering::SeqCst);
                Err(AppError::ReadFailed("unreachable".into()))
            },
        );
        assert!(result.is_err());
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_cut_short_without_backoff_sleep() {
        let aborted = AtomicBool::new(false);
        let started = Instant::now();
        let result: Result<()> = retry_read(
            10,
            Duration::from_millis(200),
            || aborted.load(Ordering::SeqCst),
            || {
                aborted.store(true, Ordering::SeqCst);
                Err(AppError::ReadFailed("no frame".into()))
            },
        );
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_retry_exhausts_attempts() {
        let reads = AtomicU32::new(0);
        let result: Result<()> = retry_read(
            3,
            Duration::from_millis(1),
            || false,
            || {
                reads.fetch_add(1, Ordering::SeqCst);
                Err(AppError::ReadFailed("no frame".into()))
            },
        );
        assert!(result.is_err());
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancellation_token_aborts_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reads = AtomicU32::new(0);
        let result: Result<()> = retry_read(
            10,
            Duration::from_millis(200),
            || cancel.is_cancelled(),
            || {
                reads.fetch_add(1, Ordering::SeqCst);
                Err(AppError::ReadFailed("no frame".into()))
            },
        );
        assert!(result.is_err());
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }
}
