//! H.264 encoding and RTSP publishing via GStreamer
//!
//! Frames are pushed into an appsrc and flow through videoconvert into
//! x264enc, then out over rtspclientsink. Encoding policy is fixed:
//! constant 2000 kbps target, quantizer 23, GOP of two seconds, zero-latency
//! tune, TCP interleaved transport.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, warn};

use super::frame::{PixelLayout, RgbFrame};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Target bitrate in kbps
const BITRATE_KBPS: u32 = 2000;

/// Constant quantizer
const QUANTIZER: u32 = 23;

/// Upper bound on waiting for the EOS to drain through the sink at stop
const EOS_DRAIN_TIMEOUT: gst::ClockTime = gst::ClockTime::from_seconds(2);

/// Rejects out-of-order presentation timestamps.
///
/// The encoder's timebase must be strictly monotonic; a frame whose
/// timestamp does not advance is skipped rather than pushed.
#[derive(Debug, Default)]
pub struct TimestampGuard {
    last: Option<u64>,
}

impl TimestampGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `ts_micros` if it advances past everything seen so far.
    pub fn accept(&mut self, ts_micros: u64) -> bool {
        match self.last {
            Some(last) if ts_micros <= last => false,
            _ => {
                self.last = Some(ts_micros);
                true
            }
        }
    }
}

/// An H.264 publisher bound to one RTSP URL and one frame geometry.
///
/// Built once per streaming session; a new session gets a new encoder.
pub struct RtspEncoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    guard: TimestampGuard,
    frame_len: usize,
    throttler: LogThrottler,
    started: bool,
}

impl RtspEncoder {
    /// Build the pipeline without starting it.
    ///
    /// The appsrc caps are fixed to the session's negotiated layout and
    /// dimensions; videoconvert handles the conversion to I420 for x264enc.
    pub fn configure(
        sink_url: &str,
        width: u32,
        height: u32,
        fps: u32,
        layout: PixelLayout,
    ) -> Result<Self> {
        gst::init().map_err(|e| AppError::EncoderError(format!("gstreamer init: {}", e)))?;

        let launch = build_launch(sink_url, width, height, fps, layout);
        debug!("Encoder pipeline: {}", launch);

        let pipeline = gst::parse::launch(&launch)
            .map_err(|e| AppError::EncoderError(format!("pipeline parse: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| AppError::EncoderError("parsed element is not a pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| AppError::EncoderError("appsrc not found in pipeline".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| AppError::EncoderError("src element is not an appsrc".into()))?;

        let frame_len = width as usize * height as usize * layout.channels();

        info!(
            "Encoder configured: {}x{}@{} {}kbps q{} -> {}",
            width, height, fps, BITRATE_KBPS, QUANTIZER, sink_url
        );

        Ok(Self {
            pipeline,
            appsrc,
            guard: TimestampGuard::new(),
            frame_len,
            throttler: LogThrottler::default(),
            started: false,
        })
    }

    /// Set the pipeline to Playing. Fatal on failure; the streaming
    /// pipeline goes Failed rather than retrying.
    pub fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| AppError::EncoderError(format!("failed to start pipeline: {}", e)))?;
        self.started = true;
        Ok(())
    }

    /// Push one frame with an explicit presentation timestamp in
    /// microseconds since the session started.
    ///
    /// Recoverable conditions never stop the stream: a non-monotonic
    /// timestamp is skipped with a debug log, a geometry mismatch or push
    /// failure is logged (throttled) and swallowed.
    pub fn record(&mut self, frame: &RgbFrame, ts_micros: u64) {
        if !self.started {
            return;
        }
        if !self.guard.accept(ts_micros) {
            debug!("Skipping frame with non-monotonic timestamp {}", ts_micros);
            return;
        }
        if frame.data.len() < self.frame_len {
            warn_throttled!(
                self.throttler,
                "frame_geometry",
                "Frame payload {} shorter than configured {}, dropping",
                frame.data.len(),
                self.frame_len
            );
            return;
        }

        let buffer = match self.make_buffer(frame, ts_micros) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn_throttled!(self.throttler, "buffer_alloc", "Buffer allocation failed: {}", e);
                return;
            }
        };

        if let Err(e) = self.appsrc.push_buffer(buffer) {
            warn_throttled!(self.throttler, "push", "Frame push rejected: {:?}", e);
        }
    }

    fn make_buffer(&self, frame: &RgbFrame, ts_micros: u64) -> Result<gst::Buffer> {
        let mut buffer = gst::Buffer::with_size(self.frame_len)
            .map_err(|e| AppError::EncoderError(e.to_string()))?;
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| AppError::EncoderError("buffer not writable".into()))?;
            buffer.set_pts(gst::ClockTime::from_useconds(ts_micros));
            let mut map = buffer
                .map_writable()
                .map_err(|e| AppError::EncoderError(e.to_string()))?;
            map.copy_from_slice(&frame.data[..self.frame_len]);
        }
        Ok(buffer)
    }

    /// Flush and release the pipeline. Idempotent; safe even when
    /// `start` never succeeded.
    ///
    /// The EOS must drain through x264enc and the sink before the pipeline
    /// goes Null, otherwise the tail frames are cut off. The wait is
    /// bounded; a sink that never reports EOS is torn down anyway.
    pub fn stop(&mut self) {
        if self.started {
            match self.appsrc.end_of_stream() {
                Ok(_) => self.drain_eos(),
                Err(e) => debug!("EOS rejected during stop: {:?}", e),
            }
            self.started = false;
        }
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to reach Null state during stop: {}", e);
        }
    }

    fn drain_eos(&self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        match bus.timed_pop_filtered(
            EOS_DRAIN_TIMEOUT,
            &[gst::MessageType::Eos, gst::MessageType::Error],
        ) {
            Some(msg) => match msg.view() {
                gst::MessageView::Error(err) => {
                    warn!("Pipeline error while draining EOS: {}", err.error());
                }
                _ => debug!("EOS drained through the sink"),
            },
            None => warn!(
                "EOS not confirmed within {}, tearing down anyway",
                EOS_DRAIN_TIMEOUT
            ),
        }
    }
}

impl Drop for RtspEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Caps string for the appsrc, matching the normalized frame layout
fn caps_format(layout: PixelLayout) -> &'static str {
    match layout {
        PixelLayout::Gray => "GRAY8",
        PixelLayout::Rgb => "RGB",
        PixelLayout::Rgba => "RGBA",
    }
}

fn build_launch(sink_url: &str, width: u32, height: u32, fps: u32, layout: PixelLayout) -> String {
    format!(
        "appsrc name=src is-live=true format=time block=true \
         caps=video/x-raw,format={format},width={width},height={height},framerate={fps}/1 \
         ! videoconvert ! video/x-raw,format=I420 \
         ! x264enc tune=zerolatency speed-preset=ultrafast \
           bitrate={bitrate} quantizer={quantizer} key-int-max={gop} \
         ! h264parse \
         ! rtspclientsink location={url} protocols=tcp",
        format = caps_format(layout),
        width = width,
        height = height,
        fps = fps,
        bitrate = BITRATE_KBPS,
        quantizer = QUANTIZER,
        gop = fps * 2,
        url = sink_url,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_must_advance() {
        let mut guard = TimestampGuard::new();
        assert!(guard.accept(0));
        assert!(guard.accept(33_333));
        assert!(!guard.accept(33_333));
        assert!(!guard.accept(10_000));
        assert!(guard.accept(66_666));
    }

    #[test]
    fn test_guard_accepts_any_first_timestamp() {
        let mut guard = TimestampGuard::new();
        assert!(guard.accept(1_000_000));
    }

    #[test]
    fn test_launch_encoding_policy() {
        let launch = build_launch("rtsp://host:8554/cam", 1280, 720, 25, PixelLayout::Rgb);
        assert!(launch.contains("format=RGB,width=1280,height=720,framerate=25/1"));
        assert!(launch.contains("bitrate=2000"));
        assert!(launch.contains("quantizer=23"));
        assert!(launch.contains("key-int-max=50"));
        assert!(launch.contains("tune=zerolatency"));
        assert!(launch.contains("speed-preset=ultrafast"));
        assert!(launch.contains("rtspclientsink location=rtsp://host:8554/cam protocols=tcp"));
    }

    #[test]
    fn test_stop_before_start_skips_eos_drain() {
        // Building the pipeline needs the x264 and rtsp-client plugins;
        // skip quietly on hosts without them.
        let Ok(mut encoder) =
            RtspEncoder::configure("rtsp://127.0.0.1:8554/cam", 320, 240, 10, PixelLayout::Rgb)
        else {
            return;
        };
        // Never started: stop must not send EOS or block on the bus,
        // and a second stop is harmless.
        encoder.stop();
        assert!(!encoder.started);
        encoder.stop();
    }

    #[test]
    fn test_caps_follow_layout() {
        assert_eq!(caps_format(PixelLayout::Gray), "GRAY8");
        assert_eq!(caps_format(PixelLayout::Rgba), "RGBA");
        let launch = build_launch("rtsp://h/s", 640, 480, 10, PixelLayout::Gray);
        assert!(launch.contains("format=GRAY8"));
    }
}
