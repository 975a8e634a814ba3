//! Video capture, composition and streaming
//!
//! V4L2 capture sessions, frame normalization, preview composition and
//! H.264/RTSP publishing, coordinated by the session supervisor.

pub mod capture;
pub mod compose;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod normalize;
pub mod pipeline;
pub mod supervisor;

pub use capture::DeviceSession;
pub use device::{probe_cameras, CameraDescriptor};
pub use encoder::RtspEncoder;
pub use format::{PixelFormat, Resolution, FPS_PRESETS};
pub use frame::{Canvas, PixelLayout, RawFrame, RgbFrame};
pub use pipeline::{
    PipelineState, PreviewPipeline, StreamConfig, StreamStats, StreamingPipeline,
};
pub use supervisor::SessionSupervisor;
