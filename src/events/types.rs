//! Control event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::Serialize;

use crate::video::device::CameraDescriptor;
use crate::video::frame::Canvas;

/// Which pipeline an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Preview,
    Streaming,
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineKind::Preview => write!(f, "preview"),
            PipelineKind::Streaming => write!(f, "streaming"),
        }
    }
}

/// Events published on the bus by the pipelines and the supervisor.
///
/// Serialized as tagged JSON so the CLI can print them as JSON lines.
/// `FrameReady` carries the composited canvas for in-process consumers;
/// its pixel data is skipped during serialization.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Result of a camera probe sweep
    DeviceList { cameras: Vec<CameraDescriptor> },

    /// A pipeline changed state
    StatusChanged {
        pipeline: PipelineKind,
        state: String,
        /// Present on failure, carries the error text
        message: Option<String>,
    },

    /// Periodic statistics from a running pipeline
    StatsUpdated {
        pipeline: PipelineKind,
        frame_count: u64,
        elapsed_secs: f64,
        fps: f64,
    },

    /// A composited preview canvas is ready for rendering
    FrameReady { canvas: Canvas },

    /// An operation failed outside a pipeline state change
    ErrorOccurred { module: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_serializes_tagged() {
        let event = ControlEvent::StatusChanged {
            pipeline: PipelineKind::Preview,
            state: "running".to_string(),
            message: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"status_changed\""));
        assert!(json.contains("\"pipeline\":\"preview\""));
    }

    #[test]
    fn test_frame_ready_skips_pixel_data() {
        let event = ControlEvent::FrameReady {
            canvas: Canvas {
                data: vec![0u8; 320 * 240 * 3],
                width: 320,
                height: 240,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"width\":320"));
        assert!(!json.contains("\"data\""));
    }
}
