//! camstream - camera capture and RTSP publishing
//!
//! Captures live frames from a local V4L2 camera and either composites
//! them for preview or encodes and publishes them to an RTSP ingest
//! endpoint.

pub mod error;
pub mod events;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
