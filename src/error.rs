use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Camera unavailable [index {index}]: {reason}")]
    DeviceUnavailable { index: u32, reason: String },

    #[error("Frame read failed: {0}")]
    ReadFailed(String),

    #[error("Encoder error: {0}")]
    EncoderError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Whether the error is transient (retry may succeed) or fatal
    /// for the pipeline instance that observed it.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::ReadFailed(_))
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;
