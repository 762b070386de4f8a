/// Core error types for depthcam.
use std::path::PathBuf;

use crate::frame::PixelFormat;

/// A specialized Result type for depthcam operations.
pub type DepthcamResult<T> = Result<T, DepthcamError>;

/// Top-level error type shared by the render, encode and CLI crates.
#[derive(Debug, thiserror::Error)]
pub enum DepthcamError {
    #[error("{renderer}: unsupported pixel format {format:?}")]
    UnsupportedPixelFormat {
        renderer: &'static str,
        format: PixelFormat,
    },

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("calibration data is already attached to these settings")]
    CalibrationAlreadyAttached,

    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("container error: {message} ({path:?})")]
    Container { message: String, path: PathBuf },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("track failed: {0}")]
    TrackFailed(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings encode error: {0}")]
    SettingsEncode(#[from] rmp_serde::encode::Error),

    #[error("settings decode error: {0}")]
    SettingsDecode(#[from] rmp_serde::decode::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DepthcamError {
    /// Create a container error tied to a file path.
    pub fn container(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        DepthcamError::Container {
            message: message.into(),
            path: path.into(),
        }
    }

    /// Create a GPU error.
    pub fn gpu(message: impl Into<String>) -> Self {
        DepthcamError::Gpu(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_format_display() {
        let err = DepthcamError::UnsupportedPixelFormat {
            renderer: "lens corrector",
            format: PixelFormat::DisparityFloat32,
        };
        assert_eq!(
            err.to_string(),
            "lens corrector: unsupported pixel format DisparityFloat32"
        );
    }

    #[test]
    fn test_container_error_display() {
        let err = DepthcamError::container("cannot open", "/rec/video.trk");
        assert!(err.to_string().contains("cannot open"));
        assert!(err.to_string().contains("video.trk"));
    }
}
