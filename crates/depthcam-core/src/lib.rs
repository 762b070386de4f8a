//! # depthcam-core
//!
//! Core types shared by every depthcam crate: images and audio buffers,
//! the output frame pool, camera calibration, per-session processor
//! settings, configuration, output naming and the error type.

pub mod calibration;
pub mod config;
pub mod error;
pub mod frame;
pub mod math;
pub mod output;
pub mod pool;
pub mod settings;
pub mod time;

pub use calibration::{CameraCalibrationData, LensDistortionTable, ScaledIntrinsics};
pub use config::{
    CaptureConfig, CodecConfig, ContainerBackend, DepthcamConfig, OutputConfig, RenderBackend,
    RenderConfig,
};
pub use error::{DepthcamError, DepthcamResult};
pub use frame::{f16_to_f32, f32_to_f16, AudioBuffer, FormatDescription, ImageBuffer, PixelFormat};
pub use math::{Dimensions, Matrix3, Matrix4x3, Point2, Point3, Rect};
pub use output::{OutputType, RecordingFolder};
pub use pool::{FramePool, PooledFrame, OUTPUT_POOL_MARGIN};
pub use settings::{CameraPosition, ProcessorSettings, VideoOrientation, DEFAULT_LANDMARK_COUNT};
pub use time::Timestamp;
