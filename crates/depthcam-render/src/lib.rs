//! # depthcam-render
//!
//! Per-frame transforms for the capture pipeline. Every renderer implements
//! [`FrameRenderer`] and runs either as a wgpu compute shader or as the
//! equivalent rayon kernel on the CPU:
//!
//! - [`LensDistortionCorrector`]: rectifies color frames and depth maps.
//! - [`DepthCodec`]: depth <-> 8-bit grayscale for storage in video tracks.
//! - [`PointCloudReprojector`]: lifts 2D landmarks into camera space.
//!
//! [`FaceLandmarksProcessor`] chains them for the face landmark outputs.

pub mod codec;
pub mod device;
pub mod face;
pub mod gpu;
pub mod lens;
pub mod point_cloud;
pub mod renderer;

pub use codec::{CodecDirection, CodecParameters, DepthCodec};
pub use device::ComputeDevice;
pub use face::{FaceLandmarksProcessor, FaceObservation, FaceRecord};
pub use gpu::GpuContext;
pub use lens::{lens_distortion_point, rectify_point, LensDistortionCorrector};
pub use point_cloud::{PointCloudInput, PointCloudReprojector, PooledPoints};
pub use renderer::FrameRenderer;
