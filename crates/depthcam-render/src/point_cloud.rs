//! Landmark reprojection into camera-space 3D points.

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use depthcam_core::{
    DepthcamError, DepthcamResult, FormatDescription, ImageBuffer, Point2, Point3,
    ProcessorSettings, ScaledIntrinsics, OUTPUT_POOL_MARGIN,
};

use crate::device::{ComputeDevice, GpuStage};
use crate::renderer::{unprepared, FrameRenderer};

const SHADER: &str = include_str!("shaders/point_cloud.wgsl");
const NAME: &str = "point cloud";

/// One depth map plus the landmarks to lift, in depth-map pixels.
#[derive(Debug, Clone, Copy)]
pub struct PointCloudInput<'a> {
    pub depth: &'a ImageBuffer,
    pub landmarks: &'a [Point2],
}

/// Back-project a single pixel coordinate. Out-of-bounds coordinates and
/// invalid depth (non-finite or not positive) yield the zero point.
pub fn reproject_landmark(
    uv: Point2,
    depth: &ImageBuffer,
    intrinsics: &ScaledIntrinsics,
    disparity: bool,
) -> Point3 {
    if !(uv.x >= 0.0 && uv.y >= 0.0) {
        return Point3::zero();
    }
    if uv.x >= depth.width() as f32 || uv.y >= depth.height() as f32 {
        return Point3::zero();
    }
    let Some(mut z) = depth.f32_at(uv.x as u32, uv.y as u32) else {
        return Point3::zero();
    };
    if disparity {
        if !(z > 0.0) {
            return Point3::zero();
        }
        z = 1.0 / z;
    }
    if !z.is_finite() || z <= 0.0 {
        return Point3::zero();
    }
    Point3::new(
        (uv.x - intrinsics.cx) * z / intrinsics.fx,
        (uv.y - intrinsics.cy) * z / intrinsics.fy,
        z,
    )
}

type FreeList = Mutex<Vec<Vec<Point3>>>;

/// Point buffers recycled between frames, sized like the image pools.
struct PointPool {
    free: Arc<FreeList>,
    capacity: usize,
}

impl PointPool {
    fn new(len: usize, retained_hint: usize) -> Self {
        let capacity = retained_hint + OUTPUT_POOL_MARGIN;
        let free = (0..capacity).map(|_| vec![Point3::zero(); len]).collect();
        Self {
            free: Arc::new(Mutex::new(free)),
            capacity,
        }
    }

    fn outstanding(&self) -> usize {
        self.capacity - self.free.lock().len()
    }

    fn acquire(&self) -> Option<PooledPoints> {
        let points = self.free.lock().pop()?;
        Some(PooledPoints {
            points,
            home: Arc::downgrade(&self.free),
        })
    }
}

/// Reprojected landmarks borrowed from the reprojector's pool. The buffer
/// goes back when dropped, or is freed if the reprojector was reset.
pub struct PooledPoints {
    points: Vec<Point3>,
    home: Weak<FreeList>,
}

impl Deref for PooledPoints {
    type Target = [Point3];

    fn deref(&self) -> &[Point3] {
        &self.points
    }
}

impl DerefMut for PooledPoints {
    fn deref_mut(&mut self) -> &mut [Point3] {
        &mut self.points
    }
}

impl<'a> IntoIterator for &'a PooledPoints {
    type Item = &'a Point3;
    type IntoIter = std::slice::Iter<'a, Point3>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl Drop for PooledPoints {
    fn drop(&mut self) {
        if let Some(home) = self.home.upgrade() {
            home.lock().push(std::mem::take(&mut self.points));
        }
    }
}

impl std::fmt::Debug for PooledPoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.points.iter()).finish()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct PointCloudParams {
    fx: f32,
    fy: f32,
    cx: f32,
    cy: f32,
    width: u32,
    height: u32,
    count: u32,
    disparity: u32,
}

struct PointCloudStage {
    input_format: FormatDescription,
    landmark_count: usize,
    pool: PointPool,
    gpu: Option<GpuStage>,
}

/// Lifts 2D face landmarks into 3D using a depth map and the camera intrinsics.
///
/// Always returns exactly `landmark_count` points: missing landmarks and
/// landmarks without valid depth become zero points, extras are ignored.
pub struct PointCloudReprojector {
    device: ComputeDevice,
    settings: Arc<ProcessorSettings>,
    stage: Option<PointCloudStage>,
}

impl PointCloudReprojector {
    pub fn new(device: ComputeDevice, settings: Arc<ProcessorSettings>) -> Self {
        Self {
            device,
            settings,
            stage: None,
        }
    }

    /// Pad or truncate to `count` coordinates; padding lies outside every image.
    fn fixed_landmarks(landmarks: &[Point2], count: usize) -> Vec<Point2> {
        if landmarks.len() > count {
            tracing::warn!(
                "{}: {} landmarks supplied, ignoring all beyond {}",
                NAME,
                landmarks.len(),
                count
            );
        }
        let mut fixed: Vec<Point2> = landmarks.iter().take(count).copied().collect();
        fixed.resize(count, Point2::new(-1.0, -1.0));
        fixed
    }

    fn run_gpu(
        gpu: &GpuStage,
        depth: &ImageBuffer,
        landmarks: &[Point2],
        intrinsics: &ScaledIntrinsics,
    ) -> DepthcamResult<Vec<Point3>> {
        let params = PointCloudParams {
            fx: intrinsics.fx,
            fy: intrinsics.fy,
            cx: intrinsics.cx,
            cy: intrinsics.cy,
            width: depth.width(),
            height: depth.height(),
            count: landmarks.len() as u32,
            disparity: depth.format.pixel_format.is_disparity() as u32,
        };
        let coords: Vec<[f32; 2]> = landmarks.iter().map(|p| [p.x, p.y]).collect();
        // The shader samples 32-bit floats.
        let depth = depth.widened();
        let bytes = gpu.dispatch(
            bytemuck::bytes_of(&params),
            &[depth.data.as_slice(), bytemuck::cast_slice(&coords)],
            (landmarks.len() * 16) as u64,
            ((landmarks.len() as u32).div_ceil(64), 1, 1),
        )?;
        Ok(bytes
            .chunks_exact(16)
            .map(|c| {
                let v: [f32; 4] = bytemuck::pod_read_unaligned(c);
                Point3::new(v[0], v[1], v[2])
            })
            .collect())
    }
}

impl FrameRenderer for PointCloudReprojector {
    type Input<'a> = PointCloudInput<'a>;
    type Output = PooledPoints;

    fn name(&self) -> &'static str {
        NAME
    }

    fn prepare(
        &mut self,
        input_format: FormatDescription,
        output_retained_buffer_count_hint: usize,
    ) -> DepthcamResult<()> {
        self.reset();
        if !input_format.pixel_format.is_depth() {
            return Err(DepthcamError::UnsupportedPixelFormat {
                renderer: NAME,
                format: input_format.pixel_format,
            });
        }
        let gpu = self.device.compile("point_cloud", SHADER, 2)?;
        let landmark_count = self.settings.landmark_count;
        self.stage = Some(PointCloudStage {
            input_format,
            landmark_count,
            pool: PointPool::new(landmark_count, output_retained_buffer_count_hint),
            gpu,
        });
        tracing::debug!("{} prepared for {:?}", NAME, input_format);
        Ok(())
    }

    fn render(&mut self, input: PointCloudInput<'_>) -> Option<PooledPoints> {
        let Some(stage) = self.stage.as_ref() else {
            return unprepared(NAME);
        };
        if input.depth.format != stage.input_format {
            tracing::warn!(
                "{}: depth {:?} does not match prepared {:?}",
                NAME,
                input.depth.format,
                stage.input_format
            );
            return None;
        }
        let Some(calibration) = self.settings.calibration() else {
            tracing::warn!("{}: no camera calibration attached", NAME);
            return None;
        };
        let intrinsics = match calibration.scaled_intrinsics(input.depth.width()) {
            Ok(i) if i.fx != 0.0 && i.fy != 0.0 => i,
            Ok(_) => {
                tracing::warn!("{}: zero focal length in calibration", NAME);
                return None;
            }
            Err(e) => {
                tracing::warn!("{}: {}", NAME, e);
                return None;
            }
        };
        let Some(mut out) = stage.pool.acquire() else {
            tracing::warn!(
                "{}: output pool exhausted ({} in flight), dropping frame",
                NAME,
                stage.pool.outstanding()
            );
            return None;
        };
        if stage.landmark_count == 0 {
            return Some(out);
        }

        let landmarks = Self::fixed_landmarks(input.landmarks, stage.landmark_count);
        let disparity = input.depth.format.pixel_format.is_disparity();
        let slots: &mut [Point3] = &mut out;
        match &stage.gpu {
            None => slots
                .par_iter_mut()
                .zip(landmarks.par_iter())
                .for_each(|(dst, &uv)| {
                    *dst = reproject_landmark(uv, input.depth, &intrinsics, disparity)
                }),
            Some(gpu) => match Self::run_gpu(gpu, input.depth, &landmarks, &intrinsics) {
                Ok(points) => {
                    for (dst, p) in slots.iter_mut().zip(points) {
                        *dst = p;
                    }
                }
                Err(e) => {
                    tracing::error!("{}: {}", NAME, e);
                    return None;
                }
            },
        }
        Some(out)
    }

    fn reset(&mut self) {
        if self.stage.take().is_some() {
            tracing::debug!("{} reset", NAME);
        }
    }

    fn is_prepared(&self) -> bool {
        self.stage.is_some()
    }

    /// Point clouds are not images; there is no output image format.
    fn output_format(&self) -> Option<FormatDescription> {
        None
    }
}
