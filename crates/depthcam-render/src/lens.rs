//! Lens distortion correction.
//!
//! The calibration's lookup tables hold the relative radial magnification at
//! `n` linearly spaced radii, from the distortion center out to the farthest
//! image corner. Applying a table to a point scales its offset from the
//! center by `1 + magnification(r)`. Rectifying an image samples each output
//! pixel from the distorted position given by the inverse table.

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use std::sync::Arc;

use depthcam_core::{
    CameraCalibrationData, DepthcamError, DepthcamResult, Dimensions, FormatDescription,
    FramePool, ImageBuffer, LensDistortionTable, PixelFormat, Point2, PooledFrame,
    ProcessorSettings,
};

use crate::device::ComputeDevice;
use crate::gpu::image_workgroups;
use crate::renderer::{unprepared, FrameRenderer, ImageStage};

const SHADER: &str = include_str!("shaders/lens_correction.wgsl");
const NAME: &str = "lens corrector";

/// Distance from `center` to the farthest corner of an image of `size`.
pub fn distortion_r_max(center: Point2, size: Dimensions) -> f32 {
    let dx = center.x.max(size.width as f32 - center.x);
    let dy = center.y.max(size.height as f32 - center.y);
    (dx * dx + dy * dy).sqrt()
}

/// Map `point` through a distortion table around `center`.
///
/// Works with either table: the forward table distorts a rectilinear point,
/// the inverse table finds where a rectilinear pixel lies in the distorted
/// image.
pub fn lens_distortion_point(
    point: Point2,
    table: &LensDistortionTable,
    center: Point2,
    size: Dimensions,
) -> Point2 {
    let r_max = distortion_r_max(center, size);
    let v = point - center;
    let m = table.magnification_at(v.length(), r_max);
    center + v + v * m
}

/// Rectify a point given in pixels of an image `size`, using the calibration's
/// inverse table and its distortion center scaled to that image.
pub fn rectify_point(
    point: Point2,
    calibration: &CameraCalibrationData,
    size: Dimensions,
) -> DepthcamResult<Point2> {
    let table = calibration.rectification_table()?;
    let center = calibration.scaled_distortion_center(size.width)?;
    Ok(lens_distortion_point(point, table, center, size))
}

fn source_pixel(q: Point2, size: Dimensions) -> (usize, usize) {
    let sx = q.x.clamp(0.0, (size.width - 1) as f32) as usize;
    let sy = q.y.clamp(0.0, (size.height - 1) as f32) as usize;
    (sx, sy)
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct LensParams {
    center: [f32; 2],
    width: u32,
    height: u32,
    table_len: u32,
    r_max: f32,
    _pad: [u32; 2],
}

/// Rectifies BGRA color frames or float depth maps.
pub struct LensDistortionCorrector {
    device: ComputeDevice,
    settings: Arc<ProcessorSettings>,
    stage: Option<ImageStage>,
}

impl LensDistortionCorrector {
    pub fn new(device: ComputeDevice, settings: Arc<ProcessorSettings>) -> Self {
        Self {
            device,
            settings,
            stage: None,
        }
    }

    fn run_cpu(
        input: &ImageBuffer,
        frame: &mut PooledFrame,
        table: &LensDistortionTable,
        center: Point2,
    ) {
        let size = input.format.dimensions;
        let width = size.width as usize;
        let src = &input.data;
        frame
            .data
            .par_chunks_mut(width * 4)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let q = lens_distortion_point(
                        Point2::new(x as f32, y as f32),
                        table,
                        center,
                        size,
                    );
                    let (sx, sy) = source_pixel(q, size);
                    let offset = (sy * width + sx) * 4;
                    row[x * 4..x * 4 + 4].copy_from_slice(&src[offset..offset + 4]);
                }
            });
    }
}

impl FrameRenderer for LensDistortionCorrector {
    type Input<'a> = &'a ImageBuffer;
    type Output = PooledFrame;

    fn name(&self) -> &'static str {
        NAME
    }

    fn prepare(
        &mut self,
        input_format: FormatDescription,
        output_retained_buffer_count_hint: usize,
    ) -> DepthcamResult<()> {
        self.reset();
        match input_format.pixel_format {
            PixelFormat::Bgra8 | PixelFormat::DepthFloat32 => {}
            other => {
                return Err(DepthcamError::UnsupportedPixelFormat {
                    renderer: NAME,
                    format: other,
                })
            }
        }
        if input_format.dimensions.is_empty() {
            return Err(DepthcamError::InvalidArgument(format!(
                "{}: empty input dimensions {}",
                NAME, input_format.dimensions
            )));
        }

        let gpu = self.device.compile("lens_correction", SHADER, 2)?;
        self.stage = Some(ImageStage {
            input_format,
            pool: FramePool::new(input_format, output_retained_buffer_count_hint),
            gpu,
        });
        tracing::debug!("{} prepared for {:?}", NAME, input_format);
        Ok(())
    }

    fn render(&mut self, input: &ImageBuffer) -> Option<PooledFrame> {
        let Some(stage) = self.stage.as_ref() else {
            return unprepared(NAME);
        };
        let Some(calibration) = self.settings.calibration() else {
            tracing::warn!("{}: no camera calibration attached, dropping frame", NAME);
            return None;
        };
        let size = input.format.dimensions;
        let (table, center) = match calibration
            .rectification_table()
            .and_then(|t| Ok((t, calibration.scaled_distortion_center(size.width)?)))
        {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("{}: {}", NAME, e);
                return None;
            }
        };

        let mut frame = stage.begin(NAME, input)?;

        match &stage.gpu {
            None => Self::run_cpu(input, &mut frame, table, center),
            Some(gpu) => {
                let params = LensParams {
                    center: [center.x, center.y],
                    width: size.width,
                    height: size.height,
                    table_len: table.len() as u32,
                    r_max: distortion_r_max(center, size),
                    _pad: [0; 2],
                };
                let result = gpu.dispatch(
                    bytemuck::bytes_of(&params),
                    &[input.data.as_slice(), bytemuck::cast_slice(table.values())],
                    input.data.len() as u64,
                    image_workgroups(size.width, size.height),
                );
                match result {
                    Ok(bytes) => frame.data.copy_from_slice(&bytes),
                    Err(e) => {
                        tracing::error!("{}: {}", NAME, e);
                        return None;
                    }
                }
            }
        }
        Some(frame)
    }

    fn reset(&mut self) {
        if self.stage.take().is_some() {
            tracing::debug!("{} reset", NAME);
        }
    }

    fn is_prepared(&self) -> bool {
        self.stage.is_some()
    }

    fn output_format(&self) -> Option<FormatDescription> {
        self.stage.as_ref().map(ImageStage::output_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcam_core::{Matrix3, Matrix4x3, VideoOrientation};

    const SIZE: Dimensions = Dimensions {
        width: 64,
        height: 48,
    };

    /// Forward table `m(r) = 0.01 * (r / r_max)^2`.
    fn forward_table() -> LensDistortionTable {
        let n = 64;
        LensDistortionTable::new(
            (0..n)
                .map(|i| {
                    let t = i as f32 / (n - 1) as f32;
                    0.01 * t * t
                })
                .collect(),
        )
        .unwrap()
    }

    /// Numerical inverse of the forward table on the same radius grid.
    fn inverse_table(forward: &LensDistortionTable, r_max: f32) -> LensDistortionTable {
        let n = forward.len();
        let mut values = vec![0.0f32; n];
        for (i, value) in values.iter_mut().enumerate().skip(1) {
            let s = i as f32 * r_max / (n - 1) as f32;
            let mut r = s;
            for _ in 0..50 {
                r = s / (1.0 + forward.magnification_at(r, r_max));
            }
            *value = r / s - 1.0;
        }
        LensDistortionTable::new(values).unwrap()
    }

    fn settings_with(table: LensDistortionTable) -> Arc<ProcessorSettings> {
        let settings = ProcessorSettings::new(SIZE, SIZE, VideoOrientation::LandscapeLeft);
        settings
            .attach_calibration(CameraCalibrationData {
                intrinsic_matrix: Matrix3::intrinsics(50.0, 50.0, 32.0, 24.0),
                intrinsic_matrix_reference_dimensions: SIZE,
                extrinsic_matrix: Matrix4x3::identity(),
                pixel_size: 0.001,
                lens_distortion_lookup_table: None,
                inverse_lens_distortion_lookup_table: Some(table),
                lens_distortion_center: Point2::new(32.0, 24.0),
            })
            .unwrap();
        Arc::new(settings)
    }

    fn gradient() -> ImageBuffer {
        let words: Vec<u32> = (0..SIZE.pixel_count() as u32)
            .map(|i| 0xFF00_0000 | i)
            .collect();
        ImageBuffer::from_bgra_words(SIZE.width, SIZE.height, &words).unwrap()
    }

    #[test]
    fn test_r_max_uses_farthest_corner() {
        let r = distortion_r_max(Point2::new(10.0, 10.0), Dimensions::new(40, 30));
        assert!((r - (30.0f32 * 30.0 + 20.0 * 20.0).sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_forward_then_inverse_round_trips() {
        let center = Point2::new(30.0, 26.0);
        let forward = forward_table();
        let inverse = inverse_table(&forward, distortion_r_max(center, SIZE));
        for &(x, y) in &[(0.0, 0.0), (5.5, 40.0), (30.0, 26.0), (50.0, 10.0), (63.0, 47.0)] {
            let p = Point2::new(x, y);
            let distorted = lens_distortion_point(p, &forward, center, SIZE);
            let back = lens_distortion_point(distorted, &inverse, center, SIZE);
            assert!((back - p).length() < 1e-2, "{:?} -> {:?} -> {:?}", p, distorted, back);
        }
    }

    #[test]
    fn test_center_is_fixed_point() {
        let center = Point2::new(32.0, 24.0);
        let p = lens_distortion_point(center, &forward_table(), center, SIZE);
        assert_eq!(p, center);
    }

    #[test]
    fn test_render_before_prepare_returns_none() {
        let mut lens = LensDistortionCorrector::new(
            ComputeDevice::Cpu,
            settings_with(forward_table()),
        );
        assert!(lens.render(&gradient()).is_none());
    }

    #[test]
    fn test_unsupported_format() {
        let mut lens = LensDistortionCorrector::new(
            ComputeDevice::Cpu,
            settings_with(forward_table()),
        );
        let err = lens
            .prepare(FormatDescription::new(PixelFormat::DepthFloat16, 64, 48), 2)
            .unwrap_err();
        assert!(matches!(err, DepthcamError::UnsupportedPixelFormat { .. }));
        assert!(!lens.is_prepared());
    }

    #[test]
    fn test_zero_table_is_identity() {
        let zero = LensDistortionTable::new(vec![0.0; 8]).unwrap();
        let mut lens = LensDistortionCorrector::new(ComputeDevice::Cpu, settings_with(zero));
        let input = gradient();
        lens.prepare(input.format, 1).unwrap();
        let out = lens.render(&input).unwrap();
        assert_eq!(out.data, input.data);
    }

    #[test]
    fn test_render_samples_distorted_position() {
        let mut lens = LensDistortionCorrector::new(
            ComputeDevice::Cpu,
            settings_with(forward_table()),
        );
        let input = gradient();
        lens.prepare(input.format, 1).unwrap();
        let out = lens.render(&input).unwrap();

        let center = Point2::new(32.0, 24.0);
        let q = lens_distortion_point(Point2::new(0.0, 0.0), &forward_table(), center, SIZE);
        let (sx, sy) = source_pixel(q, SIZE);
        assert_eq!(out.word_at(0, 0), input.word_at(sx as u32, sy as u32));
        assert_eq!(out.word_at(32, 24), input.word_at(32, 24));
    }

    #[test]
    fn test_missing_calibration_drops_frame() {
        let settings = Arc::new(ProcessorSettings::new(SIZE, SIZE, VideoOrientation::Portrait));
        let mut lens = LensDistortionCorrector::new(ComputeDevice::Cpu, settings);
        let input = gradient();
        lens.prepare(input.format, 1).unwrap();
        assert!(lens.render(&input).is_none());
    }

    #[test]
    fn test_format_mismatch_and_reset() {
        let mut lens = LensDistortionCorrector::new(
            ComputeDevice::Cpu,
            settings_with(forward_table()),
        );
        lens.prepare(FormatDescription::new(PixelFormat::Bgra8, 32, 32), 1)
            .unwrap();
        assert!(lens.render(&gradient()).is_none());

        lens.reset();
        lens.reset();
        assert!(!lens.is_prepared());
        assert!(lens.output_format().is_none());
    }
}
