//! GPU and CPU kernels must agree. Skipped when no adapter is available.

use std::sync::Arc;

use depthcam_core::{
    CameraCalibrationData, Dimensions, FormatDescription, ImageBuffer, LensDistortionTable,
    Matrix3, Matrix4x3, PixelFormat, Point2, ProcessorSettings, VideoOrientation,
};
use depthcam_render::{
    CodecParameters, ComputeDevice, DepthCodec, FrameRenderer, GpuContext,
    LensDistortionCorrector, PointCloudInput, PointCloudReprojector,
};

const SIZE: Dimensions = Dimensions {
    width: 40,
    height: 30,
};

fn gpu() -> Option<ComputeDevice> {
    match GpuContext::init() {
        Ok(ctx) => Some(ComputeDevice::Gpu(Arc::new(ctx))),
        Err(e) => {
            eprintln!("skipping GPU parity test: {}", e);
            None
        }
    }
}

fn settings() -> Arc<ProcessorSettings> {
    let settings = ProcessorSettings::new(SIZE, SIZE, VideoOrientation::LandscapeLeft)
        .with_landmark_count(5);
    settings
        .attach_calibration(CameraCalibrationData {
            intrinsic_matrix: Matrix3::intrinsics(60.0, 60.0, 20.0, 15.0),
            intrinsic_matrix_reference_dimensions: SIZE,
            extrinsic_matrix: Matrix4x3::identity(),
            pixel_size: 0.001,
            lens_distortion_lookup_table: None,
            inverse_lens_distortion_lookup_table: Some(
                LensDistortionTable::new(vec![0.0, -0.002, -0.006, -0.012]).unwrap(),
            ),
            lens_distortion_center: Point2::new(19.5, 14.0),
        })
        .unwrap();
    Arc::new(settings)
}

fn depth() -> ImageBuffer {
    let mut values: Vec<f32> = (0..SIZE.pixel_count())
        .map(|i| -5.0 + i as f32 * 10.0 / SIZE.pixel_count() as f32)
        .collect();
    values[3] = f32::NAN;
    values[7] = f32::INFINITY;
    ImageBuffer::from_f32(
        FormatDescription::new(PixelFormat::DepthFloat32, SIZE.width, SIZE.height),
        &values,
    )
    .unwrap()
}

#[test]
fn depth_encode_matches_cpu() {
    let Some(gpu) = gpu() else { return };
    let input = depth();
    let mut on_gpu = DepthCodec::encoder(gpu, CodecParameters::default());
    let mut on_cpu = DepthCodec::encoder(ComputeDevice::Cpu, CodecParameters::default());
    on_gpu.prepare(input.format, 1).unwrap();
    on_cpu.prepare(input.format, 1).unwrap();

    let a = on_gpu.render(&input).unwrap();
    let b = on_cpu.render(&input).unwrap();
    let diff = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(x, y)| (*x as i32 - *y as i32).abs())
        .max()
        .unwrap();
    assert!(diff <= 1, "gray levels differ by {}", diff);
}

#[test]
fn lens_rectification_matches_cpu() {
    let Some(gpu) = gpu() else { return };
    let words: Vec<u32> = (0..SIZE.pixel_count() as u32).collect();
    let input = ImageBuffer::from_bgra_words(SIZE.width, SIZE.height, &words).unwrap();

    let mut on_gpu = LensDistortionCorrector::new(gpu, settings());
    let mut on_cpu = LensDistortionCorrector::new(ComputeDevice::Cpu, settings());
    on_gpu.prepare(input.format, 1).unwrap();
    on_cpu.prepare(input.format, 1).unwrap();

    let a = on_gpu.render(&input).unwrap();
    let b = on_cpu.render(&input).unwrap();
    let mismatched = a
        .words()
        .iter()
        .zip(b.words())
        .filter(|(x, y)| **x != *y)
        .count();
    // Nearest-neighbour sampling may land on the other side of a pixel edge.
    assert!(mismatched * 100 <= SIZE.pixel_count(), "{} pixels differ", mismatched);
}

#[test]
fn point_cloud_matches_cpu() {
    let Some(gpu) = gpu() else { return };
    let values = vec![1.25f32; SIZE.pixel_count()];
    let input = ImageBuffer::from_f32(
        FormatDescription::new(PixelFormat::DepthFloat32, SIZE.width, SIZE.height),
        &values,
    )
    .unwrap();
    let landmarks = [
        Point2::new(20.0, 15.0),
        Point2::new(3.5, 7.25),
        Point2::new(39.9, 29.9),
        Point2::new(50.0, 1.0),
    ];

    let mut on_gpu = PointCloudReprojector::new(gpu, settings());
    let mut on_cpu = PointCloudReprojector::new(ComputeDevice::Cpu, settings());
    on_gpu.prepare(input.format, 1).unwrap();
    on_cpu.prepare(input.format, 1).unwrap();

    let frame = PointCloudInput {
        depth: &input,
        landmarks: &landmarks,
    };
    let a = on_gpu.render(frame).unwrap();
    let b = on_cpu.render(frame).unwrap();
    assert_eq!(a.len(), 5);
    for (p, q) in a.iter().zip(&b) {
        assert!((p.x - q.x).abs() < 1e-4 && (p.y - q.y).abs() < 1e-4 && (p.z - q.z).abs() < 1e-6);
    }
}
