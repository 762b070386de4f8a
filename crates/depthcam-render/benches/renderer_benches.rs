use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use depthcam_core::{
    CameraCalibrationData, Dimensions, FormatDescription, ImageBuffer, LensDistortionTable,
    Matrix3, Matrix4x3, PixelFormat, Point2, ProcessorSettings, VideoOrientation,
};
use depthcam_render::{
    CodecParameters, ComputeDevice, DepthCodec, FrameRenderer, LensDistortionCorrector,
    PointCloudInput, PointCloudReprojector,
};

const DEPTH: Dimensions = Dimensions {
    width: 640,
    height: 480,
};

fn settings() -> Arc<ProcessorSettings> {
    let settings = ProcessorSettings::new(
        Dimensions::new(1920, 1080),
        DEPTH,
        VideoOrientation::LandscapeLeft,
    );
    let table: Vec<f32> = (0..42).map(|i| -0.0004 * i as f32).collect();
    let _ = settings.attach_calibration(CameraCalibrationData {
        intrinsic_matrix: Matrix3::intrinsics(2742.0, 2742.0, 2015.0, 1511.0),
        intrinsic_matrix_reference_dimensions: Dimensions::new(4032, 3024),
        extrinsic_matrix: Matrix4x3::identity(),
        pixel_size: 0.001,
        lens_distortion_lookup_table: None,
        inverse_lens_distortion_lookup_table: LensDistortionTable::new(table).ok(),
        lens_distortion_center: Point2::new(2010.0, 1508.0),
    });
    Arc::new(settings)
}

fn depth_ramp() -> ImageBuffer {
    let values: Vec<f32> = (0..DEPTH.pixel_count())
        .map(|i| 0.3 + (i % DEPTH.width as usize) as f32 / DEPTH.width as f32)
        .collect();
    ImageBuffer::from_f32(
        FormatDescription::new(PixelFormat::DepthFloat32, DEPTH.width, DEPTH.height),
        &values,
    )
    .unwrap()
}

fn device() -> ComputeDevice {
    match std::env::var("DEPTHCAM_BENCH_GPU") {
        Ok(_) => ComputeDevice::from_backend(depthcam_core::RenderBackend::Auto)
            .unwrap_or(ComputeDevice::Cpu),
        Err(_) => ComputeDevice::Cpu,
    }
}

fn bench_renderers(c: &mut Criterion) {
    let mut group = c.benchmark_group("depthcam_renderers");
    group.sample_size(20);

    let device = device();
    let settings = settings();
    let depth = depth_ramp();

    let mut encoder = DepthCodec::encoder(device.clone(), CodecParameters::default());
    encoder.prepare(depth.format, 2).unwrap();
    group.bench_function("depth_encode_640x480", |b| {
        b.iter(|| encoder.render(&depth).unwrap());
    });

    let mut lens = LensDistortionCorrector::new(device.clone(), Arc::clone(&settings));
    lens.prepare(depth.format, 2).unwrap();
    group.bench_function("lens_rectify_depth_640x480", |b| {
        b.iter(|| lens.render(&depth).unwrap());
    });

    let landmarks: Vec<Point2> = (0..76)
        .map(|i| Point2::new(200.0 + (i % 10) as f32 * 20.0, 120.0 + (i / 10) as f32 * 25.0))
        .collect();
    let mut cloud = PointCloudReprojector::new(device, settings);
    cloud.prepare(depth.format, 2).unwrap();
    group.bench_function("point_cloud_76_landmarks", |b| {
        b.iter(|| {
            cloud
                .render(PointCloudInput {
                    depth: &depth,
                    landmarks: &landmarks,
                })
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_renderers);
criterion_main!(benches);
