//! Combines face observations with depth into per-frame landmark records.

use std::sync::Arc;

use depthcam_core::{
    Dimensions, ImageBuffer, Point2, Point3, ProcessorSettings, Rect,
};

use crate::device::ComputeDevice;
use crate::lens::{rectify_point, LensDistortionCorrector};
use crate::point_cloud::{PointCloudInput, PointCloudReprojector};
use crate::renderer::FrameRenderer;

/// Output of the external face tracker for one video frame.
/// Coordinates are normalized to `0..1`, origin top-left.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FaceObservation {
    pub bounding_box: Rect,
    /// `None` when the tracker found a face but no landmarks.
    pub landmarks: Option<Vec<Point2>>,
}

/// One row's worth of face data.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRecord {
    /// Bounding box in video pixels.
    pub bounding_box: Rect,
    /// `landmark_count` points. With depth: depth-map pixels plus metric z.
    /// Without depth: video pixels with z = 0.
    pub landmarks_2d: Vec<Point3>,
    /// Camera-space landmarks, only when depth was available.
    pub landmarks_3d: Option<Vec<Point3>>,
}

impl FaceRecord {
    /// All-zero record used when the face is lost, so every frame still gets a row.
    pub fn empty(landmark_count: usize) -> Self {
        Self {
            bounding_box: Rect::default(),
            landmarks_2d: vec![Point3::zero(); landmark_count],
            landmarks_3d: None,
        }
    }
}

/// Turns a face observation and an optional depth map into a [`FaceRecord`].
pub struct FaceLandmarksProcessor {
    settings: Arc<ProcessorSettings>,
    depth_rectifier: LensDistortionCorrector,
    point_cloud: PointCloudReprojector,
}

impl FaceLandmarksProcessor {
    pub fn new(device: ComputeDevice, settings: Arc<ProcessorSettings>) -> Self {
        Self {
            depth_rectifier: LensDistortionCorrector::new(device.clone(), Arc::clone(&settings)),
            point_cloud: PointCloudReprojector::new(device, Arc::clone(&settings)),
            settings,
        }
    }

    fn landmarks_in(points: &[Point2], size: Dimensions, count: usize) -> Vec<Point2> {
        points.iter().take(count).map(|p| p.denormalize(size)).collect()
    }

    fn video_landmarks(&self, points: &[Point2]) -> Vec<Point3> {
        let count = self.settings.landmark_count;
        let mut out: Vec<Point3> =
            Self::landmarks_in(points, self.settings.video_resolution, count)
                .into_iter()
                .map(|p| Point3::new(p.x, p.y, 0.0))
                .collect();
        out.resize(count, Point3::zero());
        out
    }

    fn ensure_prepared<R: FrameRenderer>(renderer: &mut R, depth: &ImageBuffer) -> bool {
        if renderer.is_prepared() {
            return true;
        }
        match renderer.prepare(depth.format, 1) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{}: {}", renderer.name(), e);
                false
            }
        }
    }

    /// Lift landmarks using depth. `None` if any stage fails.
    fn depth_landmarks(
        &mut self,
        points: &[Point2],
        depth: &ImageBuffer,
    ) -> Option<(Vec<Point3>, Vec<Point3>)> {
        let calibration = self.settings.calibration()?;
        // The rectifier works on 32-bit depth.
        let widened;
        let depth = if depth.format.pixel_format.bytes_per_pixel() == 2 {
            widened = depth.widened();
            &widened
        } else {
            depth
        };
        let depth_size = depth.format.dimensions;
        let count = self.settings.landmark_count;

        if self.depth_rectifier.output_format() != Some(depth.format) {
            self.depth_rectifier.reset();
        }
        if !Self::ensure_prepared(&mut self.depth_rectifier, depth) {
            return None;
        }
        let rectified = self.depth_rectifier.render(depth)?;

        let raw = Self::landmarks_in(points, depth_size, count);
        let corrected = raw
            .iter()
            .map(|&p| rectify_point(p, calibration, depth_size))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tracing::warn!("landmark rectification failed: {}", e))
            .ok()?;

        if !Self::ensure_prepared(&mut self.point_cloud, &rectified) {
            return None;
        }
        let cloud = self.point_cloud.render(PointCloudInput {
            depth: &rectified,
            landmarks: &corrected,
        })?;

        let mut landmarks_2d = vec![Point3::zero(); count];
        for (slot, (p, q)) in landmarks_2d.iter_mut().zip(raw.iter().zip(&cloud)) {
            *slot = Point3::new(p.x, p.y, q.z);
        }
        Some((landmarks_2d, cloud.to_vec()))
    }

    /// Fallbacks, in order: no observation gives zeros; no landmarks gives
    /// the bounding box only; no usable depth gives 2D video-pixel landmarks.
    pub fn process(
        &mut self,
        observation: Option<&FaceObservation>,
        depth: Option<&ImageBuffer>,
    ) -> FaceRecord {
        let count = self.settings.landmark_count;
        let Some(observation) = observation else {
            tracing::debug!("no face observation, writing zeros");
            return FaceRecord::empty(count);
        };

        let mut record = FaceRecord::empty(count);
        record.bounding_box = observation
            .bounding_box
            .denormalize(self.settings.video_resolution);

        let Some(points) = observation.landmarks.as_deref() else {
            tracing::debug!("face observation without landmarks, writing bounding box only");
            return record;
        };

        if let Some(depth) = depth {
            if let Some((landmarks_2d, landmarks_3d)) = self.depth_landmarks(points, depth) {
                record.landmarks_2d = landmarks_2d;
                record.landmarks_3d = Some(landmarks_3d);
                return record;
            }
            tracing::warn!("depth processing failed, using landmarks in video coordinates");
        }
        record.landmarks_2d = self.video_landmarks(points);
        record
    }

    pub fn reset(&mut self) {
        self.depth_rectifier.reset();
        self.point_cloud.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcam_core::{
        CameraCalibrationData, FormatDescription, LensDistortionTable, Matrix3, Matrix4x3,
        PixelFormat, VideoOrientation,
    };

    const DEPTH: Dimensions = Dimensions {
        width: 64,
        height: 48,
    };

    fn settings(calibrated: bool) -> Arc<ProcessorSettings> {
        let settings = ProcessorSettings::new(
            Dimensions::new(640, 480),
            DEPTH,
            VideoOrientation::LandscapeLeft,
        )
        .with_landmark_count(3);
        if calibrated {
            settings
                .attach_calibration(CameraCalibrationData {
                    intrinsic_matrix: Matrix3::intrinsics(500.0, 500.0, 320.0, 240.0),
                    intrinsic_matrix_reference_dimensions: Dimensions::new(640, 480),
                    extrinsic_matrix: Matrix4x3::identity(),
                    pixel_size: 0.001,
                    lens_distortion_lookup_table: None,
                    inverse_lens_distortion_lookup_table: Some(
                        LensDistortionTable::new(vec![0.0; 4]).unwrap(),
                    ),
                    lens_distortion_center: Point2::new(320.0, 240.0),
                })
                .unwrap();
        }
        Arc::new(settings)
    }

    fn depth(z: f32) -> ImageBuffer {
        ImageBuffer::from_f32(
            FormatDescription::new(PixelFormat::DepthFloat32, DEPTH.width, DEPTH.height),
            &vec![z; DEPTH.pixel_count()],
        )
        .unwrap()
    }

    fn observation() -> FaceObservation {
        FaceObservation {
            bounding_box: Rect::new(0.25, 0.25, 0.5, 0.5),
            landmarks: Some(vec![Point2::new(0.5, 0.5), Point2::new(0.25, 0.75)]),
        }
    }

    #[test]
    fn test_no_observation_is_all_zero() {
        let mut p = FaceLandmarksProcessor::new(ComputeDevice::Cpu, settings(true));
        let record = p.process(None, Some(&depth(1.0)));
        assert_eq!(record, FaceRecord::empty(3));
    }

    #[test]
    fn test_no_landmarks_keeps_bounding_box() {
        let mut p = FaceLandmarksProcessor::new(ComputeDevice::Cpu, settings(true));
        let obs = FaceObservation {
            landmarks: None,
            ..observation()
        };
        let record = p.process(Some(&obs), None);
        assert_eq!(record.bounding_box, Rect::new(160.0, 120.0, 320.0, 240.0));
        assert!(record.landmarks_2d.iter().all(|l| *l == Point3::zero()));
        assert!(record.landmarks_3d.is_none());
    }

    #[test]
    fn test_without_depth_uses_video_pixels() {
        let mut p = FaceLandmarksProcessor::new(ComputeDevice::Cpu, settings(true));
        let record = p.process(Some(&observation()), None);
        assert_eq!(record.landmarks_2d[0], Point3::new(320.0, 240.0, 0.0));
        assert_eq!(record.landmarks_2d[1], Point3::new(160.0, 360.0, 0.0));
        assert_eq!(record.landmarks_2d[2], Point3::zero());
        assert!(record.landmarks_3d.is_none());
    }

    #[test]
    fn test_with_depth_lifts_landmarks() {
        let mut p = FaceLandmarksProcessor::new(ComputeDevice::Cpu, settings(true));
        let record = p.process(Some(&observation()), Some(&depth(0.75)));
        let cloud = record.landmarks_3d.unwrap();
        assert_eq!(cloud.len(), 3);
        // Landmark 0 sits on the principal point.
        assert_eq!(cloud[0], Point3::new(0.0, 0.0, 0.75));
        assert_eq!(record.landmarks_2d[0], Point3::new(32.0, 24.0, 0.75));
        assert_eq!(record.landmarks_2d[1].z, 0.75);
        assert_eq!(cloud[2], Point3::zero());
    }

    #[test]
    fn test_half_float_depth_lifts_landmarks() {
        let mut p = FaceLandmarksProcessor::new(ComputeDevice::Cpu, settings(true));
        let half = ImageBuffer::from_f32(
            FormatDescription::new(PixelFormat::DepthFloat16, DEPTH.width, DEPTH.height),
            &vec![0.75; DEPTH.pixel_count()],
        )
        .unwrap();
        let record = p.process(Some(&observation()), Some(&half));
        let cloud = record.landmarks_3d.unwrap();
        assert_eq!(cloud[0], Point3::new(0.0, 0.0, 0.75));
    }

    #[test]
    fn test_missing_calibration_falls_back_to_2d() {
        let mut p = FaceLandmarksProcessor::new(ComputeDevice::Cpu, settings(false));
        let record = p.process(Some(&observation()), Some(&depth(0.75)));
        assert!(record.landmarks_3d.is_none());
        assert_eq!(record.landmarks_2d[0], Point3::new(320.0, 240.0, 0.0));
    }
}
