//! Deterministic stand-in for the camera, microphone and face tracker.

use std::f32::consts::TAU;

use depthcam_core::{
    AudioBuffer, CameraCalibrationData, CaptureConfig, Dimensions, FormatDescription, FramePool,
    ImageBuffer, LensDistortionTable, Matrix3, Matrix4x3, PixelFormat, Point2, PooledFrame, Rect,
    Timestamp,
};
use depthcam_render::FaceObservation;

const TONE_HZ: f32 = 440.0;
const BACKGROUND_DEPTH: f32 = 1.2;
const FACE_DEPTH: f32 = 0.45;

/// Everything the sensors deliver for one video frame.
pub struct CapturedFrame {
    pub index: u64,
    pub timestamp: Timestamp,
    /// `None` when the capture pool is exhausted.
    pub video: Option<PooledFrame>,
    pub audio: AudioBuffer,
    pub depth: ImageBuffer,
    pub face: Option<FaceObservation>,
}

pub struct SyntheticCamera {
    fps: f64,
    sample_rate: u32,
    channels: u16,
    landmark_count: usize,
    video_pool: FramePool,
    depth_size: Dimensions,
    next_index: u64,
    audio_phase: f32,
}

impl SyntheticCamera {
    /// `retained_frames` is how many captured video frames downstream stages
    /// may hold at once.
    pub fn new(
        config: &CaptureConfig,
        video: Dimensions,
        depth: Dimensions,
        retained_frames: usize,
    ) -> Self {
        Self {
            fps: config.video_fps,
            sample_rate: config.audio_sample_rate,
            channels: config.audio_channels,
            landmark_count: config.landmark_count,
            video_pool: FramePool::new(
                FormatDescription::new(PixelFormat::Bgra8, video.width, video.height),
                retained_frames,
            ),
            depth_size: depth,
            next_index: 0,
            audio_phase: 0.0,
        }
    }

    pub fn video_size(&self) -> Dimensions {
        self.video_pool.format().dimensions
    }

    pub fn depth_size(&self) -> Dimensions {
        self.depth_size
    }

    /// Intrinsics referenced to twice the video resolution, like a sensor
    /// whose full-resolution calibration is scaled down for streaming.
    pub fn calibration(&self) -> CameraCalibrationData {
        let video = self.video_size();
        let reference = Dimensions::new(video.width * 2, video.height * 2);
        let (w, h) = (reference.width as f32, reference.height as f32);
        let inverse: Vec<f32> = (0..42).map(|i| -0.0004 * i as f32).collect();
        let forward: Vec<f32> = (0..42).map(|i| 0.0004 * i as f32).collect();
        CameraCalibrationData {
            intrinsic_matrix: Matrix3::intrinsics(w * 0.9, w * 0.9, w / 2.0, h / 2.0),
            intrinsic_matrix_reference_dimensions: reference,
            extrinsic_matrix: Matrix4x3::identity(),
            pixel_size: 0.001,
            lens_distortion_lookup_table: LensDistortionTable::new(forward).ok(),
            inverse_lens_distortion_lookup_table: LensDistortionTable::new(inverse).ok(),
            lens_distortion_center: Point2::new(w / 2.0 - 3.0, h / 2.0 + 2.0),
        }
    }

    /// Normalized face center; drifts on a slow circle.
    fn face_center(&self, index: u64) -> Point2 {
        let t = index as f32 / self.fps as f32;
        Point2::new(0.5 + 0.08 * (t * 0.7).cos(), 0.5 + 0.06 * (t * 0.7).sin())
    }

    fn face(&self, index: u64) -> Option<FaceObservation> {
        // Simulated tracking loss.
        if index % 45 == 44 {
            return None;
        }
        let center = self.face_center(index);
        let (half_w, half_h) = (0.15, 0.2);
        let bounding_box = Rect::new(center.x - half_w, center.y - half_h, 2.0 * half_w, 2.0 * half_h);
        if index % 20 == 19 {
            return Some(FaceObservation {
                bounding_box,
                landmarks: None,
            });
        }
        let n = self.landmark_count.max(1);
        let landmarks = (0..self.landmark_count)
            .map(|i| {
                let a = i as f32 / n as f32 * TAU;
                let ring = if i % 2 == 0 { 0.8 } else { 0.45 };
                Point2::new(
                    center.x + a.cos() * half_w * ring,
                    center.y + a.sin() * half_h * ring,
                )
            })
            .collect();
        Some(FaceObservation {
            bounding_box,
            landmarks: Some(landmarks),
        })
    }

    fn video_frame(&self, index: u64, timestamp: Timestamp) -> Option<PooledFrame> {
        let mut frame = self.video_pool.acquire()?;
        let size = frame.format.dimensions;
        let shift = (index * 4) as u32;
        for y in 0..size.height {
            for x in 0..size.width {
                let i = ((y * size.width + x) * 4) as usize;
                frame.data[i] = ((x + shift) % 256) as u8;
                frame.data[i + 1] = (y % 256) as u8;
                frame.data[i + 2] = ((x + y) / 2 % 256) as u8;
                frame.data[i + 3] = 255;
            }
        }
        frame.timestamp = timestamp;
        Some(frame)
    }

    fn depth_frame(&self, index: u64, timestamp: Timestamp) -> ImageBuffer {
        let size = self.depth_size;
        let center = self.face_center(index).denormalize(size);
        let (rx, ry) = (size.width as f32 * 0.15, size.height as f32 * 0.2);
        let mut values = Vec::with_capacity(size.pixel_count());
        for y in 0..size.height {
            for x in 0..size.width {
                let dx = (x as f32 - center.x) / rx;
                let dy = (y as f32 - center.y) / ry;
                let d2 = dx * dx + dy * dy;
                let z = if d2 < 1.0 {
                    FACE_DEPTH - 0.05 * (1.0 - d2).sqrt()
                } else {
                    BACKGROUND_DEPTH + 0.1 * y as f32 / size.height as f32
                };
                values.push(z);
            }
        }
        // Sensor holes.
        if let Some(v) = values.get_mut(index as usize % size.pixel_count().max(1)) {
            *v = f32::NAN;
        }
        let format = FormatDescription::new(PixelFormat::DepthFloat32, size.width, size.height);
        match ImageBuffer::from_f32(format, &values) {
            Ok(image) => image.with_timestamp(timestamp),
            Err(_) => ImageBuffer::new(format).with_timestamp(timestamp),
        }
    }

    fn audio_chunk(&mut self, timestamp: Timestamp) -> AudioBuffer {
        let frames = (self.sample_rate as f64 / self.fps).round() as usize;
        let step = TAU * TONE_HZ / self.sample_rate as f32;
        let mut samples = Vec::with_capacity(frames * self.channels as usize);
        for _ in 0..frames {
            let s = self.audio_phase.sin() * 0.2;
            for _ in 0..self.channels {
                samples.push(s);
            }
            self.audio_phase = (self.audio_phase + step) % TAU;
        }
        AudioBuffer::new(self.sample_rate, self.channels, timestamp, samples)
    }

    pub fn next_frame(&mut self) -> CapturedFrame {
        let index = self.next_index;
        self.next_index += 1;
        let timestamp = Timestamp::from_seconds(index as f64 / self.fps);
        CapturedFrame {
            index,
            timestamp,
            video: self.video_frame(index, timestamp),
            audio: self.audio_chunk(timestamp),
            depth: self.depth_frame(index, timestamp),
            face: self.face(index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> SyntheticCamera {
        let config = CaptureConfig {
            landmark_count: 8,
            ..CaptureConfig::default()
        };
        SyntheticCamera::new(&config, Dimensions::new(64, 48), Dimensions::new(32, 24), 1)
    }

    #[test]
    fn test_frames_are_timestamped_at_fps() {
        let mut cam = camera();
        let first = cam.next_frame();
        let second = cam.next_frame();
        assert_eq!(first.timestamp, Timestamp::zero());
        assert!((second.timestamp.as_seconds() - 1.0 / 30.0).abs() < 1e-9);
        assert_eq!(second.depth.timestamp, second.timestamp);
        assert_eq!(second.audio.frame_count(), 1600);
    }

    #[test]
    fn test_face_is_inside_the_frame() {
        let cam = camera();
        let face = cam.face(0).unwrap();
        let landmarks = face.landmarks.unwrap();
        assert_eq!(landmarks.len(), 8);
        assert!(landmarks
            .iter()
            .all(|p| (0.0..=1.0).contains(&p.x) && (0.0..=1.0).contains(&p.y)));
        assert!(cam.face(44).is_none());
        assert!(cam.face(19).unwrap().landmarks.is_none());
    }

    #[test]
    fn test_face_is_closer_than_background() {
        let mut cam = camera();
        let frame = cam.next_frame();
        let center = cam.face_center(0).denormalize(cam.depth_size());
        let z = frame.depth.f32_at(center.x as u32, center.y as u32).unwrap();
        assert!(z < 0.5);
        assert!(frame.depth.f32_at(31, 23).unwrap() > 1.0);
    }

    #[test]
    fn test_video_pool_bounds_in_flight_frames() {
        let mut cam = camera();
        // hint 1 + margin 2
        let held: Vec<_> = (0..3).map(|_| cam.next_frame().video.unwrap()).collect();
        assert!(cam.next_frame().video.is_none());
        drop(held);
        assert!(cam.next_frame().video.is_some());
    }
}
