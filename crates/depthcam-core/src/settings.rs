//! Per-session capture settings stored alongside every recording.

use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::calibration::CameraCalibrationData;
use crate::error::{DepthcamError, DepthcamResult};
use crate::math::Dimensions;

/// Landmark count produced by the face tracker's current revision.
pub const DEFAULT_LANDMARK_COUNT: usize = 76;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraPosition {
    Front,
    Back,
}

/// Orientation in which the sensor delivers frames, relative to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoOrientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeRight,
    LandscapeLeft,
}

impl VideoOrientation {
    /// Rotation in radians that takes this orientation to portrait.
    pub fn angle_offset_from_portrait(&self, position: CameraPosition) -> f64 {
        match self {
            VideoOrientation::Portrait => {
                if position == CameraPosition::Front {
                    PI
                } else {
                    0.0
                }
            }
            VideoOrientation::PortraitUpsideDown => {
                if position == CameraPosition::Front {
                    0.0
                } else {
                    PI
                }
            }
            VideoOrientation::LandscapeRight => -FRAC_PI_2,
            VideoOrientation::LandscapeLeft => FRAC_PI_2,
        }
    }
}

impl FromStr for VideoOrientation {
    type Err = DepthcamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "portrait" => Ok(VideoOrientation::Portrait),
            "portrait_upside_down" => Ok(VideoOrientation::PortraitUpsideDown),
            "landscape_right" => Ok(VideoOrientation::LandscapeRight),
            "landscape_left" => Ok(VideoOrientation::LandscapeLeft),
            other => Err(DepthcamError::InvalidArgument(format!(
                "unknown video orientation '{}'",
                other
            ))),
        }
    }
}

/// Bounding size of a `width x height` rectangle rotated by `angle`, rounded.
fn rotated_dimensions(dims: Dimensions, angle: f64) -> Dimensions {
    let (w, h) = (dims.width as f64, dims.height as f64);
    let (sin, cos) = (angle.sin().abs(), angle.cos().abs());
    Dimensions::new(
        (w * cos + h * sin).round() as u32,
        (w * sin + h * cos).round() as u32,
    )
}

/// Capture geometry and calibration for one recording session.
///
/// Created when the session starts; the calibration snapshot arrives with the
/// first depth frame and can be bound exactly once, even when the settings
/// are already shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SettingsRecord", into = "SettingsRecord")]
pub struct ProcessorSettings {
    pub landmark_count: usize,
    /// Raw (sensor orientation) video resolution.
    pub video_resolution: Dimensions,
    /// Raw (sensor orientation) depth resolution.
    pub depth_resolution: Dimensions,
    pub video_orientation: VideoOrientation,
    calibration: OnceLock<CameraCalibrationData>,
}

impl ProcessorSettings {
    pub fn new(
        video_resolution: Dimensions,
        depth_resolution: Dimensions,
        video_orientation: VideoOrientation,
    ) -> Self {
        Self {
            landmark_count: DEFAULT_LANDMARK_COUNT,
            video_resolution,
            depth_resolution,
            video_orientation,
            calibration: OnceLock::new(),
        }
    }

    pub fn with_landmark_count(mut self, landmark_count: usize) -> Self {
        self.landmark_count = landmark_count;
        self
    }

    /// Bind the calibration snapshot. Fails if one is already attached.
    pub fn attach_calibration(&self, calibration: CameraCalibrationData) -> DepthcamResult<()> {
        self.calibration
            .set(calibration)
            .map_err(|_| DepthcamError::CalibrationAlreadyAttached)?;
        tracing::debug!("camera calibration attached to processor settings");
        Ok(())
    }

    pub fn calibration(&self) -> Option<&CameraCalibrationData> {
        self.calibration.get()
    }

    /// Video and depth resolutions as they appear in portrait (front camera).
    pub fn portrait_resolutions(&self) -> (Dimensions, Dimensions) {
        let angle = self
            .video_orientation
            .angle_offset_from_portrait(CameraPosition::Front);
        (
            rotated_dimensions(self.video_resolution, angle),
            rotated_dimensions(self.depth_resolution, angle),
        )
    }

    /// Encode as a MessagePack blob.
    pub fn to_bytes(&self) -> DepthcamResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode a blob produced by [`ProcessorSettings::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> DepthcamResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Wire form of [`ProcessorSettings`]; the late-bound calibration becomes a plain option.
#[derive(Serialize, Deserialize)]
struct SettingsRecord {
    landmark_count: usize,
    video_resolution: Dimensions,
    depth_resolution: Dimensions,
    video_orientation: VideoOrientation,
    calibration: Option<CameraCalibrationData>,
}

impl From<SettingsRecord> for ProcessorSettings {
    fn from(record: SettingsRecord) -> Self {
        let calibration = OnceLock::new();
        if let Some(c) = record.calibration {
            let _ = calibration.set(c);
        }
        Self {
            landmark_count: record.landmark_count,
            video_resolution: record.video_resolution,
            depth_resolution: record.depth_resolution,
            video_orientation: record.video_orientation,
            calibration,
        }
    }
}

impl From<ProcessorSettings> for SettingsRecord {
    fn from(settings: ProcessorSettings) -> Self {
        Self {
            landmark_count: settings.landmark_count,
            video_resolution: settings.video_resolution,
            depth_resolution: settings.depth_resolution,
            video_orientation: settings.video_orientation,
            calibration: settings.calibration.into_inner(),
        }
    }
}
