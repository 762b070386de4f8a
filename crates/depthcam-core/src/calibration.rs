//! Camera calibration snapshot captured with the first depth frame.

use serde::{Deserialize, Serialize};

use crate::error::{DepthcamError, DepthcamResult};
use crate::math::{Dimensions, Matrix3, Matrix4x3, Point2};

/// Relative radial magnification sampled at `n` linearly spaced radii.
///
/// Entry 0 is the optical center, the last entry is the largest radius found
/// in the reference image. At least two entries are required for
/// interpolation, and deserialization enforces the same rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct LensDistortionTable(Vec<f32>);

impl LensDistortionTable {
    pub fn new(values: Vec<f32>) -> DepthcamResult<Self> {
        if values.len() < 2 {
            return Err(DepthcamError::InvalidCalibration(format!(
                "lens distortion table needs at least 2 entries, got {}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DepthcamError::InvalidCalibration(
                "lens distortion table contains non-finite values".into(),
            ));
        }
        Ok(Self(values))
    }

    /// Decode a raw little-endian f32 blob as delivered by the sensor.
    pub fn from_le_bytes(bytes: &[u8]) -> DepthcamResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(DepthcamError::InvalidCalibration(format!(
                "lens distortion blob length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Magnification at radius `r` given the table's maximum radius.
    /// Linear interpolation inside `r_max`, last entry at or beyond it.
    pub fn magnification_at(&self, r: f32, r_max: f32) -> f32 {
        let table = &self.0;
        let last = table[table.len() - 1];
        if !(r < r_max) || r_max <= 0.0 {
            return last;
        }
        let val = r * (table.len() - 1) as f32 / r_max;
        let idx = (val as usize).min(table.len() - 2);
        let frac = val - idx as f32;
        (1.0 - frac) * table[idx] + frac * table[idx + 1]
    }
}

impl TryFrom<Vec<f32>> for LensDistortionTable {
    type Error = DepthcamError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<LensDistortionTable> for Vec<f32> {
    fn from(table: LensDistortionTable) -> Self {
        table.0
    }
}

/// Intrinsics, extrinsics and lens distortion of the depth/color camera pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibrationData {
    /// Column-major pinhole intrinsics in reference-dimension pixels.
    pub intrinsic_matrix: Matrix3,
    /// Image size the intrinsics refer to.
    pub intrinsic_matrix_reference_dimensions: Dimensions,
    pub extrinsic_matrix: Matrix4x3,
    /// Pixel size in millimeters.
    pub pixel_size: f32,
    pub lens_distortion_lookup_table: Option<LensDistortionTable>,
    pub inverse_lens_distortion_lookup_table: Option<LensDistortionTable>,
    /// Distortion center in reference-dimension pixels.
    pub lens_distortion_center: Point2,
}

/// Pinhole intrinsics rescaled to a specific image width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl CameraCalibrationData {
    /// `reference_width / image_width`: how much larger the reference frame is.
    pub fn scale_ratio(&self, image_width: u32) -> DepthcamResult<f32> {
        if image_width == 0 || self.intrinsic_matrix_reference_dimensions.width == 0 {
            return Err(DepthcamError::InvalidCalibration(
                "zero-width reference or image".into(),
            ));
        }
        Ok(self.intrinsic_matrix_reference_dimensions.width as f32 / image_width as f32)
    }

    /// Intrinsics expressed in pixels of an image `image_width` wide.
    pub fn scaled_intrinsics(&self, image_width: u32) -> DepthcamResult<ScaledIntrinsics> {
        let ratio = self.scale_ratio(image_width)?;
        let m = &self.intrinsic_matrix.columns;
        Ok(ScaledIntrinsics {
            fx: m[0][0] / ratio,
            fy: m[1][1] / ratio,
            cx: m[2][0] / ratio,
            cy: m[2][1] / ratio,
        })
    }

    /// Distortion center expressed in pixels of an image `image_width` wide.
    pub fn scaled_distortion_center(&self, image_width: u32) -> DepthcamResult<Point2> {
        let ratio = self.scale_ratio(image_width)?;
        Ok(Point2::new(
            self.lens_distortion_center.x / ratio,
            self.lens_distortion_center.y / ratio,
        ))
    }

    /// The table that maps rectified pixels back into the distorted source.
    pub fn rectification_table(&self) -> DepthcamResult<&LensDistortionTable> {
        self.inverse_lens_distortion_lookup_table
            .as_ref()
            .ok_or_else(|| DepthcamError::InvalidCalibration("missing inverse lookup table".into()))
    }
}
