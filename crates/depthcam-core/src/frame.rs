use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::DepthcamError;
use crate::math::Dimensions;
use crate::time::Timestamp;

/// Pixel format of a captured or rendered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit BGRA, one packed little-endian word per pixel.
    Bgra8,
    /// Half-float depth in meters.
    DepthFloat16,
    /// 32-bit float depth in meters.
    DepthFloat32,
    /// Half-float disparity (1/meters).
    DisparityFloat16,
    /// 32-bit float disparity (1/meters).
    DisparityFloat32,
}

impl PixelFormat {
    /// Bytes per pixel for this format.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::DepthFloat32 | PixelFormat::DisparityFloat32 => 4,
            PixelFormat::DepthFloat16 | PixelFormat::DisparityFloat16 => 2,
        }
    }

    /// True for any depth or disparity format.
    pub fn is_depth(&self) -> bool {
        !matches!(self, PixelFormat::Bgra8)
    }

    pub fn is_disparity(&self) -> bool {
        matches!(
            self,
            PixelFormat::DisparityFloat16 | PixelFormat::DisparityFloat32
        )
    }

    /// The 32-bit float format carrying the same quantity as this one.
    pub fn widened(&self) -> PixelFormat {
        match self {
            PixelFormat::DepthFloat16 => PixelFormat::DepthFloat32,
            PixelFormat::DisparityFloat16 => PixelFormat::DisparityFloat32,
            other => *other,
        }
    }

    /// Decode one depth or disparity sample from its little-endian bytes.
    pub fn read_f32(&self, bytes: &[u8]) -> Option<f32> {
        match (self, bytes) {
            (PixelFormat::DepthFloat16 | PixelFormat::DisparityFloat16, [a, b, ..]) => {
                Some(f16_to_f32(u16::from_le_bytes([*a, *b])))
            }
            (PixelFormat::DepthFloat32 | PixelFormat::DisparityFloat32, [a, b, c, d, ..]) => {
                Some(f32::from_le_bytes([*a, *b, *c, *d]))
            }
            _ => None,
        }
    }

    /// Short identifier used in config files and CLI flags.
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Bgra8 => "bgra8",
            PixelFormat::DepthFloat16 => "depth16",
            PixelFormat::DepthFloat32 => "depth32",
            PixelFormat::DisparityFloat16 => "disparity16",
            PixelFormat::DisparityFloat32 => "disparity32",
        }
    }
}

/// Widen an IEEE 754 half-precision value.
pub fn f16_to_f32(bits: u16) -> f32 {
    let negative = bits & 0x8000 != 0;
    let exponent = ((bits >> 10) & 0x1f) as u32;
    let mantissa = (bits & 0x03ff) as u32;
    let sign = if negative { 0x8000_0000 } else { 0 };
    match exponent {
        0 => {
            // Zero or subnormal: mantissa * 2^-24, exact in f32.
            let magnitude = mantissa as f32 / (1u32 << 24) as f32;
            if negative {
                -magnitude
            } else {
                magnitude
            }
        }
        0x1f => f32::from_bits(sign | 0x7f80_0000 | (mantissa << 13)),
        _ => f32::from_bits(sign | ((exponent + 112) << 23) | (mantissa << 13)),
    }
}

/// Narrow to IEEE 754 half precision, rounding to nearest. Out-of-range
/// magnitudes become infinity or zero.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;
    if exponent == 0xff {
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }
    let exponent = exponent - 127 + 15;
    if exponent >= 0x1f {
        return sign | 0x7c00;
    }
    if exponent <= 0 {
        if exponent < -10 {
            return sign;
        }
        let full = mantissa | 0x0080_0000;
        let shift = (14 - exponent) as u32;
        let rounded = (full >> shift) + ((full >> (shift - 1)) & 1);
        return sign | rounded as u16;
    }
    let half = ((exponent as u32) << 10) | (mantissa >> 13);
    let rounded = half + ((mantissa >> 12) & 1);
    sign | rounded as u16
}

fn format_names() -> &'static HashMap<&'static str, PixelFormat> {
    static TABLE: OnceLock<HashMap<&'static str, PixelFormat>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            PixelFormat::Bgra8,
            PixelFormat::DepthFloat16,
            PixelFormat::DepthFloat32,
            PixelFormat::DisparityFloat16,
            PixelFormat::DisparityFloat32,
        ]
        .into_iter()
        .map(|f| (f.name(), f))
        .collect()
    })
}

impl FromStr for PixelFormat {
    type Err = DepthcamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        format_names()
            .get(s.trim().to_ascii_lowercase().as_str())
            .copied()
            .ok_or_else(|| DepthcamError::InvalidArgument(format!("unknown pixel format '{}'", s)))
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel format plus dimensions. Renderers negotiate on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatDescription {
    pub pixel_format: PixelFormat,
    pub dimensions: Dimensions,
}

impl FormatDescription {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            dimensions: Dimensions::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.dimensions.width
    }

    pub fn height(&self) -> u32 {
        self.dimensions.height
    }

    /// Tightly packed byte size of one image in this format.
    pub fn byte_size(&self) -> usize {
        self.dimensions.pixel_count() * self.pixel_format.bytes_per_pixel()
    }
}

/// A single image as a raw, tightly packed pixel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    pub format: FormatDescription,
    pub timestamp: Timestamp,
    /// Raw pixel data, little-endian, row-major.
    pub data: Vec<u8>,
}

impl ImageBuffer {
    /// Zero-filled image.
    pub fn new(format: FormatDescription) -> Self {
        Self {
            format,
            timestamp: Timestamp::zero(),
            data: vec![0u8; format.byte_size()],
        }
    }

    /// Build a depth or disparity image from samples. Half-float formats
    /// store each sample rounded to half precision.
    pub fn from_f32(format: FormatDescription, samples: &[f32]) -> Result<Self, DepthcamError> {
        if !format.pixel_format.is_depth() {
            return Err(DepthcamError::InvalidArgument(format!(
                "{} is not a float format",
                format.pixel_format
            )));
        }
        if samples.len() != format.dimensions.pixel_count() {
            return Err(DepthcamError::InvalidArgument(format!(
                "expected {} samples for {}, got {}",
                format.dimensions.pixel_count(),
                format.dimensions,
                samples.len()
            )));
        }
        let data = if format.pixel_format.bytes_per_pixel() == 2 {
            samples
                .iter()
                .flat_map(|v| f32_to_f16(*v).to_le_bytes())
                .collect()
        } else {
            samples.iter().flat_map(|v| v.to_le_bytes()).collect()
        };
        Ok(Self {
            format,
            timestamp: Timestamp::zero(),
            data,
        })
    }

    /// Build a BGRA image from packed words (`b | g << 8 | r << 16 | a << 24`).
    pub fn from_bgra_words(width: u32, height: u32, words: &[u32]) -> Result<Self, DepthcamError> {
        let format = FormatDescription::new(PixelFormat::Bgra8, width, height);
        if words.len() != format.dimensions.pixel_count() {
            return Err(DepthcamError::InvalidArgument(format!(
                "expected {} pixels for {}, got {}",
                format.dimensions.pixel_count(),
                format.dimensions,
                words.len()
            )));
        }
        Ok(Self {
            format,
            timestamp: Timestamp::zero(),
            data: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        })
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn width(&self) -> u32 {
        self.format.width()
    }

    pub fn height(&self) -> u32 {
        self.format.height()
    }

    /// The 32-bit word at a pixel coordinate. None if out of bounds or not a 32-bit format.
    pub fn word_at(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width() || y >= self.height() || self.format.pixel_format.bytes_per_pixel() != 4
        {
            return None;
        }
        let offset = ((y as usize) * (self.width() as usize) + (x as usize)) * 4;
        let bytes = self.data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Float sample at a pixel coordinate for depth/disparity images of
    /// either precision.
    pub fn f32_at(&self, x: u32, y: u32) -> Option<f32> {
        let pixel_format = self.format.pixel_format;
        if !pixel_format.is_depth() || x >= self.width() || y >= self.height() {
            return None;
        }
        let bpp = pixel_format.bytes_per_pixel();
        let offset = ((y as usize) * (self.width() as usize) + (x as usize)) * bpp;
        pixel_format.read_f32(self.data.get(offset..offset + bpp)?)
    }

    /// This image in the 32-bit counterpart of a half-float format. Other
    /// formats come back unchanged.
    pub fn widened(&self) -> ImageBuffer {
        let pixel_format = self.format.pixel_format;
        if !pixel_format.is_depth() || pixel_format.bytes_per_pixel() == 4 {
            return self.clone();
        }
        let data = self
            .data
            .chunks_exact(2)
            .flat_map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])).to_le_bytes())
            .collect();
        ImageBuffer {
            format: FormatDescription {
                pixel_format: pixel_format.widened(),
                dimensions: self.format.dimensions,
            },
            timestamp: self.timestamp,
            data,
        }
    }

    /// `[b, g, r, a]` at a pixel coordinate for BGRA images.
    pub fn bgra_at(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if self.format.pixel_format != PixelFormat::Bgra8 {
            return None;
        }
        self.word_at(x, y).map(u32::to_le_bytes)
    }

    /// All pixels as 32-bit words. Empty for 16-bit formats.
    pub fn words(&self) -> Vec<u32> {
        if self.format.pixel_format.bytes_per_pixel() != 4 {
            return Vec::new();
        }
        self.data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Overwrite the pixel data from 32-bit words. Extra words are ignored.
    pub fn copy_from_words(&mut self, words: &[u32]) {
        for (dst, w) in self.data.chunks_exact_mut(4).zip(words) {
            dst.copy_from_slice(&w.to_le_bytes());
        }
    }
}

/// Interleaved 32-bit float PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: Timestamp,
    /// Interleaved samples: `frames * channels` values.
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, timestamp: Timestamp, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            timestamp,
            samples,
        }
    }

    /// Number of sample frames (one value per channel).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Playback length of this buffer in seconds.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }
}
