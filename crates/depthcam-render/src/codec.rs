//! Depth <-> grayscale codec.
//!
//! Depth maps are stored in ordinary 8-bit video tracks, so each depth value
//! is mapped linearly onto `0..=255` over `[offset, offset + range]` meters
//! and replicated into the B, G and R channels. The mapping is lossy: a
//! decoded value is within `range / 255` of the original for depths inside
//! the window, and out-of-window depths saturate.

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use std::sync::OnceLock;

use depthcam_core::{
    CodecConfig, DepthcamError, DepthcamResult, FormatDescription, FramePool, ImageBuffer,
    PixelFormat, PooledFrame,
};

use crate::device::ComputeDevice;
use crate::gpu::image_workgroups;
use crate::renderer::{unprepared, FrameRenderer, ImageStage};

const ENCODE_SHADER: &str = include_str!("shaders/depth_encode.wgsl");
const DECODE_SHADER: &str = include_str!("shaders/depth_decode.wgsl");

/// Linear window mapped onto the gray levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecParameters {
    pub offset: f32,
    pub range: f32,
}

impl Default for CodecParameters {
    fn default() -> Self {
        Self {
            offset: -4.0,
            range: 8.0,
        }
    }
}

impl From<CodecConfig> for CodecParameters {
    fn from(config: CodecConfig) -> Self {
        Self {
            offset: config.offset,
            range: config.range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecDirection {
    /// Float depth or disparity to BGRA gray.
    Encode,
    /// BGRA gray to float depth.
    Decode,
}

/// Normalized gray levels `g / 255`, shared by every decoder in the process.
fn gray_levels() -> &'static [f32; 256] {
    static LEVELS: OnceLock<[f32; 256]> = OnceLock::new();
    LEVELS.get_or_init(|| std::array::from_fn(|g| g as f32 / 255.0))
}

/// Gray level for one depth sample. Non-finite input (and non-positive
/// disparity) maps to 0.
pub fn encode_gray(value: f32, params: CodecParameters, disparity: bool) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    let depth = if disparity {
        if value <= 0.0 {
            return 0;
        }
        let d = 1.0 / value;
        if !d.is_finite() {
            return 0;
        }
        d
    } else {
        value
    };
    let t = ((depth - params.offset) / params.range).clamp(0.0, 1.0);
    (t * 255.0 + 0.5).floor() as u8
}

/// Depth in meters for one gray level.
pub fn decode_gray(gray: u8, params: CodecParameters) -> f32 {
    gray_levels()[gray as usize] * params.range + params.offset
}

fn pack_gray(g: u8) -> u32 {
    let g = g as u32;
    g | (g << 8) | (g << 16) | (0xFF << 24)
}

fn unpack_gray(bgra: &[u8]) -> u8 {
    ((bgra[0] as u32 + bgra[1] as u32 + bgra[2] as u32) / 3) as u8
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct EncodeParams {
    offset: f32,
    range: f32,
    width: u32,
    height: u32,
    disparity: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct DecodeParams {
    offset: f32,
    range: f32,
    width: u32,
    height: u32,
}

/// Converts between float depth maps and storable grayscale frames.
pub struct DepthCodec {
    device: ComputeDevice,
    direction: CodecDirection,
    params: CodecParameters,
    stage: Option<ImageStage>,
}

impl DepthCodec {
    pub fn encoder(device: ComputeDevice, params: CodecParameters) -> Self {
        Self {
            device,
            direction: CodecDirection::Encode,
            params,
            stage: None,
        }
    }

    pub fn decoder(device: ComputeDevice, params: CodecParameters) -> Self {
        Self {
            device,
            direction: CodecDirection::Decode,
            params,
            stage: None,
        }
    }

    pub fn direction(&self) -> CodecDirection {
        self.direction
    }

    pub fn parameters(&self) -> CodecParameters {
        self.params
    }

    fn run_cpu(&self, input: &ImageBuffer, frame: &mut PooledFrame) {
        let params = self.params;
        match self.direction {
            CodecDirection::Encode => {
                let pixel_format = input.format.pixel_format;
                let disparity = pixel_format.is_disparity();
                frame
                    .data
                    .par_chunks_mut(4)
                    .zip(input.data.par_chunks(pixel_format.bytes_per_pixel()))
                    .for_each(|(dst, src)| {
                        let value = pixel_format.read_f32(src).unwrap_or(f32::NAN);
                        let word = pack_gray(encode_gray(value, params, disparity));
                        dst.copy_from_slice(&word.to_le_bytes());
                    });
            }
            CodecDirection::Decode => {
                frame
                    .data
                    .par_chunks_mut(4)
                    .zip(input.data.par_chunks(4))
                    .for_each(|(dst, src)| {
                        let depth = decode_gray(unpack_gray(src), params);
                        dst.copy_from_slice(&depth.to_le_bytes());
                    });
            }
        }
    }

    fn gpu_params(&self, input: &ImageBuffer) -> Vec<u8> {
        let (width, height) = (input.width(), input.height());
        match self.direction {
            CodecDirection::Encode => bytemuck::bytes_of(&EncodeParams {
                offset: self.params.offset,
                range: self.params.range,
                width,
                height,
                disparity: input.format.pixel_format.is_disparity() as u32,
                _pad: [0; 3],
            })
            .to_vec(),
            CodecDirection::Decode => bytemuck::bytes_of(&DecodeParams {
                offset: self.params.offset,
                range: self.params.range,
                width,
                height,
            })
            .to_vec(),
        }
    }
}

impl FrameRenderer for DepthCodec {
    type Input<'a> = &'a ImageBuffer;
    type Output = PooledFrame;

    fn name(&self) -> &'static str {
        match self.direction {
            CodecDirection::Encode => "depth encoder",
            CodecDirection::Decode => "depth decoder",
        }
    }

    fn prepare(
        &mut self,
        input_format: FormatDescription,
        output_retained_buffer_count_hint: usize,
    ) -> DepthcamResult<()> {
        self.reset();
        let (supported, output_pixel_format, label, shader) = match self.direction {
            CodecDirection::Encode => (
                input_format.pixel_format.is_depth(),
                PixelFormat::Bgra8,
                "depth_encode",
                ENCODE_SHADER,
            ),
            CodecDirection::Decode => (
                input_format.pixel_format == PixelFormat::Bgra8,
                PixelFormat::DepthFloat32,
                "depth_decode",
                DECODE_SHADER,
            ),
        };
        if !supported {
            return Err(DepthcamError::UnsupportedPixelFormat {
                renderer: self.name(),
                format: input_format.pixel_format,
            });
        }
        if !(self.params.range > 0.0) {
            return Err(DepthcamError::InvalidArgument(format!(
                "{}: range must be positive, got {}",
                self.name(),
                self.params.range
            )));
        }

        let output_format = FormatDescription {
            pixel_format: output_pixel_format,
            dimensions: input_format.dimensions,
        };
        let gpu = self.device.compile(label, shader, 1)?;
        self.stage = Some(ImageStage {
            input_format,
            pool: FramePool::new(output_format, output_retained_buffer_count_hint),
            gpu,
        });
        tracing::debug!("{} prepared for {:?}", self.name(), input_format);
        Ok(())
    }

    fn render(&mut self, input: &ImageBuffer) -> Option<PooledFrame> {
        let name = self.name();
        let Some(stage) = self.stage.as_ref() else {
            return unprepared(name);
        };
        let mut frame = stage.begin(name, input)?;

        match &stage.gpu {
            None => self.run_cpu(input, &mut frame),
            Some(gpu) => {
                // The shaders read 32-bit floats.
                let widened = input.widened();
                let result = gpu.dispatch(
                    &self.gpu_params(input),
                    &[widened.data.as_slice()],
                    frame.data.len() as u64,
                    image_workgroups(input.width(), input.height()),
                );
                match result {
                    Ok(bytes) => frame.data.copy_from_slice(&bytes),
                    Err(e) => {
                        tracing::error!("{}: {}", name, e);
                        return None;
                    }
                }
            }
        }
        Some(frame)
    }

    fn reset(&mut self) {
        if self.stage.take().is_some() {
            tracing::debug!("{} reset", self.name());
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
    use depthcam_core::Timestamp;

    fn depth_image(values: &[f32], width: u32) -> ImageBuffer {
        let height = values.len() as u32 / width;
        ImageBuffer::from_f32(
            FormatDescription::new(PixelFormat::DepthFloat32, width, height),
            values,
        )
        .unwrap()
    }

    #[test]
    fn test_gray_endpoints() {
        let p = CodecParameters::default();
        assert_eq!(encode_gray(-4.0, p, false), 0);
        assert_eq!(encode_gray(4.0, p, false), 255);
        assert_eq!(encode_gray(0.0, p, false), 128);
        assert_eq!(encode_gray(-100.0, p, false), 0);
        assert_eq!(encode_gray(100.0, p, false), 255);
    }

    #[test]
    fn test_non_finite_maps_to_zero() {
        let p = CodecParameters::default();
        assert_eq!(encode_gray(f32::NAN, p, false), 0);
        assert_eq!(encode_gray(f32::INFINITY, p, false), 0);
        assert_eq!(encode_gray(0.0, p, true), 0);
    }

    #[test]
    fn test_disparity_converts_to_depth() {
        let p = CodecParameters::default();
        assert_eq!(encode_gray(0.5, p, true), encode_gray(2.0, p, false));
    }

    #[test]
    fn test_round_trip_within_bound() {
        let p = CodecParameters::default();
        let values: Vec<f32> = (0..64).map(|i| -4.0 + i as f32 * 8.0 / 63.0).collect();
        let input = depth_image(&values, 8).with_timestamp(Timestamp::from_seconds(1.25));

        let mut encoder = DepthCodec::encoder(ComputeDevice::Cpu, p);
        let mut decoder = DepthCodec::decoder(ComputeDevice::Cpu, p);
        encoder.prepare(input.format, 1).unwrap();
        let gray = encoder.render(&input).unwrap();
        assert_eq!(gray.format.pixel_format, PixelFormat::Bgra8);
        assert_eq!(gray.timestamp, input.timestamp);

        decoder.prepare(gray.format, 1).unwrap();
        let decoded = decoder.render(&gray).unwrap();
        for y in 0..8 {
            for x in 0..8 {
                let original = input.f32_at(x, y).unwrap();
                let restored = decoded.f32_at(x, y).unwrap();
                assert!(
                    (original - restored).abs() <= p.range / 255.0,
                    "{} decoded as {}",
                    original,
                    restored
                );
            }
        }
    }

    #[test]
    fn test_encoded_pixels_are_opaque_gray() {
        let mut encoder = DepthCodec::encoder(ComputeDevice::Cpu, CodecParameters::default());
        let input = depth_image(&[0.0, 1.0], 2);
        encoder.prepare(input.format, 0).unwrap();
        let out = encoder.render(&input).unwrap();
        assert_eq!(out.bgra_at(0, 0), Some([128, 128, 128, 255]));
    }

    #[test]
    fn test_direction_format_checks() {
        let mut encoder = DepthCodec::encoder(ComputeDevice::Cpu, CodecParameters::default());
        assert!(encoder
            .prepare(FormatDescription::new(PixelFormat::Bgra8, 4, 4), 1)
            .is_err());
        encoder
            .prepare(FormatDescription::new(PixelFormat::DepthFloat16, 4, 4), 1)
            .unwrap();

        let mut decoder = DepthCodec::decoder(ComputeDevice::Cpu, CodecParameters::default());
        assert!(decoder
            .prepare(FormatDescription::new(PixelFormat::DepthFloat32, 4, 4), 1)
            .is_err());
        decoder
            .prepare(FormatDescription::new(PixelFormat::Bgra8, 4, 4), 1)
            .unwrap();
        assert_eq!(
            decoder.output_format().unwrap().pixel_format,
            PixelFormat::DepthFloat32
        );
    }

    #[test]
    fn test_half_float_input_encodes_like_full_precision() {
        let p = CodecParameters::default();
        let values = [-4.0, -1.5, 0.0, 0.75, 2.0, 4.0];
        let full = depth_image(&values, 3);
        let half = ImageBuffer::from_f32(
            FormatDescription::new(PixelFormat::DepthFloat16, 3, 2),
            &values,
        )
        .unwrap();

        let mut encoder = DepthCodec::encoder(ComputeDevice::Cpu, p);
        encoder.prepare(full.format, 1).unwrap();
        let expected = encoder.render(&full).unwrap().data.clone();
        encoder.prepare(half.format, 1).unwrap();
        let gray = encoder.render(&half).unwrap();
        assert_eq!(gray.format.pixel_format, PixelFormat::Bgra8);
        assert_eq!(gray.data, expected);

        let disparity = ImageBuffer::from_f32(
            FormatDescription::new(PixelFormat::DisparityFloat16, 1, 1),
            &[0.5],
        )
        .unwrap();
        encoder.prepare(disparity.format, 1).unwrap();
        let gray = encoder.render(&disparity).unwrap();
        assert_eq!(gray.bgra_at(0, 0).unwrap()[0], encode_gray(2.0, p, false));
    }

    #[test]
    fn test_pool_exhaustion_drops_frame() {
        let mut encoder = DepthCodec::encoder(ComputeDevice::Cpu, CodecParameters::default());
        let input = depth_image(&[1.0; 4], 2);
        encoder.prepare(input.format, 0).unwrap();
        let held: Vec<_> = (0..2).map(|_| encoder.render(&input).unwrap()).collect();
        assert!(encoder.render(&input).is_none());
        drop(held);
        assert!(encoder.render(&input).is_some());
    }

    #[test]
    fn test_render_before_prepare_returns_none() {
        let mut decoder = DepthCodec::decoder(ComputeDevice::Cpu, CodecParameters::default());
        let input = ImageBuffer::new(FormatDescription::new(PixelFormat::Bgra8, 2, 2));
        assert!(decoder.render(&input).is_none());
    }
}
