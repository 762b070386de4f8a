//! Media kinds, track formats and the samples written into tracks.

use std::io::Write;

use serde::{Deserialize, Serialize};

use depthcam_core::{AudioBuffer, FormatDescription, PixelFormat, PooledFrame, Timestamp};

/// Longest audio chunk a single sample may carry.
pub const MAX_AUDIO_CHUNK_SECONDS: u64 = 10;

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    /// Depth stored as an 8-bit grayscale video track.
    Depth,
}

impl MediaKind {
    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Depth => "depth",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.label())
    }
}

/// Encoding parameters of a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackFormat {
    Image { format: FormatDescription, fps: f64 },
    Audio { sample_rate: u32, channels: u16 },
}

/// One track of a container: its kind plus its format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub kind: MediaKind,
    pub format: TrackFormat,
}

impl TrackDescriptor {
    /// A BGRA color video track.
    pub fn video(width: u32, height: u32, fps: f64) -> Self {
        Self {
            kind: MediaKind::Video,
            format: TrackFormat::Image {
                format: FormatDescription::new(PixelFormat::Bgra8, width, height),
                fps,
            },
        }
    }

    /// A depth track. Depth arrives already gray-encoded, so it is BGRA too.
    pub fn depth(width: u32, height: u32, fps: f64) -> Self {
        Self {
            kind: MediaKind::Depth,
            format: TrackFormat::Image {
                format: FormatDescription::new(PixelFormat::Bgra8, width, height),
                fps,
            },
        }
    }

    pub fn audio(sample_rate: u32, channels: u16) -> Self {
        Self {
            kind: MediaKind::Audio,
            format: TrackFormat::Audio {
                sample_rate,
                channels,
            },
        }
    }

    /// Largest payload a sample of this track can have, in bytes.
    pub fn max_payload_len(&self) -> u64 {
        match self.format {
            TrackFormat::Image { format, .. } => format.byte_size() as u64,
            TrackFormat::Audio {
                sample_rate,
                channels,
            } => sample_rate as u64 * channels as u64 * 4 * MAX_AUDIO_CHUNK_SECONDS,
        }
    }

    /// Check that `sample` can go into this track.
    pub fn accepts(&self, sample: &Sample) -> bool {
        match (&self.format, sample) {
            (TrackFormat::Image { format, .. }, Sample::Image(frame)) => frame.format == *format,
            (
                TrackFormat::Audio {
                    sample_rate,
                    channels,
                },
                Sample::Audio(audio),
            ) => {
                audio.sample_rate == *sample_rate
                    && audio.channels == *channels
                    && sample.payload_len() as u64 <= self.max_payload_len()
            }
            _ => false,
        }
    }
}

/// A timestamped unit of media handed to a track sink.
#[derive(Debug)]
pub enum Sample {
    Image(PooledFrame),
    Audio(AudioBuffer),
}

impl Sample {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Sample::Image(frame) => frame.timestamp,
            Sample::Audio(audio) => audio.timestamp,
        }
    }

    /// Size of the raw payload in bytes.
    pub fn payload_len(&self) -> usize {
        match self {
            Sample::Image(frame) => frame.data.len(),
            Sample::Audio(audio) => audio.samples.len() * 4,
        }
    }

    /// Write the raw payload: pixel bytes, or little-endian f32 PCM.
    pub fn write_payload<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        match self {
            Sample::Image(frame) => out.write_all(&frame.data),
            Sample::Audio(audio) => {
                for s in &audio.samples {
                    out.write_all(&s.to_le_bytes())?;
                }
                Ok(())
            }
        }
    }
}

impl From<PooledFrame> for Sample {
    fn from(frame: PooledFrame) -> Self {
        Sample::Image(frame)
    }
}

impl From<AudioBuffer> for Sample {
    fn from(audio: AudioBuffer) -> Self {
        Sample::Audio(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcam_core::ImageBuffer;

    #[test]
    fn test_accepts_matching_formats_only() {
        let video = TrackDescriptor::video(4, 2, 30.0);
        let audio = TrackDescriptor::audio(48_000, 1);

        let frame = Sample::Image(PooledFrame::detached(ImageBuffer::new(
            FormatDescription::new(PixelFormat::Bgra8, 4, 2),
        )));
        let wrong = Sample::Image(PooledFrame::detached(ImageBuffer::new(
            FormatDescription::new(PixelFormat::Bgra8, 2, 2),
        )));
        let pcm = Sample::Audio(AudioBuffer::new(48_000, 1, Timestamp::zero(), vec![0.0; 8]));

        assert!(video.accepts(&frame));
        assert!(!video.accepts(&wrong));
        assert!(!video.accepts(&pcm));
        assert!(audio.accepts(&pcm));
        assert!(!audio.accepts(&frame));
    }

    #[test]
    fn test_audio_chunks_are_bounded() {
        let audio = TrackDescriptor::audio(100, 2);
        assert_eq!(audio.max_payload_len(), 100 * 2 * 4 * MAX_AUDIO_CHUNK_SECONDS);
        let limit = (100 * 2 * MAX_AUDIO_CHUNK_SECONDS) as usize;
        let fits = Sample::Audio(AudioBuffer::new(100, 2, Timestamp::zero(), vec![0.0; limit]));
        let over = Sample::Audio(AudioBuffer::new(
            100,
            2,
            Timestamp::zero(),
            vec![0.0; limit + 2],
        ));
        assert!(audio.accepts(&fits));
        assert!(!audio.accepts(&over));
        assert_eq!(TrackDescriptor::depth(4, 2, 30.0).max_payload_len(), 32);
    }

    #[test]
    fn test_audio_payload_is_little_endian_f32() {
        let sample = Sample::Audio(AudioBuffer::new(
            8_000,
            1,
            Timestamp::zero(),
            vec![1.0, -0.5],
        ));
        let mut out = Vec::new();
        sample.write_payload(&mut out).unwrap();
        assert_eq!(out.len(), sample.payload_len());
        assert_eq!(&out[..4], &1.0f32.to_le_bytes());
        assert_eq!(&out[4..], &(-0.5f32).to_le_bytes());
    }

    #[test]
    fn test_descriptor_survives_msgpack() {
        let depth = TrackDescriptor::depth(640, 480, 30.0);
        let bytes = rmp_serde::to_vec_named(&depth).unwrap();
        let back: TrackDescriptor = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, depth);
    }
}
