use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DepthcamError, DepthcamResult};
use crate::settings::{VideoOrientation, DEFAULT_LANDMARK_COUNT};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureConfig {
    pub landmark_count: usize,
    pub video_fps: f64,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub orientation: VideoOrientation,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            landmark_count: DEFAULT_LANDMARK_COUNT,
            video_fps: 30.0,
            audio_sample_rate: 48_000,
            audio_channels: 1,
            orientation: VideoOrientation::LandscapeLeft,
        }
    }
}

/// Where renderers execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderBackend {
    /// GPU when an adapter is available, otherwise CPU.
    #[default]
    Auto,
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RenderConfig {
    pub backend: RenderBackend,
    /// How many output frames downstream consumers may hold at once.
    pub retained_buffer_hint: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            backend: RenderBackend::Auto,
            retained_buffer_hint: 3,
        }
    }
}

/// Linear mapping between depth meters and 8-bit gray.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct CodecConfig {
    pub offset: f32,
    pub range: f32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            offset: -4.0,
            range: 8.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerBackend {
    /// Self-describing `.trk` files, no external tools required.
    #[default]
    Native,
    /// Muxed `.mov`/`.wav` produced by the ffmpeg binary.
    Ffmpeg,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub container: ContainerBackend,
    /// Per-track queue depth before samples are dropped.
    pub queue_depth: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("recordings"),
            container: ContainerBackend::Native,
            queue_depth: 64,
        }
    }
}

/// Contents of `depthcam.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct DepthcamConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl DepthcamConfig {
    pub fn load_from_file(path: &Path) -> DepthcamResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: DepthcamConfig = toml::from_str(&contents)
            .map_err(|e| DepthcamError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> DepthcamResult<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| DepthcamError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> DepthcamResult<()> {
        if self.codec.range <= 0.0 || !self.codec.range.is_finite() {
            return Err(DepthcamError::Config(format!(
                "codec.range must be positive, got {}",
                self.codec.range
            )));
        }
        if self.capture.video_fps <= 0.0 {
            return Err(DepthcamError::Config("capture.video_fps must be positive".into()));
        }
        if self.capture.audio_channels == 0 {
            return Err(DepthcamError::Config("capture.audio_channels must be at least 1".into()));
        }
        if self.output.queue_depth == 0 {
            return Err(DepthcamError::Config("output.queue_depth must be at least 1".into()));
        }
        Ok(())
    }
}
