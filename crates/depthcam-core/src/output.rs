use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::ContainerBackend;
use crate::error::DepthcamResult;

/// The files produced for one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputType {
    Video,
    Audio,
    Depth,
    Landmarks2D,
    Landmarks3D,
    Info,
}

impl OutputType {
    pub const ALL: [OutputType; 6] = [
        OutputType::Video,
        OutputType::Audio,
        OutputType::Depth,
        OutputType::Landmarks2D,
        OutputType::Landmarks3D,
        OutputType::Info,
    ];

    /// Label used in file names.
    pub fn label(&self) -> &'static str {
        match self {
            OutputType::Video => "video",
            OutputType::Audio => "audio",
            OutputType::Depth => "depth",
            OutputType::Landmarks2D => "landmarks2D",
            OutputType::Landmarks3D => "landmarks3D",
            OutputType::Info => "info",
        }
    }

    /// File extension for this output under the given container backend.
    pub fn file_extension(&self, backend: ContainerBackend) -> &'static str {
        match (self, backend) {
            (OutputType::Landmarks2D | OutputType::Landmarks3D | OutputType::Info, _) => "csv",
            (_, ContainerBackend::Native) => "trk",
            (OutputType::Audio, ContainerBackend::Ffmpeg) => "wav",
            (OutputType::Video | OutputType::Depth, ContainerBackend::Ffmpeg) => "mov",
        }
    }
}

/// A directory holding every output file of a single recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingFolder {
    path: PathBuf,
    name: String,
}

impl RecordingFolder {
    /// Create `<base>/<name>` (and parents) if it does not exist yet.
    pub fn create(base: &Path, name: &str) -> DepthcamResult<Self> {
        let path = base.join(name);
        std::fs::create_dir_all(&path)?;
        tracing::debug!("recording folder ready at {}", path.display());
        Ok(Self {
            path,
            name: name.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<folder>/<folder-name>_<label>.<ext>`
    pub fn file_path(&self, output: OutputType, backend: ContainerBackend) -> PathBuf {
        self.path.join(format!(
            "{}_{}.{}",
            self.name,
            output.label(),
            output.file_extension(backend)
        ))
    }

    /// Location of the serialized processor settings.
    pub fn settings_path(&self) -> PathBuf {
        self.path.join(format!("{}_settings.bin", self.name))
    }
}
