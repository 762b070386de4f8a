use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use depthcam_core::{DepthcamError, DepthcamResult, Timestamp};

use crate::container::{interleave_ready, Container, ContainerStatus, TrackWriter};
use crate::sample::{MediaKind, Sample, TrackDescriptor, TrackFormat};

struct StagedState {
    out: Option<BufWriter<File>>,
    samples: u64,
    last: Timestamp,
}

/// Raw data for one track, staged next to the output until muxing.
///
/// Each track has its own lock, so sinks write in parallel.
struct StagedTrack {
    descriptor: TrackDescriptor,
    path: PathBuf,
    state: Mutex<StagedState>,
    failed: AtomicBool,
}

impl StagedTrack {
    fn new(
        descriptor: TrackDescriptor,
        path: PathBuf,
        out: Option<BufWriter<File>>,
        origin: Timestamp,
    ) -> Self {
        Self {
            descriptor,
            path,
            state: Mutex::new(StagedState {
                out,
                samples: 0,
                last: origin,
            }),
            failed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.state.lock().out = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("failed to remove {}: {}", self.path.display(), e),
        }
    }
}

impl TrackWriter for StagedTrack {
    fn append(&self, sample: &Sample) -> DepthcamResult<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(DepthcamError::container("track failed earlier", &self.path));
        }
        if !self.descriptor.accepts(sample) {
            return Err(DepthcamError::InvalidArgument(format!(
                "sample does not match {} track format",
                self.descriptor.kind
            )));
        }
        let mut state = self.state.lock();
        let Some(out) = state.out.as_mut() else {
            return Err(DepthcamError::container("track is closed", &self.path));
        };
        if let Err(e) = sample.write_payload(out) {
            self.failed.store(true, Ordering::Release);
            return Err(e.into());
        }
        state.samples += 1;
        if sample.timestamp() > state.last {
            state.last = sample.timestamp();
        }
        Ok(())
    }
}

/// Container that stages raw tracks and muxes them with FFmpeg on finish.
///
/// Image tracks are encoded with H.264 (`.mov`), audio with AAC, or PCM
/// when the output is audio-only (`.wav`).
pub struct FfmpegContainer {
    path: PathBuf,
    staged: Vec<Arc<StagedTrack>>,
    ended: Vec<bool>,
    status: ContainerStatus,
}

impl FfmpegContainer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            staged: Vec::new(),
            ended: Vec::new(),
            status: ContainerStatus::Idle,
        }
    }

    /// Check if FFmpeg is available on the system.
    pub fn is_available() -> bool {
        Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn staging_path(&self, index: usize, kind: MediaKind) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}.{}.raw", index, kind));
        PathBuf::from(name)
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".partial");
        PathBuf::from(name)
    }

    fn audio_only(&self) -> bool {
        self.staged
            .iter()
            .all(|t| matches!(t.descriptor.format, TrackFormat::Audio { .. }))
    }

    /// Build the ffmpeg invocation that muxes every staged track.
    fn mux_command(&self, output: &Path) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y").args(["-loglevel", "error"]);

        for track in &self.staged {
            match track.descriptor.format {
                TrackFormat::Image { format, fps } => {
                    cmd.args([
                        "-f",
                        "rawvideo",
                        "-pixel_format",
                        "bgra",
                        "-video_size",
                        &format.dimensions.to_string(),
                        "-framerate",
                        &fps.to_string(),
                    ]);
                }
                TrackFormat::Audio {
                    sample_rate,
                    channels,
                } => {
                    cmd.args([
                        "-f",
                        "f32le",
                        "-ar",
                        &sample_rate.to_string(),
                        "-ac",
                        &channels.to_string(),
                    ]);
                }
            }
            cmd.arg("-i").arg(&track.path);
        }

        for i in 0..self.staged.len() {
            cmd.args(["-map", &i.to_string()]);
        }

        if self.audio_only() {
            cmd.args(["-c:a", "pcm_s16le", "-f", "wav"]);
        } else {
            cmd.args([
                "-c:v", "libx264",
                "-pix_fmt", "yuv420p",
                "-preset", "medium",
                "-crf", "18",
                "-c:a", "aac",
                "-b:a", "192k",
                "-f", "mov",
            ]);
        }
        cmd.arg(output);
        cmd
    }

    fn remove_staged(&self) {
        for track in &self.staged {
            track.close();
        }
    }

    fn mux(&self) -> DepthcamResult<()> {
        for track in &self.staged {
            let mut state = track.state.lock();
            if let Some(out) = state.out.take() {
                out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            }
            if state.samples == 0 {
                return Err(DepthcamError::container(
                    format!("{} track has no samples", track.descriptor.kind),
                    &self.path,
                ));
            }
        }

        let partial = self.partial_path();
        let output = self
            .mux_command(&partial)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| DepthcamError::Encode(format!("failed to start ffmpeg: {}", e)))?;

        if !output.status.success() {
            let _ = fs::remove_file(&partial);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DepthcamError::Encode(format!(
                "ffmpeg failed with status {}: {}",
                output.status, stderr
            )));
        }
        fs::rename(&partial, &self.path)?;
        Ok(())
    }
}

impl Container for FfmpegContainer {
    fn path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> ContainerStatus {
        let failed = self.staged.iter().any(|t| t.failed.load(Ordering::Acquire));
        if self.status == ContainerStatus::Writing && failed {
            ContainerStatus::Failed
        } else {
            self.status
        }
    }

    fn open(&mut self, tracks: &[TrackDescriptor], origin: Timestamp) -> DepthcamResult<()> {
        if self.status != ContainerStatus::Idle {
            return Err(DepthcamError::container(
                format!("cannot open a container in state {:?}", self.status),
                &self.path,
            ));
        }
        if tracks.is_empty() {
            return Err(DepthcamError::container("no tracks to write", &self.path));
        }
        if !Self::is_available() {
            return Err(DepthcamError::container(
                "ffmpeg not found in PATH. Install FFmpeg: https://ffmpeg.org/download.html",
                &self.path,
            ));
        }
        for track in tracks {
            if let TrackFormat::Image { format, .. } = track.format {
                // yuv420p needs even dimensions.
                if format.width() % 2 != 0 || format.height() % 2 != 0 {
                    return Err(DepthcamError::container(
                        format!(
                            "{} track of {} cannot be encoded as H.264",
                            track.kind, format.dimensions
                        ),
                        &self.path,
                    ));
                }
            }
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        for (index, descriptor) in tracks.iter().enumerate() {
            let path = self.staging_path(index, descriptor.kind);
            let file = match File::create(&path) {
                Ok(file) => file,
                Err(e) => {
                    self.remove_staged();
                    self.staged.clear();
                    return Err(DepthcamError::container(
                        format!("failed to stage track: {}", e),
                        &path,
                    ));
                }
            };
            self.staged.push(Arc::new(StagedTrack::new(
                *descriptor,
                path,
                Some(BufWriter::new(file)),
                origin,
            )));
        }
        self.ended = vec![false; tracks.len()];
        self.status = ContainerStatus::Writing;
        Ok(())
    }

    fn append(&mut self, track: usize, sample: &Sample) -> DepthcamResult<()> {
        let status = self.status();
        if status != ContainerStatus::Writing {
            return Err(DepthcamError::container(
                format!("append while {:?}", status),
                &self.path,
            ));
        }
        let staged = self.staged.get(track).ok_or_else(|| {
            DepthcamError::InvalidArgument(format!("no track {} in container", track))
        })?;
        staged.append(sample)
    }

    fn finish(&mut self) -> DepthcamResult<()> {
        let status = self.status();
        if status != ContainerStatus::Writing {
            return Err(DepthcamError::container(
                format!("cannot finish a container in state {:?}", status),
                &self.path,
            ));
        }
        let result = self.mux();
        self.remove_staged();
        match result {
            Ok(()) => {
                self.status = ContainerStatus::Completed;
                tracing::info!("muxed {} tracks into {}", self.staged.len(), self.path.display());
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(self.partial_path());
                self.status = ContainerStatus::Failed;
                Err(e)
            }
        }
    }

    fn cancel(&mut self) {
        if self.status == ContainerStatus::Completed {
            return;
        }
        self.remove_staged();
        let _ = fs::remove_file(self.partial_path());
        self.status = ContainerStatus::Cancelled;
        tracing::info!("cancelled {}", self.path.display());
    }

    fn is_ready(&self, track: usize) -> bool {
        if self.status() != ContainerStatus::Writing {
            return true;
        }
        let progress: Vec<Option<Timestamp>> = self
            .staged
            .iter()
            .zip(&self.ended)
            .map(|(t, &ended)| (!ended).then(|| t.state.lock().last))
            .collect();
        interleave_ready(&progress, track)
    }

    fn end_track(&mut self, track: usize) {
        if let Some(ended) = self.ended.get_mut(track) {
            *ended = true;
        }
    }

    fn track_writer(&self, track: usize) -> Option<Arc<dyn TrackWriter>> {
        if self.status() != ContainerStatus::Writing {
            return None;
        }
        self.staged
            .get(track)
            .map(|t| Arc::clone(t) as Arc<dyn TrackWriter>)
    }
}

impl Drop for FfmpegContainer {
    fn drop(&mut self) {
        if matches!(self.status(), ContainerStatus::Writing | ContainerStatus::Failed) {
            self.cancel();
        }
    }
}
