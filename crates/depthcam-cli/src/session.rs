//! One recording: capture, render and write every output of a session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;

use depthcam_core::{
    ContainerBackend, DepthcamConfig, Dimensions, ImageBuffer, OutputType, Point3,
    ProcessorSettings, RecordingFolder, Timestamp,
};
use depthcam_encode::{
    shared, FfmpegContainer, InfoFileWriter, LandmarksFileWriter, MediaKind, SharedContainer,
    SynchronizedWriter, TrackDescriptor, TrackFile, WriterOutcome,
};
use depthcam_render::{ComputeDevice, DepthCodec, FaceLandmarksProcessor, FrameRenderer};

use crate::synthetic::SyntheticCamera;

pub struct SessionOptions {
    pub frames: u64,
    pub video: Dimensions,
    pub depth: Dimensions,
    pub subject_id: String,
    pub task: String,
    /// Record the audio track alone instead of video, depth and landmarks.
    pub audio_only: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            frames: 90,
            video: Dimensions::new(640, 480),
            depth: Dimensions::new(320, 240),
            subject_id: "synthetic".into(),
            task: "record".into(),
            audio_only: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OutputReport {
    pub output: &'static str,
    pub path: PathBuf,
    pub success: bool,
    pub message: Option<String>,
    pub appended: u64,
    pub dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub folder: PathBuf,
    pub device: String,
    pub frames: u64,
    pub elapsed_seconds: f64,
    /// Largest depth error after the gray round-trip, in meters.
    pub depth_roundtrip_error: f32,
    pub outputs: Vec<OutputReport>,
}

impl SessionReport {
    pub fn success(&self) -> bool {
        self.outputs.iter().all(|o| o.success)
    }
}

fn open_container(backend: ContainerBackend, path: PathBuf) -> SharedContainer {
    match backend {
        ContainerBackend::Native => shared(TrackFile::new(path)),
        ContainerBackend::Ffmpeg => shared(FfmpegContainer::new(path)),
    }
}

fn recording_name() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S-%3f").to_string()
}

/// Write a BGRA frame as a PNG.
fn save_preview(frame: &ImageBuffer, path: &Path) -> Result<()> {
    let mut rgba = frame.data.clone();
    for px in rgba.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
    let image = image::RgbaImage::from_raw(frame.width(), frame.height(), rgba)
        .context("preview buffer does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to write preview {}", path.display()))?;
    Ok(())
}

fn report(
    output: OutputType,
    path: PathBuf,
    writer: &SynchronizedWriter,
    kind: MediaKind,
    outcome: &WriterOutcome,
) -> OutputReport {
    let stats = writer.stats(kind).unwrap_or_default();
    OutputReport {
        output: output.label(),
        path,
        success: outcome.is_success(),
        message: match outcome {
            WriterOutcome::Completed => None,
            WriterOutcome::Failed(reason) => Some(reason.clone()),
        },
        appended: stats.appended,
        dropped: stats.dropped,
    }
}

/// Record the audio track alone.
fn run_audio_only(
    config: &DepthcamConfig,
    options: &SessionOptions,
    folder: &RecordingFolder,
    started: Instant,
    device: String,
) -> Result<SessionReport> {
    let backend = config.output.container;
    let path = folder.file_path(OutputType::Audio, backend);
    let mut writer = SynchronizedWriter::audio_only(
        open_container(backend, path.clone()),
        TrackDescriptor::audio(config.capture.audio_sample_rate, config.capture.audio_channels),
        config.output.queue_depth,
    )?;
    let mut camera = SyntheticCamera::new(&config.capture, options.video, options.depth, 0);
    writer.start(Timestamp::zero())?;
    for _ in 0..options.frames {
        let frame = camera.next_frame();
        writer.write_audio(frame.audio);
    }
    writer.end_recording();
    let outcome = writer.wait();

    Ok(SessionReport {
        folder: folder.path().to_path_buf(),
        device,
        frames: options.frames,
        elapsed_seconds: started.elapsed().as_secs_f64(),
        depth_roundtrip_error: 0.0,
        outputs: vec![report(OutputType::Audio, path, &writer, MediaKind::Audio, &outcome)],
    })
}

/// Run a synthetic session and write every output into a new recording folder.
pub fn run(
    config: &DepthcamConfig,
    device: ComputeDevice,
    options: &SessionOptions,
) -> Result<SessionReport> {
    run_named(config, device, options, &recording_name())
}

fn run_named(
    config: &DepthcamConfig,
    device: ComputeDevice,
    options: &SessionOptions,
    name: &str,
) -> Result<SessionReport> {
    let started = Instant::now();
    let folder = RecordingFolder::create(&config.output.directory, name)
        .context("failed to create recording folder")?;
    tracing::info!("recording into {}", folder.path().display());

    if options.audio_only {
        return run_audio_only(config, options, &folder, started, device.describe());
    }

    let capture = &config.capture;
    let backend = config.output.container;
    let queue_depth = config.output.queue_depth;
    // Writer queues hold frames too, so pools must cover them.
    let retained = config.render.retained_buffer_hint + queue_depth;

    let settings = Arc::new(
        ProcessorSettings::new(options.video, options.depth, capture.orientation)
            .with_landmark_count(capture.landmark_count),
    );
    let mut camera = SyntheticCamera::new(capture, options.video, options.depth, retained);

    let video_path = folder.file_path(OutputType::Video, backend);
    let depth_path = folder.file_path(OutputType::Depth, backend);
    let mut video_writer = SynchronizedWriter::video_audio(
        open_container(backend, video_path.clone()),
        TrackDescriptor::video(options.video.width, options.video.height, capture.video_fps),
        TrackDescriptor::audio(capture.audio_sample_rate, capture.audio_channels),
        queue_depth,
    )?;
    let mut depth_writer = SynchronizedWriter::depth_only(
        open_container(backend, depth_path.clone()),
        TrackDescriptor::depth(options.depth.width, options.depth.height, capture.video_fps),
        queue_depth,
    )?;

    let mut landmarks_2d = LandmarksFileWriter::create(
        folder.file_path(OutputType::Landmarks2D, backend),
        capture.landmark_count,
    )?;
    let mut landmarks_3d = LandmarksFileWriter::create(
        folder.file_path(OutputType::Landmarks3D, backend),
        capture.landmark_count,
    )?;
    let info = InfoFileWriter::create(
        folder.file_path(OutputType::Info, backend),
        options.subject_id.as_str(),
        options.task.as_str(),
    )?;

    let codec = config.codec.into();
    let mut encoder = DepthCodec::encoder(device.clone(), codec);
    let mut decoder = DepthCodec::decoder(device.clone(), codec);
    let mut faces = FaceLandmarksProcessor::new(device.clone(), Arc::clone(&settings));
    let device_name = device.describe();

    // Returning early from here on drops the writers, which discards their
    // containers instead of finalizing a truncated recording.
    let origin = Timestamp::zero();
    video_writer.start(origin)?;
    depth_writer.start(origin)?;

    let mut roundtrip_error = 0.0f32;
    for _ in 0..options.frames {
        let frame = camera.next_frame();
        if frame.index == 0 {
            settings.attach_calibration(camera.calibration())?;
            encoder.prepare(frame.depth.format, retained)?;
            if let Some(gray) = encoder.output_format() {
                decoder.prepare(gray, 1)?;
            }
        }
        let seconds = frame.timestamp.seconds_since(origin);

        if let Some(video) = frame.video {
            if frame.index == 0 {
                save_preview(&video, &folder.path().join(format!("{}_preview.png", name)))?;
            }
            video_writer.write_video(video);
        } else {
            tracing::warn!("capture pool exhausted, frame {} has no video", frame.index);
        }
        video_writer.write_audio(frame.audio);

        if let Some(gray) = encoder.render(&frame.depth) {
            if frame.index == 0 {
                save_preview(&gray, &folder.path().join(format!("{}_depth_preview.png", name)))?;
            }
            if let Some(decoded) = decoder.render(&gray) {
                roundtrip_error = roundtrip_error.max(max_error(&frame.depth, &decoded));
            }
            depth_writer.write_depth(gray);
        }

        let record = faces.process(frame.face.as_ref(), Some(&frame.depth));
        landmarks_2d.write_row(seconds, record.bounding_box, &record.landmarks_2d)?;
        let zeros = vec![Point3::zero(); capture.landmark_count];
        landmarks_3d.write_row(
            seconds,
            record.bounding_box,
            record.landmarks_3d.as_deref().unwrap_or(&zeros),
        )?;
    }

    video_writer.end_recording();
    depth_writer.end_recording();
    let video_outcome = video_writer.wait();
    let depth_outcome = depth_writer.wait();

    let rows = landmarks_2d.finish()?;
    landmarks_3d.finish()?;
    info.write_info(&settings, name, rows)?;
    std::fs::write(folder.settings_path(), settings.to_bytes()?)
        .context("failed to write processor settings")?;

    // Audio shares the video container.
    let outputs = vec![
        report(
            OutputType::Video,
            video_path.clone(),
            &video_writer,
            MediaKind::Video,
            &video_outcome,
        ),
        report(
            OutputType::Audio,
            video_path,
            &video_writer,
            MediaKind::Audio,
            &video_outcome,
        ),
        report(
            OutputType::Depth,
            depth_path,
            &depth_writer,
            MediaKind::Depth,
            &depth_outcome,
        ),
    ];

    Ok(SessionReport {
        folder: folder.path().to_path_buf(),
        device: device_name,
        frames: options.frames,
        elapsed_seconds: started.elapsed().as_secs_f64(),
        depth_roundtrip_error: roundtrip_error,
        outputs,
    })
}

/// Largest absolute difference over pixels that are finite in both images.
fn max_error(original: &ImageBuffer, decoded: &ImageBuffer) -> f32 {
    let mut worst = 0.0f32;
    for y in 0..original.height() {
        for x in 0..original.width() {
            if let (Some(a), Some(b)) = (original.f32_at(x, y), decoded.f32_at(x, y)) {
                if a.is_finite() && b.is_finite() {
                    worst = worst.max((a - b).abs());
                }
            }
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcam_encode::TrackFileReader;

    fn config(dir: &Path) -> DepthcamConfig {
        let mut config = DepthcamConfig::default();
        config.output.directory = dir.to_path_buf();
        config.capture.landmark_count = 6;
        config
    }

    fn options(frames: u64) -> SessionOptions {
        SessionOptions {
            frames,
            video: Dimensions::new(64, 48),
            depth: Dimensions::new(32, 24),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn test_session_writes_every_output() {
        let dir = tempfile::tempdir().unwrap();
        let report = run(&config(dir.path()), ComputeDevice::Cpu, &options(12)).unwrap();
        assert!(report.success(), "{:?}", report.outputs);
        assert!(report.depth_roundtrip_error <= 8.0 / 255.0 + 1e-4);

        let video = &report.outputs[0];
        assert_eq!(video.appended, 12);
        let summary = TrackFileReader::summarize(&video.path).unwrap();
        assert_eq!(summary[0].records, 12);
        assert_eq!(summary[1].records, 12);

        let name = report.folder.file_name().unwrap().to_string_lossy().into_owned();
        let csv = std::fs::read_to_string(report.folder.join(format!("{}_landmarks2D.csv", name)))
            .unwrap();
        assert_eq!(csv.lines().count(), 13);
        let info = std::fs::read_to_string(report.folder.join(format!("{}_info.csv", name)))
            .unwrap();
        assert!(info.lines().nth(1).unwrap().ends_with(",12,"));

        let blob = std::fs::read(report.folder.join(format!("{}_settings.bin", name))).unwrap();
        let settings = ProcessorSettings::from_bytes(&blob).unwrap();
        assert!(settings.calibration().is_some());
        assert_eq!(settings.landmark_count, 6);
        assert!(report.folder.join(format!("{}_preview.png", name)).exists());
    }

    #[test]
    fn test_failure_mid_session_discards_containers() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the depth preview should go makes frame 0 fail.
        let folder = dir.path().join("take");
        std::fs::create_dir_all(folder.join("take_depth_preview.png")).unwrap();

        let result = run_named(&config(dir.path()), ComputeDevice::Cpu, &options(12), "take");
        assert!(result.is_err());
        assert!(folder.join("take_preview.png").exists());
        for file in ["take_video.trk", "take_depth.trk"] {
            assert!(!folder.join(file).exists(), "{} was finalized", file);
            assert!(!folder.join(format!("{}.partial", file)).exists());
        }
    }

    #[test]
    fn test_audio_only_session() {
        let dir = tempfile::tempdir().unwrap();
        let opts = SessionOptions {
            audio_only: true,
            ..options(5)
        };
        let report = run(&config(dir.path()), ComputeDevice::Cpu, &opts).unwrap();
        assert!(report.success());
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].appended, 5);
        assert!(report.outputs[0].path.to_string_lossy().ends_with("_audio.trk"));
    }
}
