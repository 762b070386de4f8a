mod session;
mod synthetic;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use depthcam_core::{DepthcamConfig, Dimensions, ProcessorSettings, RenderBackend};
use depthcam_encode::{FfmpegContainer, TrackFileReader, TrackFormat};
use depthcam_render::ComputeDevice;

use session::SessionOptions;

#[derive(Parser)]
#[command(
    name = "depthcam",
    version,
    about = "depthcam: synchronized depth, video and face landmark recording",
    long_about = "Records color video, audio, depth and face landmarks into a recording folder.\nDepth is rectified and gray-encoded on the GPU when one is available."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a synthetic capture session
    Record {
        /// Number of video frames to capture
        #[arg(short = 'n', long, default_value_t = 90)]
        frames: u64,

        /// Base directory for recording folders (default: from config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Path to depthcam.toml
        #[arg(short, long, default_value = "depthcam.toml")]
        config: PathBuf,

        /// Render backend: auto, gpu, cpu (default: from config)
        #[arg(long)]
        backend: Option<String>,

        /// Video resolution, e.g. 640x480
        #[arg(long, default_value = "640x480")]
        video_size: String,

        /// Depth resolution, e.g. 320x240
        #[arg(long, default_value = "320x240")]
        depth_size: String,

        /// Subject identifier written to the info file
        #[arg(long, default_value = "synthetic")]
        subject: String,

        /// Task name written to the info file
        #[arg(long, default_value = "record")]
        task: String,

        /// Record only the audio track
        #[arg(long)]
        audio_only: bool,

        /// Print the session report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a saved processor settings blob as JSON
    Inspect {
        /// Path to a <recording>_settings.bin file
        #[arg()]
        file: PathBuf,
    },

    /// List the tracks and records of a .trk file
    Dump {
        /// Path to the .trk file
        #[arg()]
        file: PathBuf,
    },

    /// Show the compute device and available container backends
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Record {
            frames,
            output,
            config,
            backend,
            video_size,
            depth_size,
            subject,
            task,
            audio_only,
            json,
        } => {
            let options = SessionOptions {
                frames,
                video: parse_dimensions(&video_size)?,
                depth: parse_dimensions(&depth_size)?,
                subject_id: subject,
                task,
                audio_only,
            };
            cmd_record(&config, output, backend, options, json)
        }
        Commands::Inspect { file } => cmd_inspect(&file),
        Commands::Dump { file } => cmd_dump(&file),
        Commands::Info => cmd_info(),
    }
}

fn parse_dimensions(value: &str) -> Result<Dimensions> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .with_context(|| format!("expected WIDTHxHEIGHT, got '{}'", value))?;
    let dims = Dimensions::new(
        w.trim().parse().with_context(|| format!("bad width in '{}'", value))?,
        h.trim().parse().with_context(|| format!("bad height in '{}'", value))?,
    );
    if dims.is_empty() {
        anyhow::bail!("dimensions must be non-zero, got '{}'", value);
    }
    Ok(dims)
}

fn parse_backend(value: &str) -> Result<RenderBackend> {
    match value.to_ascii_lowercase().as_str() {
        "auto" => Ok(RenderBackend::Auto),
        "gpu" => Ok(RenderBackend::Gpu),
        "cpu" => Ok(RenderBackend::Cpu),
        other => anyhow::bail!("unknown backend '{}' (expected auto, gpu or cpu)", other),
    }
}

/// Load `path` if it exists, otherwise fall back to defaults.
fn load_config(path: &Path) -> Result<DepthcamConfig> {
    if !path.exists() {
        tracing::debug!("{} not found, using default configuration", path.display());
        return Ok(DepthcamConfig::default());
    }
    DepthcamConfig::load_from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))
}

fn cmd_record(
    config_path: &Path,
    output: Option<PathBuf>,
    backend: Option<String>,
    options: SessionOptions,
    json: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = output {
        config.output.directory = dir;
    }
    if let Some(backend) = backend {
        config.render.backend = parse_backend(&backend)?;
    }
    config.validate()?;

    let device = ComputeDevice::from_backend(config.render.backend)?;
    if !json {
        println!("depthcam record");
        println!("   Device:    {}", device.describe());
        println!("   Frames:    {}", options.frames);
        println!("   Container: {:?}", config.output.container);
    }

    let report = session::run(&config, device, &options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("   Folder:    {}", report.folder.display());
        for output in &report.outputs {
            let status = match &output.message {
                None => "ok".to_string(),
                Some(reason) => format!("FAILED: {}", reason),
            };
            println!(
                "   {:<10} {} ({} written, {} dropped) -> {}",
                output.output,
                status,
                output.appended,
                output.dropped,
                output.path.display()
            );
        }
        println!(
            "   Depth round-trip error: {:.4} m",
            report.depth_roundtrip_error
        );
        println!("   Finished in {:.2}s", report.elapsed_seconds);
    }

    if !report.success() {
        anyhow::bail!("recording failed");
    }
    Ok(())
}

fn cmd_inspect(file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let settings = ProcessorSettings::from_bytes(&bytes)
        .with_context(|| format!("{} is not a settings blob", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn cmd_dump(file: &Path) -> Result<()> {
    let reader = TrackFileReader::open(file)?;
    println!("{}", file.display());
    println!("   Origin: {}", reader.origin());
    drop(reader);

    for (i, track) in TrackFileReader::summarize(file)?.iter().enumerate() {
        let format = match track.descriptor.format {
            TrackFormat::Image { format, fps } => {
                format!("{} {} @ {}fps", format.pixel_format, format.dimensions, fps)
            }
            TrackFormat::Audio {
                sample_rate,
                channels,
            } => format!("f32 {}Hz x{}", sample_rate, channels),
        };
        let span = match (track.first, track.last) {
            (Some(first), Some(last)) => format!("{} .. {}", first, last),
            _ => "empty".to_string(),
        };
        println!(
            "   #{} {:<6} {:<28} {:>6} records {:>12} bytes  {}",
            i, track.descriptor.kind, format, track.records, track.bytes, span
        );
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    println!("depthcam");
    println!("   Version:   {}", env!("CARGO_PKG_VERSION"));
    let device = ComputeDevice::from_backend(RenderBackend::Auto)?;
    println!("   Renderer:  {}", device.describe());
    println!("   Native:    .trk container (always available)");
    println!(
        "   FFmpeg:    {}",
        if FfmpegContainer::is_available() {
            "available"
        } else {
            "NOT FOUND"
        }
    );
    Ok(())
}
