//! # depthcam-encode
//!
//! Writing side of the capture pipeline. A [`SynchronizedWriter`] binds one
//! to three [`TrackSink`]s to a [`Container`] and finalizes the file only
//! when every track has finished. Containers: the native `.trk` format
//! ([`TrackFile`]) and FFmpeg muxing ([`FfmpegContainer`]).
//! Landmarks and recording info go to CSV.

pub mod container;
pub mod csv;
pub mod ffmpeg;
pub mod queue;
pub mod sample;
pub mod track;
pub mod trackfile;
pub mod writer;

pub use container::{
    interleave_ready, shared, Container, ContainerStatus, SharedContainer, TrackWriter,
    MAX_INTERLEAVE_SECONDS,
};
pub use csv::{InfoFileWriter, LandmarksFileWriter};
pub use ffmpeg::FfmpegContainer;
pub use queue::SerialQueue;
pub use sample::{MediaKind, Sample, TrackDescriptor, TrackFormat, MAX_AUDIO_CHUNK_SECONDS};
pub use track::{Readiness, TrackCompletion, TrackSink, TrackStats, WriteState};
pub use trackfile::{TrackFile, TrackFileReader, TrackRecord, TrackSummary};
pub use writer::{SynchronizedWriter, WriterEvent, WriterOutcome};
