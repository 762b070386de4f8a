//! The output file a synchronized writer drives.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use depthcam_core::{DepthcamResult, Timestamp};

use crate::sample::{Sample, TrackDescriptor};

/// Lifecycle of a container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Not opened yet.
    Idle,
    Writing,
    /// Finalized on disk at [`Container::path`].
    Completed,
    /// Unrecoverable write error; only `cancel` is meaningful now.
    Failed,
    /// Write abandoned and partial data removed.
    Cancelled,
}

impl ContainerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Completed | ContainerStatus::Cancelled
        )
    }
}

/// How far, in seconds, a track may run ahead of any other open track.
pub const MAX_INTERLEAVE_SECONDS: f64 = 1.0;

/// Interleaving rule shared by the containers. `progress[i]` is the latest
/// timestamp written to track `i`, or `None` once that track has ended.
///
/// The least advanced open track is always ready, so some track can always
/// make progress.
pub fn interleave_ready(progress: &[Option<Timestamp>], track: usize) -> bool {
    let Some(Some(mine)) = progress.get(track) else {
        return true;
    };
    progress
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != track)
        .all(|(_, other)| match other {
            Some(other) => mine.seconds_since(*other) <= MAX_INTERLEAVE_SECONDS,
            None => true,
        })
}

/// Appends to one track without going through the container's lock.
pub trait TrackWriter: Send + Sync {
    fn append(&self, sample: &Sample) -> DepthcamResult<()>;
}

/// A multi-track output file.
///
/// The final path only ever holds a complete file: implementations write
/// elsewhere until [`Container::finish`] and clean up on [`Container::cancel`].
pub trait Container: Send {
    /// Final location of the file.
    fn path(&self) -> &Path;

    fn status(&self) -> ContainerStatus;

    /// Begin writing with the given track layout. `origin` is the session
    /// time every track's timeline is relative to.
    fn open(&mut self, tracks: &[TrackDescriptor], origin: Timestamp) -> DepthcamResult<()>;

    /// Append one sample to track `track`. An error with the status still
    /// `Writing` means only this sample was lost.
    fn append(&mut self, track: usize, sample: &Sample) -> DepthcamResult<()>;

    /// Finalize the file at [`Container::path`].
    fn finish(&mut self) -> DepthcamResult<()>;

    /// Abandon the write and delete anything written so far.
    fn cancel(&mut self);

    /// Whether `track` can take more data. Containers that interleave
    /// tracks hold back a track that runs ahead of the others.
    fn is_ready(&self, _track: usize) -> bool {
        true
    }

    /// No more samples will arrive on `track`, so it no longer holds the
    /// other tracks back.
    fn end_track(&mut self, _track: usize) {}

    /// A writer for `track` that can be used while the container is shared,
    /// if the container stores tracks independently.
    fn track_writer(&self, _track: usize) -> Option<Arc<dyn TrackWriter>> {
        None
    }
}

/// A container shared between the writer, its sinks and the barrier thread.
pub type SharedContainer = Arc<Mutex<Box<dyn Container>>>;

pub fn shared(container: impl Container + 'static) -> SharedContainer {
    Arc::new(Mutex::new(Box::new(container)))
}
