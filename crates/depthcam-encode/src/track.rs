//! Track sinks: one per media kind, each with its own serial queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use depthcam_core::{DepthcamError, DepthcamResult};

use crate::container::{ContainerStatus, SharedContainer, TrackWriter};
use crate::queue::{Rejected, SerialQueue};
use crate::sample::{MediaKind, Sample};

const READINESS_POLL: Duration = Duration::from_millis(2);

/// State of a track sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Inactive,
    Active,
    Finished,
    Failed,
}

/// "Ready for more data" flag, controlled by whoever consumes the track.
///
/// Sinks refresh every flag of their writer from [`Container::is_ready`]
/// after each append and while waiting to end.
///
/// [`Container::is_ready`]: crate::container::Container::is_ready
#[derive(Debug, Clone)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new(ready: bool) -> Self {
        Self(Arc::new(AtomicBool::new(ready)))
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Sample counters for one track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackStats {
    pub appended: u64,
    pub dropped: u64,
}

/// Terminal signal of one track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackCompletion {
    pub track: usize,
    pub kind: MediaKind,
    pub result: Result<(), String>,
}

enum SinkJob {
    Append(Sample),
    EndOfStream,
}

struct SinkShared {
    kind: MediaKind,
    track: usize,
    container: SharedContainer,
    writer: Mutex<Option<Arc<dyn TrackWriter>>>,
    state: Mutex<WriteState>,
    readiness: Readiness,
    /// Flags of every track in the container, indexed by track.
    board: Vec<Readiness>,
    appended: AtomicU64,
    dropped: AtomicU64,
    signalled: AtomicBool,
    completions: Sender<TrackCompletion>,
}

impl SinkShared {
    fn drop_sample(&self, reason: &str) {
        let total = self.dropped.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!("{} track dropped a sample ({}), {} dropped so far", self.kind, reason, total);
    }

    /// Emit the terminal signal. Only the first call has any effect.
    fn complete(&self, result: Result<(), String>) {
        if self.signalled.swap(true, Ordering::AcqRel) {
            return;
        }
        let completion = TrackCompletion {
            track: self.track,
            kind: self.kind,
            result,
        };
        if self.completions.send(completion).is_err() {
            tracing::debug!("{} track completed with nobody listening", self.kind);
        }
    }

    fn fail(&self, reason: String) {
        *self.state.lock() = WriteState::Failed;
        tracing::error!("{} track failed: {}", self.kind, reason);
        self.release();
        self.complete(Err(reason));
    }

    /// Copy the container's view of every track into the readiness board.
    fn refresh(&self) {
        let container = self.container.lock();
        for (track, flag) in self.board.iter().enumerate() {
            flag.set_ready(container.is_ready(track));
        }
    }

    /// Stop holding the other tracks back.
    fn release(&self) {
        self.container.lock().end_track(self.track);
        self.refresh();
    }

    fn handle(&self, job: SinkJob) {
        match job {
            SinkJob::Append(sample) => self.write(sample),
            SinkJob::EndOfStream => self.end(),
        }
    }

    fn write(&self, sample: Sample) {
        if *self.state.lock() != WriteState::Active {
            self.drop_sample("track is not active");
            return;
        }
        let writer = self.writer.lock().clone();
        let result = match writer {
            Some(writer) => writer.append(&sample),
            None => self.container.lock().append(self.track, &sample),
        };
        let status = self.container.lock().status();
        // Flags first, so counters never run ahead of readiness.
        self.refresh();
        match result {
            Ok(()) => {
                self.appended.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) if status == ContainerStatus::Failed => self.fail(e.to_string()),
            Err(_) if status.is_terminal() => self.drop_sample("container is closed"),
            Err(e) => {
                tracing::warn!("{} track failed to append sample: {}", self.kind, e);
                self.drop_sample("append failed");
            }
        }
    }

    fn end(&self) {
        loop {
            self.refresh();
            if self.readiness.is_ready() {
                break;
            }
            std::thread::sleep(READINESS_POLL);
        }
        let mut state = self.state.lock();
        match *state {
            WriteState::Active => {
                *state = WriteState::Finished;
                drop(state);
                self.release();
                tracing::debug!(
                    "{} track finished after {} samples",
                    self.kind,
                    self.appended.load(Ordering::Acquire)
                );
                self.complete(Ok(()));
            }
            WriteState::Inactive => {
                *state = WriteState::Failed;
                drop(state);
                self.release();
                self.complete(Err(format!("{} track ended before it started", self.kind)));
            }
            // A failed track already signalled; a finished one ends once.
            WriteState::Failed | WriteState::Finished => {}
        }
    }
}

/// One media track feeding a shared container.
///
/// Appends are checked against the readiness flag on the caller's thread and
/// written on the sink's own worker. Containers that hand out a
/// [`TrackWriter`] are written without holding the container lock, so slow
/// tracks do not block each other.
pub struct TrackSink {
    shared: Arc<SinkShared>,
    queue: SerialQueue<SinkJob>,
}

impl TrackSink {
    /// `track` is this sink's index in the container's track list and in
    /// `board`, the readiness flags of every track sharing the container.
    pub fn new(
        kind: MediaKind,
        track: usize,
        container: SharedContainer,
        completions: Sender<TrackCompletion>,
        board: Vec<Readiness>,
        queue_depth: usize,
    ) -> DepthcamResult<Self> {
        let readiness = board.get(track).cloned().ok_or_else(|| {
            DepthcamError::InvalidArgument(format!(
                "track {} has no readiness flag among {}",
                track,
                board.len()
            ))
        })?;
        let shared = Arc::new(SinkShared {
            kind,
            track,
            container,
            writer: Mutex::new(None),
            state: Mutex::new(WriteState::Inactive),
            readiness,
            board,
            appended: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            signalled: AtomicBool::new(false),
            completions,
        });
        let worker = Arc::clone(&shared);
        let queue = SerialQueue::spawn(
            format!("depthcam-{}-track", kind),
            queue_depth,
            move |job| worker.handle(job),
        )?;
        Ok(Self { shared, queue })
    }

    pub fn kind(&self) -> MediaKind {
        self.shared.kind
    }

    pub fn state(&self) -> WriteState {
        *self.shared.state.lock()
    }

    /// Handle to the readiness flag. Clones share the same flag.
    pub fn readiness(&self) -> Readiness {
        self.shared.readiness.clone()
    }

    pub fn stats(&self) -> TrackStats {
        TrackStats {
            appended: self.shared.appended.load(Ordering::Acquire),
            dropped: self.shared.dropped.load(Ordering::Acquire),
        }
    }

    /// Move to `Active`. The container must already be open; otherwise the
    /// sink fails and the error is returned here, not through the
    /// completion channel.
    pub fn start(&self) -> DepthcamResult<()> {
        let mut state = self.shared.state.lock();
        if *state != WriteState::Inactive {
            return Err(DepthcamError::InvalidState(format!(
                "{} track cannot start from {:?}",
                self.shared.kind, *state
            )));
        }
        let container = self.shared.container.lock();
        let status = container.status();
        if status != ContainerStatus::Writing {
            *state = WriteState::Failed;
            self.shared.signalled.store(true, Ordering::Release);
            return Err(DepthcamError::TrackFailed(format!(
                "{} track cannot start: container is {:?}",
                self.shared.kind, status
            )));
        }
        *self.shared.writer.lock() = container.track_writer(self.shared.track);
        *state = WriteState::Active;
        Ok(())
    }

    /// Fail a sink that never started. No completion is emitted.
    pub(crate) fn abort(&self) {
        let mut state = self.shared.state.lock();
        if *state == WriteState::Inactive {
            *state = WriteState::Failed;
            self.shared.signalled.store(true, Ordering::Release);
        }
    }

    /// Queue a sample. Returns `false` if it was dropped.
    pub fn append(&self, sample: Sample) -> bool {
        if self.state() != WriteState::Active {
            self.shared.drop_sample("track is not active");
            return false;
        }
        if !self.shared.readiness.is_ready() {
            self.shared.drop_sample("not ready for more data");
            return false;
        }
        match self.queue.try_submit(SinkJob::Append(sample)) {
            Ok(()) => true,
            Err(Rejected::Full(_)) => {
                tracing::warn!("{} track queue is full", self.shared.kind);
                self.shared.drop_sample("queue full");
                false
            }
            Err(Rejected::Closed(_)) => {
                self.shared.drop_sample("queue closed");
                false
            }
        }
    }

    /// Queue the end of the stream behind every pending sample. The sink
    /// signals completion from its worker once readiness allows.
    pub fn end_of_stream(&self) {
        if self.queue.submit(SinkJob::EndOfStream).is_err() {
            self.shared
                .fail(format!("{} track queue closed before end of stream", self.shared.kind));
        }
    }
}

impl std::fmt::Debug for TrackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackSink")
            .field("kind", &self.shared.kind)
            .field("track", &self.shared.track)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::shared;
    use crate::sample::TrackDescriptor;
    use crate::trackfile::TrackFile;
    use crossbeam_channel::unbounded;
    use depthcam_core::{AudioBuffer, Timestamp};

    fn audio_at(ms: f64) -> Sample {
        Sample::Audio(AudioBuffer::new(
            8_000,
            1,
            Timestamp::from_millis(ms),
            vec![0.0; 80],
        ))
    }

    fn open_container(dir: &std::path::Path) -> SharedContainer {
        let container = shared(TrackFile::new(dir.join("audio.trk")));
        container
            .lock()
            .open(&[TrackDescriptor::audio(8_000, 1)], Timestamp::zero())
            .unwrap();
        container
    }

    fn board(tracks: usize) -> Vec<Readiness> {
        (0..tracks).map(|_| Readiness::default()).collect()
    }

    fn sink(dir: &std::path::Path, tx: Sender<TrackCompletion>, depth: usize) -> TrackSink {
        TrackSink::new(MediaKind::Audio, 0, open_container(dir), tx, board(1), depth).unwrap()
    }

    #[test]
    fn test_start_requires_open_container() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let container = shared(TrackFile::new(dir.path().join("x.trk")));
        let sink = TrackSink::new(MediaKind::Audio, 0, container, tx, board(1), 4).unwrap();

        assert!(sink.start().is_err());
        assert_eq!(sink.state(), WriteState::Failed);
        sink.end_of_stream();
        drop(sink);
        // Start failures are reported synchronously only.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_append_before_start_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let sink = sink(dir.path(), tx, 4);
        assert!(!sink.append(audio_at(0.0)));
        assert_eq!(sink.stats(), TrackStats { appended: 0, dropped: 1 });
    }

    #[test]
    fn test_end_of_stream_signals_once_after_pending_samples() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let sink = sink(dir.path(), tx, 16);
        sink.start().unwrap();
        for i in 0..5 {
            assert!(sink.append(audio_at(i as f64 * 10.0)));
        }
        sink.end_of_stream();
        sink.end_of_stream();

        let done = rx.recv().unwrap();
        assert_eq!(done.result, Ok(()));
        assert_eq!(done.kind, MediaKind::Audio);
        assert_eq!(sink.stats().appended, 5);
        assert_eq!(sink.state(), WriteState::Finished);
        drop(sink);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_not_ready_drops_without_queueing() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let sink = sink(dir.path(), tx, 2);
        sink.start().unwrap();
        sink.readiness().set_ready(false);

        for i in 0..50 {
            assert!(!sink.append(audio_at(i as f64)));
        }
        assert_eq!(sink.stats(), TrackStats { appended: 0, dropped: 50 });
        assert_eq!(sink.queue.pending(), 0);
    }

    #[test]
    fn test_board_must_cover_the_track() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let container = open_container(dir.path());
        assert!(TrackSink::new(MediaKind::Audio, 1, container, tx, board(1), 2).is_err());
    }

    #[test]
    fn test_leading_track_waits_for_the_other_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let container = shared(TrackFile::new(dir.path().join("av.trk")));
        container
            .lock()
            .open(
                &[TrackDescriptor::video(2, 2, 30.0), TrackDescriptor::audio(8_000, 1)],
                Timestamp::zero(),
            )
            .unwrap();
        let flags = board(2);
        let video = TrackSink::new(
            MediaKind::Video,
            0,
            Arc::clone(&container),
            tx.clone(),
            flags.clone(),
            4,
        )
        .unwrap();
        let audio =
            TrackSink::new(MediaKind::Audio, 1, container, tx, flags.clone(), 4).unwrap();
        video.start().unwrap();
        audio.start().unwrap();

        assert!(audio.append(audio_at(0.0)));
        assert!(audio.append(audio_at(2_000.0)));
        audio.end_of_stream();

        // Audio is two seconds ahead of a video track that has written nothing.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(audio.state(), WriteState::Active);
        assert!(!flags[1].is_ready());
        assert!(!audio.append(audio_at(2_100.0)));

        video.end_of_stream();
        let mut done: Vec<MediaKind> = (0..2).map(|_| rx.recv().unwrap().kind).collect();
        done.sort_by_key(|k| k.label());
        assert_eq!(done, vec![MediaKind::Audio, MediaKind::Video]);
        assert_eq!(audio.state(), WriteState::Finished);
        assert_eq!(audio.stats(), TrackStats { appended: 2, dropped: 1 });
    }
}
