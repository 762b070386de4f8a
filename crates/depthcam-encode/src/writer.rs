//! Synchronized multi-track writer.
//!
//! Binds one to three [`TrackSink`]s to a single container. After
//! [`SynchronizedWriter::end_recording`], a barrier thread waits for every
//! sink's completion signal and then either finalizes or cancels the
//! container, so a partially written file is never left in place. A writer
//! dropped before `end_recording` cancels its container instead.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use depthcam_core::{AudioBuffer, DepthcamError, DepthcamResult, PooledFrame, Timestamp};

use crate::container::SharedContainer;
use crate::sample::{MediaKind, Sample, TrackDescriptor};
use crate::track::{Readiness, TrackCompletion, TrackSink, TrackStats};

/// Lifecycle notifications published by a writer.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterEvent {
    Active,
    Completed,
    Failed(String),
}

/// Final result of a recording.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterOutcome {
    Completed,
    Failed(String),
}

impl WriterOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WriterOutcome::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Active,
    Ending,
}

/// Single-assignment slot for the outcome.
#[derive(Default)]
struct OutcomeSlot {
    value: Mutex<Option<WriterOutcome>>,
    ready: Condvar,
}

impl OutcomeSlot {
    /// Returns `false` if an outcome was already published.
    fn publish(&self, outcome: WriterOutcome) -> bool {
        let mut value = self.value.lock();
        if value.is_some() {
            return false;
        }
        *value = Some(outcome);
        self.ready.notify_all();
        true
    }

    fn get(&self) -> Option<WriterOutcome> {
        self.value.lock().clone()
    }

    fn wait(&self) -> WriterOutcome {
        let mut value = self.value.lock();
        loop {
            if let Some(outcome) = value.as_ref() {
                return outcome.clone();
            }
            self.ready.wait(&mut value);
        }
    }
}

fn publish(slot: &OutcomeSlot, events: &Sender<WriterEvent>, outcome: WriterOutcome) {
    let event = match &outcome {
        WriterOutcome::Completed => WriterEvent::Completed,
        WriterOutcome::Failed(reason) => WriterEvent::Failed(reason.clone()),
    };
    if slot.publish(outcome) {
        let _ = events.send(event);
    }
}

/// Drives several track sinks into one container with a shared lifecycle.
pub struct SynchronizedWriter {
    container: SharedContainer,
    tracks: Vec<TrackDescriptor>,
    sinks: Vec<TrackSink>,
    completions: Option<Receiver<TrackCompletion>>,
    phase: Mutex<Phase>,
    outcome: Arc<OutcomeSlot>,
    events_tx: Sender<WriterEvent>,
    events_rx: Receiver<WriterEvent>,
    barrier: Option<JoinHandle<()>>,
}

impl SynchronizedWriter {
    /// Bind `tracks` (1 to 3, distinct kinds) to `container`.
    pub fn new(
        container: SharedContainer,
        tracks: Vec<TrackDescriptor>,
        queue_depth: usize,
    ) -> DepthcamResult<Self> {
        if tracks.is_empty() || tracks.len() > 3 {
            return Err(DepthcamError::InvalidArgument(format!(
                "a writer binds 1 to 3 tracks, got {}",
                tracks.len()
            )));
        }
        for (i, t) in tracks.iter().enumerate() {
            if tracks[..i].iter().any(|other| other.kind == t.kind) {
                return Err(DepthcamError::InvalidArgument(format!(
                    "duplicate {} track",
                    t.kind
                )));
            }
        }

        let (completion_tx, completion_rx) = unbounded();
        let board: Vec<Readiness> = tracks.iter().map(|_| Readiness::default()).collect();
        let sinks = tracks
            .iter()
            .enumerate()
            .map(|(index, t)| {
                TrackSink::new(
                    t.kind,
                    index,
                    Arc::clone(&container),
                    completion_tx.clone(),
                    board.clone(),
                    queue_depth,
                )
            })
            .collect::<DepthcamResult<Vec<_>>>()?;
        // Only sinks hold senders, so a vanished sink disconnects the barrier.
        drop(completion_tx);

        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            container,
            tracks,
            sinks,
            completions: Some(completion_rx),
            phase: Mutex::new(Phase::Idle),
            outcome: Arc::new(OutcomeSlot::default()),
            events_tx,
            events_rx,
            barrier: None,
        })
    }

    /// Video plus audio in one container.
    pub fn video_audio(
        container: SharedContainer,
        video: TrackDescriptor,
        audio: TrackDescriptor,
        queue_depth: usize,
    ) -> DepthcamResult<Self> {
        expect_kind(&video, MediaKind::Video)?;
        expect_kind(&audio, MediaKind::Audio)?;
        Self::new(container, vec![video, audio], queue_depth)
    }

    /// Gray-encoded depth as the only track.
    pub fn depth_only(
        container: SharedContainer,
        depth: TrackDescriptor,
        queue_depth: usize,
    ) -> DepthcamResult<Self> {
        expect_kind(&depth, MediaKind::Depth)?;
        Self::new(container, vec![depth], queue_depth)
    }

    /// Audio as the only track.
    pub fn audio_only(
        container: SharedContainer,
        audio: TrackDescriptor,
        queue_depth: usize,
    ) -> DepthcamResult<Self> {
        expect_kind(&audio, MediaKind::Audio)?;
        Self::new(container, vec![audio], queue_depth)
    }

    pub fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    pub fn is_active(&self) -> bool {
        *self.phase.lock() == Phase::Active
    }

    /// Receiver for lifecycle events. Receivers share one queue, so each
    /// event is delivered to only one of them.
    pub fn events(&self) -> Receiver<WriterEvent> {
        self.events_rx.clone()
    }

    fn sink(&self, kind: MediaKind) -> Option<&TrackSink> {
        self.sinks.iter().find(|s| s.kind() == kind)
    }

    /// Readiness flag of the track of `kind`, if bound.
    pub fn readiness(&self, kind: MediaKind) -> Option<Readiness> {
        self.sink(kind).map(TrackSink::readiness)
    }

    pub fn stats(&self, kind: MediaKind) -> Option<TrackStats> {
        self.sink(kind).map(TrackSink::stats)
    }

    fn fail_start(&self, error: &DepthcamError) {
        for sink in &self.sinks {
            sink.abort();
        }
        publish(
            &self.outcome,
            &self.events_tx,
            WriterOutcome::Failed(error.to_string()),
        );
    }

    /// Open the container and start every sink at `origin`.
    pub fn start(&mut self, origin: Timestamp) -> DepthcamResult<()> {
        {
            let phase = self.phase.lock();
            if *phase != Phase::Idle || self.outcome.get().is_some() {
                return Err(DepthcamError::InvalidState(
                    "writer was already started".into(),
                ));
            }
        }

        let opened = self.container.lock().open(&self.tracks, origin);
        if let Err(e) = opened {
            tracing::error!("failed to open container: {}", e);
            self.fail_start(&e);
            return Err(e);
        }
        for sink in &self.sinks {
            if let Err(e) = sink.start() {
                self.container.lock().cancel();
                self.fail_start(&e);
                return Err(e);
            }
        }

        let Some(completions) = self.completions.take() else {
            return Err(DepthcamError::InvalidState("completion channel missing".into()));
        };
        let expected = self.sinks.len();
        let container = Arc::clone(&self.container);
        let outcome = Arc::clone(&self.outcome);
        let events = self.events_tx.clone();
        let barrier = std::thread::Builder::new()
            .name("depthcam-writer-barrier".into())
            .spawn(move || {
                let result = await_completions(&completions, expected);
                let final_outcome = finalize(&container, result);
                publish(&outcome, &events, final_outcome);
            })?;
        self.barrier = Some(barrier);

        *self.phase.lock() = Phase::Active;
        let _ = self.events_tx.send(WriterEvent::Active);
        tracing::info!(
            "recording {} tracks to {}",
            self.tracks.len(),
            self.container.lock().path().display()
        );
        Ok(())
    }

    fn write(&self, kind: MediaKind, sample: Sample) -> bool {
        if !self.is_active() {
            tracing::debug!("writer is not active, dropping {} sample", kind);
            return false;
        }
        match self.sink(kind) {
            Some(sink) => sink.append(sample),
            None => {
                tracing::debug!("no {} track bound, dropping sample", kind);
                false
            }
        }
    }

    /// Returns `false` if the frame was dropped.
    pub fn write_video(&self, frame: PooledFrame) -> bool {
        self.write(MediaKind::Video, Sample::Image(frame))
    }

    pub fn write_audio(&self, audio: AudioBuffer) -> bool {
        self.write(MediaKind::Audio, Sample::Audio(audio))
    }

    /// Depth must already be gray-encoded into a BGRA frame.
    pub fn write_depth(&self, frame: PooledFrame) -> bool {
        self.write(MediaKind::Depth, Sample::Image(frame))
    }

    /// End every track. Safe to call more than once; only the first call acts.
    pub fn end_recording(&self) {
        let previous = {
            let mut phase = self.phase.lock();
            std::mem::replace(&mut *phase, Phase::Ending)
        };
        match previous {
            Phase::Active => {
                tracing::debug!("ending {} tracks", self.sinks.len());
                for sink in &self.sinks {
                    sink.end_of_stream();
                }
            }
            Phase::Idle => {
                if self.outcome.get().is_none() {
                    self.container.lock().cancel();
                    for sink in &self.sinks {
                        sink.abort();
                    }
                    publish(
                        &self.outcome,
                        &self.events_tx,
                        WriterOutcome::Failed("recording ended before it started".into()),
                    );
                }
            }
            Phase::Ending => {}
        }
    }

    /// Cancel the container without finalizing it. Does nothing once
    /// `end_recording` has run.
    fn abandon(&self, reason: &str) {
        let previous = {
            let mut phase = self.phase.lock();
            std::mem::replace(&mut *phase, Phase::Ending)
        };
        if previous == Phase::Ending || self.outcome.get().is_some() {
            return;
        }
        tracing::warn!(
            "{}, discarding {}",
            reason,
            self.container.lock().path().display()
        );
        publish(
            &self.outcome,
            &self.events_tx,
            WriterOutcome::Failed(reason.to_string()),
        );
        self.container.lock().cancel();
        for sink in &self.sinks {
            match previous {
                // Let the workers drain; the barrier finds the container closed.
                Phase::Active => sink.end_of_stream(),
                _ => sink.abort(),
            }
        }
    }

    /// The outcome, if the barrier has resolved.
    pub fn outcome(&self) -> Option<WriterOutcome> {
        self.outcome.get()
    }

    /// Block until the barrier resolves.
    pub fn wait(&self) -> WriterOutcome {
        self.outcome.wait()
    }
}

impl Drop for SynchronizedWriter {
    fn drop(&mut self) {
        self.abandon("writer dropped before the recording ended");
        // Sinks drain and join their workers as they drop.
        self.sinks.clear();
        if let Some(barrier) = self.barrier.take() {
            if barrier.join().is_err() {
                tracing::error!("writer barrier thread panicked");
            }
        }
    }
}

fn expect_kind(track: &TrackDescriptor, kind: MediaKind) -> DepthcamResult<()> {
    if track.kind != kind {
        return Err(DepthcamError::InvalidArgument(format!(
            "expected a {} track, got {}",
            kind, track.kind
        )));
    }
    Ok(())
}

/// Count down `expected` completions. The first failure is kept; a
/// disconnected channel means some sink vanished without a signal.
fn await_completions(
    completions: &Receiver<TrackCompletion>,
    expected: usize,
) -> Result<(), String> {
    let mut failure: Option<String> = None;
    for remaining in (0..expected).rev() {
        match completions.recv() {
            Ok(done) => {
                tracing::debug!(
                    "{} track completed ({} remaining): {:?}",
                    done.kind,
                    remaining,
                    done.result
                );
                if let Err(reason) = done.result {
                    failure.get_or_insert(reason);
                }
            }
            Err(_) => {
                failure.get_or_insert_with(|| "a track ended without a completion signal".into());
                break;
            }
        }
    }
    match failure {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}

fn finalize(container: &SharedContainer, result: Result<(), String>) -> WriterOutcome {
    let mut container = container.lock();
    if container.status().is_terminal() {
        tracing::debug!("{} was closed before its tracks completed", container.path().display());
        return WriterOutcome::Failed("container closed before the tracks completed".into());
    }
    match result {
        Ok(()) => match container.finish() {
            Ok(()) => {
                tracing::info!("recording finalized at {}", container.path().display());
                WriterOutcome::Completed
            }
            Err(e) => {
                tracing::error!("failed to finalize {}: {}", container.path().display(), e);
                container.cancel();
                WriterOutcome::Failed(e.to_string())
            }
        },
        Err(reason) => {
            tracing::warn!(
                "cancelling {} after track failure: {}",
                container.path().display(),
                reason
            );
            container.cancel();
            WriterOutcome::Failed(reason)
        }
    }
}
