//! Native `.trk` container.
//!
//! Layout:
//!
//! ```text
//! "DCTRK1"
//! u32 LE length + MessagePack FileHeader { origin, tracks }
//! repeated:
//!   u32 LE length + MessagePack RecordHeader { track, timestamp, payload_len }
//!   payload_len raw bytes (BGRA pixels or f32 LE PCM)
//! ```
//!
//! While writing, data goes to `<path>.partial`; `finish` renames it into place.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use depthcam_core::{DepthcamError, DepthcamResult, Timestamp};

use crate::container::{interleave_ready, Container, ContainerStatus};
use crate::sample::{Sample, TrackDescriptor};

pub const TRACK_FILE_MAGIC: &[u8; 6] = b"DCTRK1";

const MAX_HEADER_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileHeader {
    origin: Timestamp,
    tracks: Vec<TrackDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordHeader {
    track: u32,
    timestamp: Timestamp,
    payload_len: u64,
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn write_frame<W: Write, T: Serialize>(out: &mut W, value: &T) -> DepthcamResult<()> {
    let bytes = rmp_serde::to_vec_named(value)?;
    out.write_all(&(bytes.len() as u32).to_le_bytes())?;
    out.write_all(&bytes)?;
    Ok(())
}

/// Writes tracks into a single `.trk` file.
pub struct TrackFile {
    path: PathBuf,
    partial: PathBuf,
    out: Option<BufWriter<File>>,
    tracks: Vec<TrackDescriptor>,
    origin: Timestamp,
    last_timestamps: Vec<Option<Timestamp>>,
    ended: Vec<bool>,
    status: ContainerStatus,
    records: u64,
}

impl TrackFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            partial: partial_path(&path),
            path,
            out: None,
            tracks: Vec::new(),
            origin: Timestamp::zero(),
            last_timestamps: Vec::new(),
            ended: Vec::new(),
            status: ContainerStatus::Idle,
            records: 0,
        }
    }

    /// Where data lives until `finish`.
    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    fn write_record(&mut self, track: usize, sample: &Sample) -> DepthcamResult<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| DepthcamError::container("track file is not open", &self.path))?;
        let header = RecordHeader {
            track: track as u32,
            timestamp: sample.timestamp(),
            payload_len: sample.payload_len() as u64,
        };
        write_frame(out, &header)?;
        sample.write_payload(out)?;
        Ok(())
    }
}

impl Container for TrackFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> ContainerStatus {
        self.status
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
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&self.partial).map_err(|e| {
            DepthcamError::container(format!("failed to create file: {}", e), &self.partial)
        })?;
        let mut out = BufWriter::new(file);
        out.write_all(TRACK_FILE_MAGIC)?;
        write_frame(
            &mut out,
            &FileHeader {
                origin,
                tracks: tracks.to_vec(),
            },
        )?;

        self.out = Some(out);
        self.tracks = tracks.to_vec();
        self.origin = origin;
        self.last_timestamps = vec![None; tracks.len()];
        self.ended = vec![false; tracks.len()];
        self.status = ContainerStatus::Writing;
        tracing::debug!(
            "opened {} with {} tracks",
            self.partial.display(),
            tracks.len()
        );
        Ok(())
    }

    fn append(&mut self, track: usize, sample: &Sample) -> DepthcamResult<()> {
        if self.status != ContainerStatus::Writing {
            return Err(DepthcamError::container(
                format!("append while {:?}", self.status),
                &self.path,
            ));
        }
        let descriptor = self.tracks.get(track).ok_or_else(|| {
            DepthcamError::InvalidArgument(format!("no track {} in container", track))
        })?;
        if !descriptor.accepts(sample) {
            return Err(DepthcamError::InvalidArgument(format!(
                "sample does not match {} track format",
                descriptor.kind
            )));
        }
        let timestamp = sample.timestamp();
        if let Some(last) = self.last_timestamps[track] {
            if timestamp < last {
                return Err(DepthcamError::InvalidArgument(format!(
                    "{} sample at {} precedes previous sample at {}",
                    descriptor.kind, timestamp, last
                )));
            }
        }

        // A failed write leaves a torn record behind, so the file is unusable.
        if let Err(e) = self.write_record(track, sample) {
            self.status = ContainerStatus::Failed;
            return Err(e);
        }
        self.last_timestamps[track] = Some(timestamp);
        self.records += 1;
        Ok(())
    }

    fn finish(&mut self) -> DepthcamResult<()> {
        if self.status != ContainerStatus::Writing {
            return Err(DepthcamError::container(
                format!("cannot finish a container in state {:?}", self.status),
                &self.path,
            ));
        }
        let result = self.out.take().map_or(Ok(()), |out| {
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&self.partial, &self.path)?;
            Ok::<(), DepthcamError>(())
        });
        match result {
            Ok(()) => {
                self.status = ContainerStatus::Completed;
                tracing::info!(
                    "wrote {} records to {}",
                    self.records,
                    self.path.display()
                );
                Ok(())
            }
            Err(e) => {
                self.status = ContainerStatus::Failed;
                self.cancel();
                Err(e)
            }
        }
    }

    fn cancel(&mut self) {
        if self.status == ContainerStatus::Completed {
            return;
        }
        self.out = None;
        match fs::remove_file(&self.partial) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("failed to remove {}: {}", self.partial.display(), e),
        }
        self.status = ContainerStatus::Cancelled;
        tracing::info!("cancelled {}", self.path.display());
    }

    fn is_ready(&self, track: usize) -> bool {
        if self.status != ContainerStatus::Writing {
            return true;
        }
        let progress: Vec<Option<Timestamp>> = self
            .last_timestamps
            .iter()
            .zip(&self.ended)
            .map(|(last, &ended)| (!ended).then(|| last.unwrap_or(self.origin)))
            .collect();
        interleave_ready(&progress, track)
    }

    fn end_track(&mut self, track: usize) {
        if let Some(ended) = self.ended.get_mut(track) {
            *ended = true;
        }
    }
}

impl Drop for TrackFile {
    fn drop(&mut self) {
        if self.status == ContainerStatus::Writing {
            tracing::warn!(
                "{} dropped while writing, discarding partial data",
                self.path.display()
            );
            self.cancel();
        }
    }
}

/// One record read back from a `.trk` file.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub track: usize,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

impl TrackRecord {
    /// Decode an audio payload into f32 samples.
    pub fn audio_samples(&self) -> Vec<f32> {
        self.payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Per-track totals of a `.trk` file.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSummary {
    pub descriptor: TrackDescriptor,
    pub records: u64,
    pub bytes: u64,
    pub first: Option<Timestamp>,
    pub last: Option<Timestamp>,
}

/// Sequential reader for `.trk` files.
pub struct TrackFileReader<R: Read = BufReader<File>> {
    input: R,
    origin: Timestamp,
    tracks: Vec<TrackDescriptor>,
}

impl TrackFileReader {
    pub fn open(path: impl AsRef<Path>) -> DepthcamResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            DepthcamError::container(format!("failed to open track file: {}", e), path)
        })?;
        Self::from_reader(BufReader::new(file))
    }

    /// Read a whole file and total it per track.
    pub fn summarize(path: impl AsRef<Path>) -> DepthcamResult<Vec<TrackSummary>> {
        let mut reader = Self::open(path)?;
        let mut summary: Vec<TrackSummary> = reader
            .tracks()
            .iter()
            .map(|&descriptor| TrackSummary {
                descriptor,
                records: 0,
                bytes: 0,
                first: None,
                last: None,
            })
            .collect();
        while let Some(record) = reader.next_record()? {
            let entry = &mut summary[record.track];
            entry.records += 1;
            entry.bytes += record.payload.len() as u64;
            entry.first.get_or_insert(record.timestamp);
            entry.last = Some(record.timestamp);
        }
        Ok(summary)
    }
}

impl<R: Read> TrackFileReader<R> {
    pub fn from_reader(mut input: R) -> DepthcamResult<Self> {
        let mut magic = [0u8; 6];
        input.read_exact(&mut magic)?;
        if &magic != TRACK_FILE_MAGIC {
            return Err(DepthcamError::Encode("not a depthcam track file".into()));
        }
        let header: FileHeader = match read_frame(&mut input)? {
            Some(h) => h,
            None => return Err(DepthcamError::Encode("track file has no header".into())),
        };
        Ok(Self {
            input,
            origin: header.origin,
            tracks: header.tracks,
        })
    }

    pub fn origin(&self) -> Timestamp {
        self.origin
    }

    pub fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    /// The next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> DepthcamResult<Option<TrackRecord>> {
        let Some(header) = read_frame::<_, RecordHeader>(&mut self.input)? else {
            return Ok(None);
        };
        let track = header.track as usize;
        if track >= self.tracks.len() {
            return Err(DepthcamError::Encode(format!(
                "record references unknown track {}",
                track
            )));
        }
        let limit = self.tracks[track].max_payload_len();
        if header.payload_len > limit {
            return Err(DepthcamError::Encode(format!(
                "record of {} bytes exceeds the {} byte limit of track {}",
                header.payload_len, limit, track
            )));
        }
        let mut payload = Vec::with_capacity(header.payload_len as usize);
        (&mut self.input)
            .take(header.payload_len)
            .read_to_end(&mut payload)?;
        if payload.len() as u64 != header.payload_len {
            return Err(DepthcamError::Encode("truncated record payload".into()));
        }
        Ok(Some(TrackRecord {
            track,
            timestamp: header.timestamp,
            payload,
        }))
    }
}

impl<R: Read> Iterator for TrackFileReader<R> {
    type Item = DepthcamResult<TrackRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Read one length-prefixed MessagePack value. `None` on EOF before the prefix.
fn read_frame<R: Read, T: serde::de::DeserializeOwned>(input: &mut R) -> DepthcamResult<Option<T>> {
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < len.len() {
        match input.read(&mut len[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(DepthcamError::Encode("truncated record length".into()));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_HEADER_LEN {
        return Err(DepthcamError::Encode(format!(
            "record header of {} bytes is implausibly large",
            len
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    input.read_exact(&mut bytes)?;
    Ok(Some(rmp_serde::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcam_core::{AudioBuffer, FormatDescription, ImageBuffer, PixelFormat, PooledFrame};

    fn frame(ms: f64, fill: u8) -> Sample {
        let mut image = ImageBuffer::new(FormatDescription::new(PixelFormat::Bgra8, 2, 2))
            .with_timestamp(Timestamp::from_millis(ms));
        image.data.fill(fill);
        Sample::Image(PooledFrame::detached(image))
    }

    fn tracks() -> Vec<TrackDescriptor> {
        vec![
            TrackDescriptor::video(2, 2, 30.0),
            TrackDescriptor::audio(8_000, 1),
        ]
    }

    #[test]
    fn test_finish_renames_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.trk");
        let mut file = TrackFile::new(&path);
        file.open(&tracks(), Timestamp::from_seconds(12.0)).unwrap();
        assert!(file.partial_path().exists());
        assert!(!path.exists());

        file.append(0, &frame(0.0, 7)).unwrap();
        file.append(
            1,
            &Sample::Audio(AudioBuffer::new(
                8_000,
                1,
                Timestamp::zero(),
                vec![0.25; 4],
            )),
        )
        .unwrap();
        file.finish().unwrap();

        assert_eq!(file.status(), ContainerStatus::Completed);
        assert!(path.exists());
        assert!(!file.partial_path().exists());

        let mut reader = TrackFileReader::open(&path).unwrap();
        assert_eq!(reader.origin(), Timestamp::from_seconds(12.0));
        assert_eq!(reader.tracks(), tracks().as_slice());
        let video = reader.next_record().unwrap().unwrap();
        assert_eq!(video.track, 0);
        assert_eq!(video.payload, vec![7u8; 16]);
        let audio = reader.next_record().unwrap().unwrap();
        assert_eq!(audio.audio_samples(), vec![0.25; 4]);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_cancel_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.trk");
        let mut file = TrackFile::new(&path);
        file.open(&tracks(), Timestamp::zero()).unwrap();
        file.append(0, &frame(0.0, 1)).unwrap();
        file.cancel();

        assert_eq!(file.status(), ContainerStatus::Cancelled);
        assert!(!path.exists());
        assert!(!file.partial_path().exists());
    }

    #[test]
    fn test_rejects_mismatched_and_out_of_order_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = TrackFile::new(dir.path().join("take.trk"));
        file.open(&tracks(), Timestamp::zero()).unwrap();

        assert!(file.append(1, &frame(0.0, 0)).is_err());
        assert!(file.append(5, &frame(0.0, 0)).is_err());
        file.append(0, &frame(66.0, 0)).unwrap();
        assert!(file.append(0, &frame(33.0, 0)).is_err());
        // Rejected samples do not poison the file.
        assert_eq!(file.status(), ContainerStatus::Writing);
        assert_eq!(file.records_written(), 1);
    }

    #[test]
    fn test_interleaving_holds_back_the_leading_track() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = TrackFile::new(dir.path().join("take.trk"));
        file.open(&tracks(), Timestamp::from_seconds(100.0)).unwrap();
        assert!(file.is_ready(0) && file.is_ready(1));

        file.append(0, &frame(100_900.0, 0)).unwrap();
        assert!(file.is_ready(0));
        file.append(0, &frame(101_500.0, 0)).unwrap();
        assert!(!file.is_ready(0));
        assert!(file.is_ready(1));

        // Audio that never arrives stops holding video back once it ends.
        file.end_track(1);
        assert!(file.is_ready(0));
    }

    #[test]
    fn test_open_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = TrackFile::new(dir.path().join("take.trk"));
        file.open(&tracks(), Timestamp::zero()).unwrap();
        assert!(file.open(&tracks(), Timestamp::zero()).is_err());
    }

    #[test]
    fn test_drop_while_writing_discards_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.trk");
        let partial = {
            let mut file = TrackFile::new(&path);
            file.open(&tracks(), Timestamp::zero()).unwrap();
            file.partial_path().to_path_buf()
        };
        assert!(!partial.exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_summarize_counts_per_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.trk");
        let mut file = TrackFile::new(&path);
        file.open(&tracks(), Timestamp::zero()).unwrap();
        for i in 0..3 {
            file.append(0, &frame(i as f64 * 33.0, 0)).unwrap();
        }
        file.finish().unwrap();

        let summary = TrackFileReader::summarize(&path).unwrap();
        assert_eq!(summary[0].records, 3);
        assert_eq!(summary[0].bytes, 48);
        assert_eq!(summary[0].last, Some(Timestamp::from_millis(66.0)));
        assert_eq!(summary[1].records, 0);
        assert_eq!(summary[1].first, None);
    }

    #[test]
    fn test_reader_rejects_foreign_files() {
        let bytes = b"RIFF....WAVEfmt ".to_vec();
        assert!(TrackFileReader::from_reader(bytes.as_slice()).is_err());
    }

    fn finished_file(dir: &Path) -> Vec<u8> {
        let path = dir.join("take.trk");
        let mut file = TrackFile::new(&path);
        file.open(&tracks(), Timestamp::zero()).unwrap();
        file.append(0, &frame(0.0, 3)).unwrap();
        file.finish().unwrap();
        fs::read(&path).unwrap()
    }

    #[test]
    fn test_reader_rejects_oversized_payload_len() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = finished_file(dir.path());
        let header = RecordHeader {
            track: 1,
            timestamp: Timestamp::zero(),
            payload_len: u64::MAX,
        };
        write_frame(&mut bytes, &header).unwrap();
        let path = dir.path().join("forged.trk");
        fs::write(&path, &bytes).unwrap();

        match TrackFileReader::summarize(&path) {
            Err(DepthcamError::Encode(message)) => assert!(message.contains("exceeds")),
            other => panic!("expected an encode error, got {:?}", other),
        }
    }

    #[test]
    fn test_reader_rejects_truncated_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = finished_file(dir.path());
        bytes.truncate(bytes.len() - 5);

        let mut reader = TrackFileReader::from_reader(bytes.as_slice()).unwrap();
        match reader.next_record() {
            Err(DepthcamError::Encode(message)) => assert!(message.contains("truncated")),
            other => panic!("expected an encode error, got {:?}", other),
        }
    }
}
