//! Row-oriented CSV outputs: per-frame face landmarks and per-recording info.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use depthcam_core::{DepthcamError, DepthcamResult, Point3, ProcessorSettings, Rect};

fn create(path: &Path) -> DepthcamResult<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)
        .map_err(|e| DepthcamError::container(format!("failed to create CSV: {}", e), path))?;
    Ok(BufWriter::new(file))
}

/// Quote a free-text field if it contains a separator, a quote or a line
/// break. Embedded quotes are doubled.
pub fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Header row for `landmark_count` landmarks. Every field ends with a comma.
pub fn landmarks_header(landmark_count: usize) -> String {
    let mut header = String::from("Frame,Timestamp(s),BBox_x,BBox_y,BBox_width,BBox_height,");
    for i in 0..landmark_count {
        header.push_str(&format!(
            "landmark_{i}_x,landmark_{i}_y,landmark_{i}_z,"
        ));
    }
    header
}

/// One row per processed frame: index, timestamp, bounding box, then
/// `x,y,z` for every landmark.
pub struct LandmarksFileWriter {
    path: PathBuf,
    out: BufWriter<File>,
    landmark_count: usize,
    rows: u64,
}

impl LandmarksFileWriter {
    /// Create the file and write the header.
    pub fn create(path: impl Into<PathBuf>, landmark_count: usize) -> DepthcamResult<Self> {
        let path = path.into();
        let mut out = create(&path)?;
        writeln!(out, "{}", landmarks_header(landmark_count))?;
        Ok(Self {
            path,
            out,
            landmark_count,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append a row. Missing landmarks are zero-filled and extras ignored, so
    /// every row has the same number of columns.
    pub fn write_row(
        &mut self,
        timestamp_seconds: f64,
        bounding_box: Rect,
        landmarks: &[Point3],
    ) -> DepthcamResult<()> {
        let mut row = format!(
            "{},{:.5},{},{},{},{},",
            self.rows,
            timestamp_seconds,
            bounding_box.x,
            bounding_box.y,
            bounding_box.width,
            bounding_box.height
        );
        let zero = Point3::zero();
        for i in 0..self.landmark_count {
            let p = landmarks.get(i).unwrap_or(&zero);
            row.push_str(&format!("{},{},{},", p.x, p.y, p.z));
        }
        writeln!(self.out, "{}", row)?;
        self.rows += 1;
        Ok(())
    }

    /// Flush buffered rows to disk.
    pub fn finish(mut self) -> DepthcamResult<u64> {
        self.out.flush()?;
        tracing::debug!("wrote {} rows to {}", self.rows, self.path.display());
        Ok(self.rows)
    }
}

pub const INFO_COLUMNS: [&str; 9] = [
    "Subject_ID",
    "Task",
    "Start_Time",
    "Number_of_Landmarks",
    "Video_Width",
    "Video_Height",
    "DepthMap_Width",
    "DepthMap_Height",
    "Total_Frames",
];

/// Per-recording summary. Resolutions are reported in portrait orientation.
pub struct InfoFileWriter {
    path: PathBuf,
    out: BufWriter<File>,
    subject_id: String,
    task: String,
}

impl InfoFileWriter {
    pub fn create(
        path: impl Into<PathBuf>,
        subject_id: impl Into<String>,
        task: impl Into<String>,
    ) -> DepthcamResult<Self> {
        let path = path.into();
        let mut out = create(&path)?;
        writeln!(out, "{}", INFO_COLUMNS.join(","))?;
        Ok(Self {
            path,
            out,
            subject_id: subject_id.into(),
            task: task.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the single info row and flush.
    pub fn write_info(
        mut self,
        settings: &ProcessorSettings,
        start_time: &str,
        total_frames: u64,
    ) -> DepthcamResult<()> {
        let (video, depth) = settings.portrait_resolutions();
        writeln!(
            self.out,
            "{},{},{},{},{},{},{},{},{},",
            csv_field(&self.subject_id),
            csv_field(&self.task),
            csv_field(start_time),
            settings.landmark_count,
            video.width,
            video.height,
            depth.width,
            depth.height,
            total_frames
        )?;
        self.out.flush()?;
        Ok(())
    }
}
