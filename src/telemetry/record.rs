//! Telemetry records and their log rows

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::desktop::types::{CaptureTime, Frame};

/// Where an accepted frame ended up
#[derive(Debug, Clone, PartialEq)]
pub enum FrameReference {
    /// Raster file written by the file sink
    File(PathBuf),
    /// Offset of the frame inside the encoded video
    VideoOffset(Duration),
}

/// Fate of the frame paired with a telemetry record
#[derive(Debug, Clone, PartialEq)]
pub enum FrameStatus {
    Stored(FrameReference),
    /// The channel rejected the frame; it never reached a sink
    Dropped,
}

impl FrameStatus {
    pub fn is_dropped(&self) -> bool {
        matches!(self, FrameStatus::Dropped)
    }
}

/// One producer tick: cursor position plus what happened to its frame
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub sequence: u64,
    pub time: CaptureTime,
    pub x: f64,
    pub y: f64,
    pub frame: FrameStatus,
}

/// How accepted frames are referenced from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceStyle {
    /// Path of the raster file inside `directory`
    Files { directory: PathBuf },
    /// Session-relative timestamp inside the video
    Video,
}

impl ReferenceStyle {
    /// Reference the sink will produce for `frame`
    pub fn reference_for(&self, frame: &Frame) -> FrameReference {
        match self {
            ReferenceStyle::Files { directory } => {
                FrameReference::File(frame_path(directory, &frame.time))
            }
            ReferenceStyle::Video => FrameReference::VideoOffset(frame.time.since_start),
        }
    }

    /// Matching log layout
    pub fn layout(&self) -> LogLayout {
        match self {
            ReferenceStyle::Files { .. } => LogLayout::Files,
            ReferenceStyle::Video => LogLayout::Video,
        }
    }
}

/// Path of the raster file for a frame captured at `time`
pub fn frame_path(directory: &Path, time: &CaptureTime) -> PathBuf {
    directory.join(time.file_name())
}

/// Column layout of the telemetry log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLayout {
    /// `timestamp,datetime,x,y,frame_reference`
    Files,
    /// `frame_number,timestamp,datetime,video_timestamp,x,y`
    Video,
}

impl LogLayout {
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            LogLayout::Files => &["timestamp", "datetime", "x", "y", "frame_reference"],
            LogLayout::Video => &[
                "frame_number",
                "timestamp",
                "datetime",
                "video_timestamp",
                "x",
                "y",
            ],
        }
    }
}

/// Row of the file-mode log; `frame_reference` is empty for dropped frames
#[derive(Debug, Serialize)]
pub(crate) struct FileRow {
    pub timestamp: f64,
    pub datetime: String,
    pub x: f64,
    pub y: f64,
    pub frame_reference: Option<String>,
}

/// Row of the video-mode log; `video_timestamp` is empty for dropped frames
#[derive(Debug, Serialize)]
pub(crate) struct VideoRow {
    pub frame_number: u64,
    pub timestamp: f64,
    pub datetime: String,
    pub video_timestamp: Option<f64>,
    pub x: f64,
    pub y: f64,
}

impl From<&TelemetryRecord> for FileRow {
    fn from(record: &TelemetryRecord) -> Self {
        let frame_reference = match &record.frame {
            FrameStatus::Stored(FrameReference::File(path)) => {
                Some(path.to_string_lossy().into_owned())
            }
            FrameStatus::Stored(FrameReference::VideoOffset(offset)) => {
                Some(format!("{:.6}", offset.as_secs_f64()))
            }
            FrameStatus::Dropped => None,
        };
        Self {
            timestamp: record.time.unix_seconds(),
            datetime: record.time.datetime_string(),
            x: record.x,
            y: record.y,
            frame_reference,
        }
    }
}

impl From<&TelemetryRecord> for VideoRow {
    fn from(record: &TelemetryRecord) -> Self {
        let video_timestamp = match &record.frame {
            FrameStatus::Stored(FrameReference::VideoOffset(offset)) => {
                Some(offset.as_secs_f64())
            }
            FrameStatus::Stored(FrameReference::File(_)) => Some(record.time.session_seconds()),
            FrameStatus::Dropped => None,
        };
        Self {
            frame_number: record.sequence,
            timestamp: record.time.unix_seconds(),
            datetime: record.time.datetime_string(),
            video_timestamp,
            x: record.x,
            y: record.y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(frame: FrameStatus) -> TelemetryRecord {
        let wall = chrono::Local.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        TelemetryRecord {
            sequence: 42,
            time: CaptureTime::new(wall, Duration::from_millis(4200)),
            x: 10.5,
            y: 20.0,
            frame,
        }
    }

    #[test]
    fn test_reference_style() {
        let wall = chrono::Local.timestamp_opt(1_700_000_000, 0).unwrap();
        let time = CaptureTime::new(wall, Duration::from_secs(3));
        let frame = Frame::new(1, 1, vec![0; 4], 0, time);

        let files = ReferenceStyle::Files {
            directory: PathBuf::from("out"),
        };
        assert_eq!(
            files.reference_for(&frame),
            FrameReference::File(PathBuf::from("out").join("1700000000.000000.png"))
        );
        assert_eq!(
            ReferenceStyle::Video.reference_for(&frame),
            FrameReference::VideoOffset(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_dropped_rows_have_empty_reference() {
        let dropped = record(FrameStatus::Dropped);
        assert!(FileRow::from(&dropped).frame_reference.is_none());

        let video = VideoRow::from(&dropped);
        assert_eq!(video.frame_number, 42);
        assert!(video.video_timestamp.is_none());
    }

    #[test]
    fn test_stored_rows() {
        let stored = record(FrameStatus::Stored(FrameReference::VideoOffset(
            Duration::from_millis(4200),
        )));
        let row = VideoRow::from(&stored);
        assert_eq!(row.video_timestamp, Some(4.2));
        assert_eq!(row.timestamp, 1_700_000_000.25);
    }
}
