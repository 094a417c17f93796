//! Desktop types and data structures
//!
//! This module defines the geometry and frame types shared by the capture
//! side and the sinks.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Frames per second setting
pub type Fps = u8;

/// Valid FPS range constants
pub const MIN_FPS: Fps = 1;
pub const MAX_FPS: Fps = 60;
pub const DEFAULT_FPS: Fps = 10;

/// Default downscale factor applied before frames leave the producer
pub const DEFAULT_DOWNSCALE: f32 = 0.5;

/// Format used for the `datetime` telemetry column
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// One active display, in the capture API's convention (top-left origin)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitor {
    /// Display identifier
    pub id: u32,
    /// X position in virtual screen coordinates
    pub left: i32,
    /// Y position in virtual screen coordinates
    pub top: i32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Monitor {
    /// Creates a new monitor description
    pub fn new(id: u32, left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            id,
            left,
            top,
            width,
            height,
        }
    }

    /// Exclusive right edge
    pub fn right(&self) -> i32 {
        self.left + self.width as i32
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i32 {
        self.top + self.height as i32
    }
}

/// Combined capture surface enclosing every monitor (capture convention)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canvas {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    /// Union of all monitor rectangles, `None` for an empty set
    pub fn enclosing(monitors: &[Monitor]) -> Option<Self> {
        let first = monitors.first()?;
        let (mut left, mut top) = (first.left, first.top);
        let (mut right, mut bottom) = (first.right(), first.bottom());

        for monitor in &monitors[1..] {
            left = left.min(monitor.left);
            top = top.min(monitor.top);
            right = right.max(monitor.right());
            bottom = bottom.max(monitor.bottom());
        }

        Some(Self {
            left,
            top,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i32 {
        self.top + self.height as i32
    }

    /// Output size after applying the downscale factor (never zero)
    pub fn scaled_size(&self, factor: f32) -> (u32, u32) {
        let scale = |v: u32| ((v as f64 * factor as f64).floor() as u32).max(1);
        (scale(self.width), scale(self.height))
    }

    /// Position of a monitor relative to the canvas origin
    pub fn relative(&self, monitor: &Monitor) -> (i32, i32) {
        (monitor.left - self.left, monitor.top - self.top)
    }
}

/// One display as reported by the pointer-query API (bottom-left origin)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Bounding box of all displays in the pointer-query convention
///
/// This is a different space from [`Canvas`]; the two are only reconciled
/// by the resolver's image-space conversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl GlobalBounds {
    /// Union of all pointer-space display rectangles, `None` for an empty set
    pub fn enclosing(rects: &[PointerRect]) -> Option<Self> {
        if rects.is_empty() {
            return None;
        }

        let mut bounds = Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for rect in rects {
            bounds.min_x = bounds.min_x.min(rect.x);
            bounds.min_y = bounds.min_y.min(rect.y);
            bounds.max_x = bounds.max_x.max(rect.x + rect.width);
            bounds.max_y = bounds.max_y.max(rect.y + rect.height);
        }
        Some(bounds)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// A single captured instant, shared by a frame and its cursor sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTime {
    /// Wall clock time of the sample
    pub wall: DateTime<Local>,
    /// Offset from the start of the session
    pub since_start: Duration,
}

impl CaptureTime {
    pub fn new(wall: DateTime<Local>, since_start: Duration) -> Self {
        Self { wall, since_start }
    }

    /// Seconds since the unix epoch with microsecond precision
    pub fn unix_seconds(&self) -> f64 {
        self.wall.timestamp_micros() as f64 / 1_000_000.0
    }

    /// Human readable local time, e.g. `2024-05-01 13:45:12.123456`
    pub fn datetime_string(&self) -> String {
        self.wall.format(DATETIME_FORMAT).to_string()
    }

    /// Seconds since the start of the session
    pub fn session_seconds(&self) -> f64 {
        self.since_start.as_secs_f64()
    }

    /// Raster file name for a frame captured at this instant
    pub fn file_name(&self) -> String {
        format!("{:.6}.png", self.unix_seconds())
    }
}

/// A composed, downscaled frame ready for a sink
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Raw RGBA pixel data (4 bytes per pixel)
    pub data: Vec<u8>,
    /// Producer sequence number
    pub sequence: u64,
    /// Instant the frame was captured
    pub time: CaptureTime,
}

impl Frame {
    /// Creates a new frame
    pub fn new(width: u32, height: u32, data: Vec<u8>, sequence: u64, time: CaptureTime) -> Self {
        Self {
            width,
            height,
            data,
            sequence,
            time,
        }
    }

    /// Validates that the frame data matches the dimensions
    pub fn is_valid(&self) -> bool {
        let expected_size = (self.width as usize) * (self.height as usize) * 4;
        self.data.len() == expected_size
    }
}

/// Pointer position in image space (canvas-relative, top-left origin)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorSample {
    pub x: f64,
    pub y: f64,
    pub time: CaptureTime,
}

/// Unit of work handed from the producer to a sink
#[derive(Debug, Clone)]
pub struct FrameJob {
    pub frame: Frame,
    pub cursor: CursorSample,
}

/// Capture statistics, updated by the producer and read by the controller
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    tick_failures: AtomicU64,
    /// Moving average of the capture time, stored as f64 bits
    avg_capture_time_bits: AtomicU64,
}

impl CaptureStats {
    /// Records one completed tick
    pub fn record_tick(&self, capture_time: Duration, dropped: bool) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }

        let sample = capture_time.as_secs_f64() * 1000.0;
        let previous = f64::from_bits(self.avg_capture_time_bits.load(Ordering::Relaxed));
        let updated = if previous == 0.0 {
            sample
        } else {
            previous * 0.9 + sample * 0.1
        };
        self.avg_capture_time_bits
            .store(updated.to_bits(), Ordering::Relaxed);
    }

    /// Records a tick that failed before producing a frame
    pub fn record_failure(&self) {
        self.tick_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            tick_failures: self.tick_failures.load(Ordering::Relaxed),
            avg_capture_time_ms: f64::from_bits(
                self.avg_capture_time_bits.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Copy of [`CaptureStats`] at one point in time
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct CaptureStatsSnapshot {
    /// Ticks that produced a frame (accepted or dropped)
    pub frames_captured: u64,
    /// Frames rejected by the full channel
    pub frames_dropped: u64,
    /// Ticks that failed before producing a frame
    pub tick_failures: u64,
    /// Average capture time in milliseconds
    pub avg_capture_time_ms: f64,
}

impl CaptureStatsSnapshot {
    /// Frames that reached the channel
    pub fn frames_accepted(&self) -> u64 {
        self.frames_captured - self.frames_dropped
    }

    /// Returns the drop rate percentage
    pub fn drop_rate(&self) -> f64 {
        if self.frames_captured == 0 {
            return 0.0;
        }
        (self.frames_dropped as f64 / self.frames_captured as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn time_at(secs: i64, micros: u32) -> CaptureTime {
        let wall = Local.timestamp_opt(secs, micros * 1000).unwrap();
        CaptureTime::new(wall, Duration::from_millis(1500))
    }

    #[test]
    fn test_canvas_encloses_all_monitors() {
        let monitors = [
            Monitor::new(1, 0, 0, 1920, 1080),
            Monitor::new(2, -1280, -200, 1280, 1024),
            Monitor::new(3, 1920, 0, 2560, 1440),
        ];
        let canvas = Canvas::enclosing(&monitors).unwrap();
        assert_eq!(canvas.left, -1280);
        assert_eq!(canvas.top, -200);
        assert_eq!(canvas.width, 1280 + 1920 + 2560);
        assert_eq!(canvas.height, 1640);
        assert_eq!(canvas.relative(&monitors[0]), (1280, 200));
    }

    #[test]
    fn test_empty_geometry() {
        assert!(Canvas::enclosing(&[]).is_none());
        assert!(GlobalBounds::enclosing(&[]).is_none());
    }

    #[test]
    fn test_scaled_size() {
        let canvas = Canvas::enclosing(&[Monitor::new(0, 0, 0, 1921, 1080)]).unwrap();
        assert_eq!(canvas.scaled_size(0.5), (960, 540));
        assert_eq!(canvas.scaled_size(1.0), (1921, 1080));
        assert_eq!(canvas.scaled_size(0.0001), (1, 1));
    }

    #[test]
    fn test_capture_time_formatting() {
        let time = time_at(1_700_000_000, 123_456);
        assert_eq!(time.unix_seconds(), 1_700_000_000.123456);
        assert_eq!(time.file_name(), "1700000000.123456.png");
        assert_eq!(time.session_seconds(), 1.5);
        assert!(time.datetime_string().ends_with(".123456"));
    }

    #[test]
    fn test_frame_validation() {
        let time = time_at(0, 0);
        let frame = Frame::new(4, 2, vec![0u8; 32], 1, time);
        assert!(frame.is_valid());

        let invalid_frame = Frame::new(4, 2, vec![0u8; 5], 1, time);
        assert!(!invalid_frame.is_valid());
    }

    #[test]
    fn test_capture_stats() {
        let stats = CaptureStats::default();
        for i in 0..10 {
            stats.record_tick(Duration::from_millis(20), i == 0);
        }
        stats.record_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_captured, 10);
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.frames_accepted(), 9);
        assert_eq!(snapshot.tick_failures, 1);
        assert_eq!(snapshot.drop_rate(), 10.0);
        assert!((snapshot.avg_capture_time_ms - 20.0).abs() < 1e-9);
    }
}
