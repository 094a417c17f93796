//! Integration tests for video-mode recordings
//!
//! An in-memory encoder stands in for ffmpeg so the tests can observe what
//! the encoder receives and inject failures.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cursor_recorder::config::Config;
use cursor_recorder::desktop::SyntheticSession;
use cursor_recorder::error::{EncoderError, EncoderResult};
use cursor_recorder::sink::encoder::{EncoderFactory, EncoderSpec, KillSwitch, VideoEncoder};
use cursor_recorder::sink::SinkMode;
use cursor_recorder::{Recorder, RecorderError};
use parking_lot::Mutex;
use tempfile::TempDir;

/// What the encoder does with the frame at a given position
#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    Accept,
    FailAt(usize),
    PanicAt(usize),
    /// Blocks inside `write` until released; a killable block ends with
    /// a broken pipe once the kill switch fires
    BlockAt { at: usize, killable: bool },
}

#[derive(Default)]
struct Captured {
    spec: Option<EncoderSpec>,
    frame_sizes: Vec<usize>,
    /// Blue channel of each frame's centre pixel
    stamps: Vec<u8>,
    closed: bool,
}

/// Ends a blocked write, standing in for killing the encoder process
struct Unblock(Arc<AtomicBool>);

impl KillSwitch for Unblock {
    fn kill(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct MemoryEncoder {
    captured: Arc<Mutex<Captured>>,
    behavior: Behavior,
    width: u32,
    height: u32,
    released: Arc<AtomicBool>,
}

impl MemoryEncoder {
    fn centre_blue(&self, frame: &[u8]) -> u8 {
        let (x, y) = (self.width / 2, self.height / 2);
        frame[((y * self.width + x) * 4 + 2) as usize]
    }
}

impl VideoEncoder for MemoryEncoder {
    fn write(&mut self, frame: &[u8]) -> EncoderResult<()> {
        let position = self.captured.lock().frame_sizes.len();
        match self.behavior {
            Behavior::FailAt(at) if at == position => {
                return Err(EncoderError::Write(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "encoder went away",
                )));
            }
            Behavior::PanicAt(at) if at == position => panic!("encoder crashed"),
            Behavior::BlockAt { at, killable } if at == position => {
                while !self.released.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                if killable {
                    return Err(EncoderError::Write(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "encoder killed",
                    )));
                }
            }
            _ => {}
        }

        let stamp = self.centre_blue(frame);
        let mut captured = self.captured.lock();
        captured.frame_sizes.push(frame.len());
        captured.stamps.push(stamp);
        Ok(())
    }

    fn close(&mut self) -> EncoderResult<()> {
        self.captured.lock().closed = true;
        Ok(())
    }

    fn kill_switch(&self) -> Option<Arc<dyn KillSwitch>> {
        match self.behavior {
            Behavior::BlockAt { killable: true, .. } => {
                Some(Arc::new(Unblock(Arc::clone(&self.released))))
            }
            _ => None,
        }
    }
}

struct MemoryFactory {
    captured: Arc<Mutex<Captured>>,
    behavior: Behavior,
    released: Arc<AtomicBool>,
}

impl MemoryFactory {
    fn new(behavior: Behavior) -> (Arc<Self>, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let factory = Arc::new(Self {
            captured: Arc::clone(&captured),
            behavior,
            released: Arc::new(AtomicBool::new(false)),
        });
        (factory, captured)
    }

    /// Lets a non-killable blocked write finish
    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl EncoderFactory for MemoryFactory {
    fn open(&self, spec: &EncoderSpec) -> EncoderResult<Box<dyn VideoEncoder>> {
        self.captured.lock().spec = Some(spec.clone());
        Ok(Box::new(MemoryEncoder {
            captured: Arc::clone(&self.captured),
            behavior: self.behavior,
            width: spec.width,
            height: spec.height,
            released: Arc::clone(&self.released),
        }))
    }
}

fn video_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.output.directory = dir.to_path_buf();
    config.output.tag = Some("stream".to_string());
    config.output.mode = SinkMode::Video;
    config.capture.capture_interval_ms = Some(20);
    config.capture.downscale = 1.0;
    config.telemetry.flush_interval_ms = 50;
    config
}

/// Config whose teardown gives up on a stuck encoder quickly
fn impatient_config(dir: &Path) -> Config {
    let mut config = video_config(dir);
    config.pipeline.drain_timeout_ms = 200;
    config.encoder.exit_timeout_ms = 200;
    config
}

#[test]
fn test_video_recording_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (factory, captured) = MemoryFactory::new(Behavior::Accept);
    let mut recorder = Recorder::new(video_config(dir.path()))
        .unwrap()
        .with_encoder_factory(factory);

    recorder
        .start(Box::new(SyntheticSession::single(40, 30)))
        .unwrap();
    thread::sleep(Duration::from_millis(400));
    let report = recorder.stop().unwrap();

    let captured = captured.lock();
    assert!(captured.closed);
    let spec = captured.spec.as_ref().unwrap();
    assert_eq!((spec.width, spec.height), (40, 30));
    assert_eq!(
        spec.output,
        dir.path().join("screen_capture_stream.webm")
    );

    assert!(report.frames_written > 0);
    assert_eq!(captured.frame_sizes.len() as u64, report.frames_written);
    assert_eq!(report.encoder_accepted, Some(report.frames_written));
    assert!(captured.frame_sizes.iter().all(|&size| size == 40 * 30 * 4));

    // The synthetic grab stamps its count into the pixels, so the encoder
    // must see those stamps in capture order
    assert_eq!(captured.stamps[0], 0);
    assert!(captured.stamps.windows(2).all(|pair| pair[0] < pair[1]));

    let mut reader = csv::Reader::from_path(&report.output.telemetry).unwrap();
    assert_eq!(
        reader.headers().unwrap().iter().collect::<Vec<_>>(),
        ["frame_number", "timestamp", "datetime", "video_timestamp", "x", "y"]
    );
    let rows: Vec<csv::StringRecord> = reader.records().map(|row| row.unwrap()).collect();
    assert_eq!(rows.len() as u64, report.frames_produced);

    // Frame numbers and video offsets only move forward
    let numbers: Vec<u64> = rows.iter().map(|row| row[0].parse().unwrap()).collect();
    assert!(numbers.windows(2).all(|pair| pair[0] < pair[1]));
    let offsets: Vec<f64> = rows
        .iter()
        .filter(|row| !row[3].is_empty())
        .map(|row| row[3].parse().unwrap())
        .collect();
    assert!(offsets.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn test_encoder_failure_stops_pipeline() {
    let dir = TempDir::new().unwrap();
    let (factory, captured) = MemoryFactory::new(Behavior::FailAt(2));
    let mut recorder = Recorder::new(video_config(dir.path()))
        .unwrap()
        .with_encoder_factory(factory);

    let session = SyntheticSession::single(16, 16);
    let closed = session.closed_flag();
    recorder.start(Box::new(session)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !recorder.is_faulted() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(recorder.is_faulted());
    assert!(!recorder.is_running());

    match recorder.stop() {
        Err(RecorderError::Encoder(EncoderError::Write(_))) => {}
        other => panic!("expected encoder failure, got {:?}", other.map(|r| r.tag)),
    }

    // Teardown still completed
    assert!(closed.load(Ordering::SeqCst));
    assert!(captured.lock().closed);
    assert_eq!(captured.lock().stamps, vec![0, 1]);
    assert!(dir.path().join("session_stream.json").exists());
    assert!(dir.path().join("mouse_positions_stream.csv").exists());
}

#[test]
fn test_stuck_encoder_is_killed_on_stop() {
    let dir = TempDir::new().unwrap();
    let (factory, captured) = MemoryFactory::new(Behavior::BlockAt {
        at: 2,
        killable: true,
    });
    let mut recorder = Recorder::new(impatient_config(dir.path()))
        .unwrap()
        .with_encoder_factory(factory);

    recorder
        .start(Box::new(SyntheticSession::single(16, 16)))
        .unwrap();
    thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    match recorder.stop() {
        Err(RecorderError::Encoder(EncoderError::Write(_))) => {}
        other => panic!("expected killed encoder, got {:?}", other.map(|r| r.tag)),
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(captured.lock().closed);
    assert_eq!(captured.lock().stamps, vec![0, 1]);
    assert!(dir.path().join("session_stream.json").exists());
}

#[test]
fn test_unkillable_encoder_is_abandoned() {
    let dir = TempDir::new().unwrap();
    let (factory, _captured) = MemoryFactory::new(Behavior::BlockAt {
        at: 1,
        killable: false,
    });
    let mut recorder = Recorder::new(impatient_config(dir.path()))
        .unwrap()
        .with_encoder_factory(Arc::clone(&factory) as Arc<dyn EncoderFactory>);

    let session = SyntheticSession::single(16, 16);
    let closed = session.closed_flag();
    recorder.start(Box::new(session)).unwrap();
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    match recorder.stop() {
        Err(RecorderError::StopTimeout { name, .. }) => assert_eq!(name, "video-encoder"),
        other => panic!("expected abandoned encoder, got {:?}", other.map(|r| r.tag)),
    }
    assert!(started.elapsed() < Duration::from_secs(8));

    // Everything after the sink still ran
    assert!(closed.load(Ordering::SeqCst));
    assert!(dir.path().join("mouse_positions_stream.csv").exists());
    let summary = std::fs::read_to_string(dir.path().join("session_stream.json")).unwrap();
    assert!(summary.contains("video-encoder"));

    factory.release();
}

#[test]
fn test_panicking_encoder_does_not_skip_flush() {
    let dir = TempDir::new().unwrap();
    let (factory, captured) = MemoryFactory::new(Behavior::PanicAt(3));
    let mut recorder = Recorder::new(video_config(dir.path()))
        .unwrap()
        .with_encoder_factory(factory);

    let session = SyntheticSession::single(16, 16);
    let closed = session.closed_flag();
    recorder.start(Box::new(session)).unwrap();
    thread::sleep(Duration::from_millis(300));

    match recorder.stop() {
        Err(RecorderError::ThreadPanicked(name)) => assert_eq!(name, "video-encoder"),
        other => panic!("expected encoder panic, got {:?}", other.map(|r| r.tag)),
    }

    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(captured.lock().stamps, vec![0, 1, 2]);

    let mut reader =
        csv::Reader::from_path(dir.path().join("mouse_positions_stream.csv")).unwrap();
    let rows = reader.records().count();
    assert!(rows >= 4, "only {} telemetry rows", rows);

    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("session_stream.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["telemetry_rows_written"], rows as u64);
    assert!(summary["fault"].as_str().unwrap().contains("video-encoder"));
}
