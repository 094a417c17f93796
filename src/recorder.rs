//! Recording lifecycle
//!
//! [`Recorder`] wires the resolver, producer, channel, sink and telemetry
//! batcher together, starts them in dependency order and tears them down in
//! a fixed sequence where every step runs even if an earlier one failed.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::desktop::capture::{FrameProducer, ProducerHandle, ProducerSettings};
use crate::desktop::geometry::{CaptureSession, DisplayGeometryResolver};
use crate::desktop::types::{CaptureStats, CaptureStatsSnapshot, FrameJob};
use crate::error::{RecorderError, Result};
use crate::pipeline::channel::{bounded, ChannelSender, ChannelStats};
use crate::pipeline::state::{RecorderState, StateMachine};
use crate::sink::encoder::{EncoderFactory, EncoderSpec, FfmpegEncoderFactory};
use crate::sink::{
    FileSink, FrameSink, PipelineFault, SinkHandle, SinkMode, SinkReport, StreamSink,
};
use crate::telemetry::batcher::{TelemetryBatcher, TelemetryReport};
use crate::telemetry::log::CsvTelemetryLog;
use crate::telemetry::record::ReferenceStyle;

/// Sink shutdown budget when a start is rolled back
const SHUTDOWN_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest a capture tick may take to notice the stop request
const PRODUCER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Added to the encoder exit timeout for the sink join
const SINK_JOIN_MARGIN: Duration = Duration::from_secs(2);

/// How often the drain wait checks that the sink is still consuming
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Format of the default session tag
const TAG_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Session tag derived from the start time
pub fn default_tag(start: &DateTime<Local>) -> String {
    start.format(TAG_FORMAT).to_string()
}

/// Files produced by one recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputPaths {
    pub tag: String,
    pub directory: PathBuf,
    /// CSV telemetry log
    pub telemetry: PathBuf,
    /// WebM output in video mode
    pub video: Option<PathBuf>,
    /// JSON session summary
    pub report: PathBuf,
}

impl OutputPaths {
    pub fn new(directory: &Path, tag: &str, mode: SinkMode) -> Self {
        Self {
            tag: tag.to_string(),
            directory: directory.to_path_buf(),
            telemetry: directory.join(format!("mouse_positions_{}.csv", tag)),
            video: match mode {
                SinkMode::Files => None,
                SinkMode::Video => Some(directory.join(format!("screen_capture_{}.webm", tag))),
            },
            report: directory.join(format!("session_{}.json", tag)),
        }
    }
}

/// Summary of a finished recording, written next to its output
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub tag: String,
    pub mode: SinkMode,
    pub started_at: String,
    pub duration_secs: f64,
    /// Ticks that produced a frame
    pub frames_produced: u64,
    pub frames_accepted: u64,
    pub frames_dropped: u64,
    pub tick_failures: u64,
    /// PNGs saved, or frames accepted by the encoder
    pub frames_written: u64,
    pub frames_failed: u64,
    pub encoder_accepted: Option<u64>,
    pub telemetry_rows_written: u64,
    pub telemetry_rows_lost: u64,
    pub telemetry_failed_appends: u64,
    pub drained: bool,
    pub fault: Option<String>,
    pub cleanup_errors: Vec<String>,
    pub output: OutputPaths,
}

impl SessionReport {
    fn write_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Point-in-time view of a running recording
#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub state: String,
    pub elapsed_secs: f64,
    pub capture: CaptureStatsSnapshot,
    pub channel: ChannelStats,
    pub sink: SinkReport,
    pub telemetry_rows_written: u64,
}

impl fmt::Display for RecorderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.0}s: {} frames ({} dropped, {:.1}%), queue {}/{}, {} written, {} telemetry rows",
            self.elapsed_secs,
            self.capture.frames_captured,
            self.capture.frames_dropped,
            self.capture.drop_rate(),
            self.channel.queued,
            self.channel.capacity,
            self.sink.frames_written,
            self.telemetry_rows_written
        )
    }
}

struct ActivePipeline {
    producer: ProducerHandle,
    sender: ChannelSender<FrameJob>,
    sink: SinkHandle,
    batcher: TelemetryBatcher,
    stats: Arc<CaptureStats>,
    started: Instant,
    started_wall: DateTime<Local>,
    paths: OutputPaths,
}

/// Lifecycle controller for one recording
///
/// A recorder runs once: `start` then `stop`. It cannot be restarted.
pub struct Recorder {
    config: Config,
    encoder_factory: Arc<dyn EncoderFactory>,
    machine: StateMachine,
    running: Arc<AtomicBool>,
    fault: Arc<PipelineFault>,
    active: Option<ActivePipeline>,
}

impl Recorder {
    /// Creates a recorder that encodes video with ffmpeg
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            encoder_factory: Arc::new(FfmpegEncoderFactory),
            machine: StateMachine::new(),
            running: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(PipelineFault::new()),
            active: None,
        })
    }

    /// Replaces the encoder used in video mode
    pub fn with_encoder_factory(mut self, factory: Arc<dyn EncoderFactory>) -> Self {
        self.encoder_factory = factory;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> RecorderState {
        self.machine.current()
    }

    /// True while the pipeline runs
    ///
    /// Cleared by `stop`, by a pipeline fault, or when the producer or
    /// the sink workers have exited on their own.
    pub fn is_running(&self) -> bool {
        self.machine.current() == RecorderState::Running
            && self.running.load(Ordering::SeqCst)
            && self.active.as_ref().is_some_and(|active| {
                !active.producer.is_finished() && !active.sink.is_finished()
            })
    }

    /// True once a sink has reported a fatal error
    pub fn is_faulted(&self) -> bool {
        self.fault.is_set()
    }

    /// Output files of the current recording
    pub fn output_paths(&self) -> Option<&OutputPaths> {
        self.active.as_ref().map(|active| &active.paths)
    }

    /// Starts recording from `session`
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` if this recorder was started before; otherwise the
    /// first failure while resolving geometry or starting a stage. Stages
    /// started before the failure are stopped again.
    pub fn start(&mut self, session: Box<dyn CaptureSession>) -> Result<()> {
        if self.machine.transition(RecorderState::Starting).is_err() {
            return Err(RecorderError::AlreadyStarted);
        }

        match self.launch(session) {
            Ok(active) => {
                info!(
                    "Recording '{}' started in {} mode -> {}",
                    active.paths.tag,
                    self.config.output.mode,
                    active.paths.directory.display()
                );
                self.active = Some(active);
                let _ = self.machine.transition(RecorderState::Running);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start recording: {}", e);
                self.running.store(false, Ordering::SeqCst);
                let _ = self.machine.transition(RecorderState::Stopped);
                Err(e)
            }
        }
    }

    fn launch(&mut self, session: Box<dyn CaptureSession>) -> Result<ActivePipeline> {
        let started = Instant::now();
        let started_wall = Local::now();

        // Geometry first: without displays nothing else is worth starting.
        // Dropping the resolver on any later failure releases the session.
        let resolver = DisplayGeometryResolver::new(session)?;

        let mode = self.config.output.mode;
        let tag = self
            .config
            .output
            .tag
            .clone()
            .unwrap_or_else(|| default_tag(&started_wall));
        let paths = OutputPaths::new(&self.config.output.directory, &tag, mode);
        fs::create_dir_all(&paths.directory)?;

        let settings = ProducerSettings {
            interval: self.config.capture_interval(),
            error_backoff: self.config.error_backoff(),
            downscale: self.config.capture.downscale,
        };
        let (width, height) = resolver.canvas().scaled_size(settings.downscale);

        self.running.store(true, Ordering::SeqCst);
        let (sender, receiver) = bounded(self.config.channel_capacity());

        let (sink, references): (Box<dyn FrameSink>, ReferenceStyle) = match mode {
            SinkMode::Files => {
                let mut sink = FileSink::new(&paths.directory, self.config.pipeline.workers);
                if self.config.output.draw_cursor {
                    sink = sink.with_cursor_marker(settings.downscale);
                }
                (
                    Box::new(sink),
                    ReferenceStyle::Files {
                        directory: paths.directory.clone(),
                    },
                )
            }
            SinkMode::Video => {
                let spec = EncoderSpec {
                    program: self.config.encoder.program.clone(),
                    width,
                    height,
                    fps: settings.fps(),
                    quality: self.config.encoder.quality,
                    output: paths
                        .video
                        .clone()
                        .unwrap_or_else(|| paths.directory.join("screen_capture.webm")),
                    exit_timeout: self.config.encoder_exit_timeout(),
                };
                (
                    Box::new(StreamSink::new(Arc::clone(&self.encoder_factory), spec)),
                    ReferenceStyle::Video,
                )
            }
        };

        // Consumers first, producer last
        let sink = sink.start(receiver, Arc::clone(&self.running), Arc::clone(&self.fault))?;

        let log = CsvTelemetryLog::new(&paths.telemetry, references.layout());
        let batcher = match TelemetryBatcher::start(Box::new(log), self.config.flush_interval()) {
            Ok(batcher) => batcher,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                if let Err(sink_err) = sink.shutdown(&sender, SHUTDOWN_SEND_TIMEOUT) {
                    warn!("Sink shutdown after failed start: {}", sink_err);
                }
                return Err(e);
            }
        };

        let producer = FrameProducer::new(
            resolver,
            sender.clone(),
            batcher.buffer(),
            references,
            settings,
            Arc::clone(&self.running),
        )
        .with_session_start(started);
        let stats = producer.stats();

        let producer = match producer.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                if let Err(sink_err) = sink.shutdown(&sender, SHUTDOWN_SEND_TIMEOUT) {
                    warn!("Sink shutdown after failed start: {}", sink_err);
                }
                batcher.shutdown();
                return Err(e);
            }
        };

        Ok(ActivePipeline {
            producer,
            sender,
            sink,
            batcher,
            stats,
            started,
            started_wall,
            paths,
        })
    }

    /// Current counters, `None` unless running
    pub fn status(&self) -> Option<RecorderStatus> {
        let active = self.active.as_ref()?;
        Some(RecorderStatus {
            state: self.machine.current().to_string(),
            elapsed_secs: active.started.elapsed().as_secs_f64(),
            capture: active.stats.snapshot(),
            channel: active.sender.stats(),
            sink: active.sink.report(),
            telemetry_rows_written: active.batcher.rows_written(),
        })
    }

    /// Stops recording and writes the session summary
    ///
    /// Teardown order: producer, channel drain, sink, telemetry flush,
    /// capture session release, summary. A failing step is logged and
    /// recorded in the summary; the remaining steps still run.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the recorder is not running. The first fatal fault of
    /// the pipeline (a sink error, a panicked thread or one that had to be
    /// abandoned) is returned after teardown completes.
    pub fn stop(&mut self) -> Result<SessionReport> {
        if self.machine.transition(RecorderState::Stopping).is_err() {
            return Err(RecorderError::NotRunning);
        }
        let Some(active) = self.active.take() else {
            let _ = self.machine.transition(RecorderState::Stopped);
            return Err(RecorderError::NotRunning);
        };

        info!("Stopping recording '{}'", active.paths.tag);
        let mut cleanup_errors = Vec::new();

        // Producer: the current tick finishes, no new frames after this
        self.running.store(false, Ordering::SeqCst);
        active.producer.request_stop();
        let resolver = match active.producer.join(PRODUCER_STOP_TIMEOUT) {
            Ok(resolver) => Some(resolver),
            Err(e) => {
                error!("Producer did not stop cleanly: {}", e);
                cleanup_errors.push(e.to_string());
                self.fault.record(e);
                None
            }
        };

        // Queued and in-flight frames
        let drain_timeout = self.config.drain_timeout();
        let drained = wait_drained(&active.sender, &active.sink, drain_timeout);
        if !drained {
            let pending = active.sender.stats().pending;
            warn!(
                "{} frames still pending after {:?}, stopping sink anyway",
                pending, drain_timeout
            );
            cleanup_errors.push(format!(
                "{} frames still pending after {:?}",
                pending, drain_timeout
            ));
            // A worker stuck on the encoder never drains the rest
            active.sink.abort();
        }

        let counters = active.sink.counters();
        let sink_timeout = self.config.encoder_exit_timeout() + SINK_JOIN_MARGIN;
        let sink: SinkReport = match active.sink.shutdown(&active.sender, sink_timeout) {
            Ok(report) => report,
            Err(e) => {
                error!("Sink did not stop cleanly: {}", e);
                cleanup_errors.push(e.to_string());
                self.fault.record(e);
                counters.report()
            }
        };

        let telemetry: TelemetryReport = active.batcher.shutdown();
        if telemetry.rows_lost > 0 {
            cleanup_errors.push(format!(
                "{} telemetry records lost in the final flush",
                telemetry.rows_lost
            ));
        }

        if let Some(mut resolver) = resolver {
            if let Err(e) = resolver.release() {
                error!("Failed to release capture session: {}", e);
                cleanup_errors.push(e.to_string());
            }
        }

        let fault = self.fault.take();
        let capture = active.stats.snapshot();
        let mode = self.config.output.mode;
        let mut report = SessionReport {
            tag: active.paths.tag.clone(),
            mode,
            started_at: active.started_wall.to_rfc3339(),
            duration_secs: active.started.elapsed().as_secs_f64(),
            frames_produced: capture.frames_captured,
            frames_accepted: capture.frames_accepted(),
            frames_dropped: capture.frames_dropped,
            tick_failures: capture.tick_failures,
            frames_written: sink.frames_written,
            frames_failed: sink.frames_failed,
            encoder_accepted: (mode == SinkMode::Video).then_some(sink.frames_written),
            telemetry_rows_written: telemetry.rows_written,
            telemetry_rows_lost: telemetry.rows_lost,
            telemetry_failed_appends: telemetry.failed_appends,
            drained,
            fault: fault.as_ref().map(|e| e.to_string()),
            cleanup_errors,
            output: active.paths,
        };

        if let Err(e) = report.write_to(&report.output.report) {
            error!("Failed to write session summary: {}", e);
            report.cleanup_errors.push(e.to_string());
        }

        info!(
            "Recording '{}' stopped after {:.1}s: {} frames produced, {} dropped, {} written, {} telemetry rows",
            report.tag,
            report.duration_secs,
            report.frames_produced,
            report.frames_dropped,
            report.frames_written,
            report.telemetry_rows_written
        );
        let _ = self.machine.transition(RecorderState::Stopped);

        match fault {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Waits for the channel to drain, giving up early once no worker is left
fn wait_drained(sender: &ChannelSender<FrameJob>, sink: &SinkHandle, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let slice = deadline.saturating_duration_since(Instant::now()).min(DRAIN_POLL);
        if sender.wait_drained(slice) {
            return true;
        }
        if sink.is_finished() {
            warn!("Sink workers are gone, queued frames cannot drain");
            return false;
        }
        if Instant::now() >= deadline {
            return false;
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.machine.current() == RecorderState::Running {
            if let Err(e) = self.stop() {
                error!("Recorder stopped with error on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desktop::synthetic::SyntheticSession;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.output.directory = dir.to_path_buf();
        config.output.tag = Some("test".to_string());
        config.capture.capture_interval_ms = Some(20);
        config.telemetry.flush_interval_ms = 20;
        config
    }

    #[test]
    fn test_default_tag() {
        let start = Local.with_ymd_and_hms(2024, 5, 1, 13, 45, 12).unwrap();
        assert_eq!(default_tag(&start), "20240501_134512");
    }

    #[test]
    fn test_output_paths() {
        let paths = OutputPaths::new(Path::new("out"), "t1", SinkMode::Video);
        assert_eq!(paths.telemetry, Path::new("out").join("mouse_positions_t1.csv"));
        assert_eq!(
            paths.video,
            Some(Path::new("out").join("screen_capture_t1.webm"))
        );
        assert_eq!(paths.report, Path::new("out").join("session_t1.json"));
        assert!(OutputPaths::new(Path::new("out"), "t1", SinkMode::Files)
            .video
            .is_none());
    }

    #[test]
    fn test_second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut recorder = Recorder::new(config(dir.path())).unwrap();

        recorder
            .start(Box::new(SyntheticSession::single(64, 48)))
            .unwrap();
        assert!(matches!(
            recorder.start(Box::new(SyntheticSession::single(64, 48))),
            Err(RecorderError::AlreadyStarted)
        ));
        assert_eq!(recorder.state(), RecorderState::Running);

        recorder.stop().unwrap();
        assert!(matches!(
            recorder.start(Box::new(SyntheticSession::single(64, 48))),
            Err(RecorderError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_stop_without_start() {
        let dir = TempDir::new().unwrap();
        let mut recorder = Recorder::new(config(dir.path())).unwrap();
        assert!(matches!(recorder.stop(), Err(RecorderError::NotRunning)));
        assert!(recorder.status().is_none());
    }

    #[test]
    fn test_no_display_fails_start() {
        let dir = TempDir::new().unwrap();
        let mut recorder = Recorder::new(config(dir.path())).unwrap();

        let session = SyntheticSession::new(Vec::new());
        let closed = session.closed_flag();
        assert!(matches!(
            recorder.start(Box::new(session)),
            Err(RecorderError::Capture(_))
        ));
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert!(closed.load(Ordering::SeqCst));
    }

    fn csv_rows(path: &Path) -> usize {
        fs::read_to_string(path).unwrap().lines().count() - 1
    }

    #[test]
    fn test_producer_panic_is_a_fault() {
        let dir = TempDir::new().unwrap();
        let mut recorder = Recorder::new(config(dir.path())).unwrap();

        let session = SyntheticSession::single(32, 24).with_panicking_grab(3);
        let closed = session.closed_flag();
        recorder.start(Box::new(session)).unwrap();
        let paths = recorder.output_paths().unwrap().clone();

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!recorder.is_running());
        assert_eq!(recorder.state(), RecorderState::Running);

        match recorder.stop() {
            Err(RecorderError::ThreadPanicked(name)) => assert_eq!(name, "frame-producer"),
            other => panic!("expected producer panic, got {:?}", other.map(|r| r.tag)),
        }
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert!(closed.load(Ordering::SeqCst));

        // Rows of the ticks before the panic are still flushed
        assert_eq!(csv_rows(&paths.telemetry), 3);
        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.report).unwrap()).unwrap();
        assert_eq!(summary["frames_produced"], 3);
        assert!(summary["fault"]
            .as_str()
            .unwrap()
            .contains("frame-producer"));
    }

    #[test]
    fn test_failing_release_does_not_skip_flush() {
        let dir = TempDir::new().unwrap();
        let mut recorder = Recorder::new(config(dir.path())).unwrap();

        let session = SyntheticSession::single(32, 24).with_failing_close();
        let closed = session.closed_flag();
        recorder.start(Box::new(session)).unwrap();
        std::thread::sleep(Duration::from_millis(150));

        let report = recorder.stop().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(report.fault.is_none());
        assert_eq!(report.cleanup_errors.len(), 1);
        assert!(report.cleanup_errors[0].contains("synthetic display server went away"));

        assert!(report.frames_produced > 0);
        assert_eq!(report.telemetry_rows_written, report.frames_produced);
        assert_eq!(csv_rows(&report.output.telemetry) as u64, report.frames_produced);
        assert_eq!(
            fs::read_dir(&report.output.directory)
                .unwrap()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "png"))
                .count() as u64,
            report.frames_written
        );

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&report.output.report).unwrap()).unwrap();
        assert_eq!(summary["cleanup_errors"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.pipeline.workers = 0;
        assert!(Recorder::new(config).is_err());
    }
}
