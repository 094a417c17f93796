//! Frame producer
//!
//! Runs the capture loop on a dedicated `frame-producer` thread. Each tick
//! samples the cursor, grabs and composes the canvas, offers the frame to
//! the bounded channel and records one telemetry row whether or not the
//! frame was accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info};

use crate::desktop::compose::FrameComposer;
use crate::desktop::geometry::DisplayGeometryResolver;
use crate::desktop::types::{
    CaptureStats, CaptureTime, CursorSample, Fps, Frame, FrameJob, DEFAULT_DOWNSCALE,
    DEFAULT_FPS,
};
use crate::error::{CaptureResult, RecorderError, Result};
use crate::pipeline::channel::{ChannelSender, Rejected};
use crate::pipeline::state::{AtomicProducerState, ProducerState};
use crate::pipeline::ticker::{sleep_while, Ticker};
use crate::telemetry::batcher::TelemetryBuffer;
use crate::telemetry::record::{FrameStatus, ReferenceStyle, TelemetryRecord};

/// Default pause after a failed tick
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Timing and scaling of the capture loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProducerSettings {
    pub interval: Duration,
    pub error_backoff: Duration,
    pub downscale: f32,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self::from_fps(DEFAULT_FPS)
    }
}

impl ProducerSettings {
    pub fn from_fps(fps: Fps) -> Self {
        Self {
            interval: Duration::from_millis(1000 / fps.max(1) as u64),
            error_backoff: DEFAULT_ERROR_BACKOFF,
            downscale: DEFAULT_DOWNSCALE,
        }
    }

    /// Nominal frame rate implied by the interval
    pub fn fps(&self) -> f64 {
        1.0 / self.interval.as_secs_f64().max(f64::EPSILON)
    }
}

/// Capture loop state, moved onto the producer thread by [`FrameProducer::spawn`]
pub struct FrameProducer {
    resolver: DisplayGeometryResolver,
    composer: FrameComposer,
    sender: ChannelSender<FrameJob>,
    telemetry: Arc<TelemetryBuffer>,
    references: ReferenceStyle,
    settings: ProducerSettings,
    sequence: u64,
    session_start: Instant,
    stats: Arc<CaptureStats>,
    running: Arc<AtomicBool>,
    state: Arc<AtomicProducerState>,
}

impl FrameProducer {
    pub fn new(
        resolver: DisplayGeometryResolver,
        sender: ChannelSender<FrameJob>,
        telemetry: Arc<TelemetryBuffer>,
        references: ReferenceStyle,
        settings: ProducerSettings,
        running: Arc<AtomicBool>,
    ) -> Self {
        let composer = FrameComposer::new(
            resolver.monitors(),
            &resolver.canvas(),
            settings.downscale,
        );
        Self {
            resolver,
            composer,
            sender,
            telemetry,
            references,
            settings,
            sequence: 0,
            session_start: Instant::now(),
            stats: Arc::new(CaptureStats::default()),
            running,
            state: Arc::new(AtomicProducerState::default()),
        }
    }

    /// Measures session-relative timestamps from `start`
    pub fn with_session_start(mut self, start: Instant) -> Self {
        self.session_start = start;
        self
    }

    /// Size of the frames this producer emits
    pub fn output_size(&self) -> (u32, u32) {
        self.composer.output_size()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    /// Runs one capture tick and returns its sequence number
    ///
    /// A failed tick produces neither a frame nor a telemetry record.
    pub fn tick(&mut self) -> CaptureResult<u64> {
        let started = Instant::now();

        let (x, y) = self.resolver.sample_cursor()?;
        // Frame and cursor share the instant taken before the grab
        let time = CaptureTime::new(Local::now(), self.session_start.elapsed());
        let raw = self.resolver.grab()?;
        let composed = self.composer.compose(raw);
        let (width, height) = composed.dimensions();

        let sequence = self.sequence;
        self.sequence += 1;

        let frame = Frame::new(width, height, composed.into_raw(), sequence, time);
        let reference = self.references.reference_for(&frame);
        let job = FrameJob {
            frame,
            cursor: CursorSample { x, y, time },
        };

        let status = match self.sender.try_send(job) {
            Ok(()) => FrameStatus::Stored(reference),
            Err(Rejected::Full(_)) => FrameStatus::Dropped,
            Err(Rejected::Disconnected(_)) => {
                error!("Frame channel disconnected, frame {} dropped", sequence);
                FrameStatus::Dropped
            }
        };

        self.stats.record_tick(started.elapsed(), status.is_dropped());
        debug!(
            "Tick {} cursor=({:.1}, {:.1}) dropped={}",
            sequence,
            x,
            y,
            status.is_dropped()
        );
        self.telemetry.push(TelemetryRecord {
            sequence,
            time,
            x,
            y,
            frame: status,
        });

        Ok(sequence)
    }

    /// Starts the capture loop on the `frame-producer` thread
    pub fn spawn(self) -> Result<ProducerHandle> {
        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name("frame-producer".to_string())
            .spawn(move || self.run())
            .map_err(|source| RecorderError::ThreadSpawn {
                name: "frame-producer".to_string(),
                source,
            })?;

        Ok(ProducerHandle {
            handle,
            state,
            stats,
        })
    }

    fn run(mut self) -> DisplayGeometryResolver {
        self.state.store(ProducerState::Running);
        let (width, height) = self.output_size();
        info!(
            "Frame producer started: {}x{} every {:?}",
            width, height, self.settings.interval
        );

        let mut ticker = Ticker::new(self.settings.interval);
        while self.running.load(Ordering::SeqCst) && self.state.load() == ProducerState::Running
        {
            ticker.begin();

            if let Err(e) = self.tick() {
                self.stats.record_failure();
                error!("Capture tick failed: {}", e);
                if !sleep_while(self.settings.error_backoff, &self.running) {
                    break;
                }
                continue;
            }

            if !ticker.wait(&self.running) {
                break;
            }
        }

        self.state.store(ProducerState::Stopped);
        let snapshot = self.stats.snapshot();
        info!(
            "Frame producer stopped after {} frames ({} dropped, {} failed ticks)",
            snapshot.frames_captured, snapshot.frames_dropped, snapshot.tick_failures
        );
        self.resolver
    }
}

/// Handle to the running producer thread
#[derive(Debug)]
pub struct ProducerHandle {
    handle: JoinHandle<DisplayGeometryResolver>,
    state: Arc<AtomicProducerState>,
    stats: Arc<CaptureStats>,
}

impl ProducerHandle {
    pub fn state(&self) -> ProducerState {
        self.state.load()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    /// Asks the loop to exit after the current tick
    pub fn request_stop(&self) {
        self.state.request_stop();
    }

    /// True once the thread has exited, normally or by panic
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the loop to exit and takes back the resolver
    ///
    /// A thread still running after `timeout` is detached and reported as
    /// `StopTimeout`; its resolver releases the session whenever the thread
    /// ends.
    pub fn join(self, timeout: Duration) -> Result<DisplayGeometryResolver> {
        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                error!("Frame producer still busy after {:?}, detaching it", timeout);
                return Err(RecorderError::StopTimeout {
                    name: "frame-producer".to_string(),
                    timeout,
                });
            }
            thread::sleep(JOIN_POLL);
        }
        self.handle
            .join()
            .map_err(|_| RecorderError::ThreadPanicked("frame-producer".to_string()))
    }
}
