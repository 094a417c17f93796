//! Frame sinks
//!
//! A sink drains the frame channel on its own threads. Two implementations
//! exist: a pool of PNG writers and a single worker streaming into a video
//! encoder.

pub mod encoder;
pub mod files;
pub mod stream;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::desktop::types::FrameJob;
use crate::error::{RecorderError, Result};
use crate::pipeline::channel::{ChannelReceiver, ChannelSender};

pub use encoder::{
    EncoderFactory, EncoderSpec, FfmpegEncoder, FfmpegEncoderFactory, KillSwitch, QualityPreset,
    VideoEncoder,
};
pub use files::FileSink;
pub use stream::StreamSink;

/// How long a consumer blocks on the channel before checking for shutdown
pub(crate) const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Wait for one free channel slot per shutdown attempt
const SHUTDOWN_SEND_SLICE: Duration = Duration::from_millis(100);

/// Time given to workers to exit after their sink was aborted
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Poll period while waiting for workers to finish
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Output mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    /// One PNG per frame, written by a worker pool
    #[default]
    Files,
    /// A single WebM stream
    Video,
}

impl SinkMode {
    /// Default channel capacity for this mode
    pub fn default_capacity(&self) -> usize {
        match self {
            SinkMode::Files => 1000,
            SinkMode::Video => 300,
        }
    }
}

impl std::fmt::Display for SinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkMode::Files => write!(f, "files"),
            SinkMode::Video => write!(f, "video"),
        }
    }
}

/// First fatal pipeline error, recorded by a sink worker or the controller
#[derive(Debug, Default)]
pub struct PipelineFault {
    error: Mutex<Option<RecorderError>>,
}

impl PipelineFault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `error` unless an earlier fault is already recorded
    pub fn record(&self, error: impl Into<RecorderError>) {
        let error = error.into();
        let mut slot = self.error.lock();
        if slot.is_none() {
            error!("Pipeline fault: {}", error);
            *slot = Some(error);
        } else {
            debug!("Additional pipeline fault ignored: {}", error);
        }
    }

    pub fn is_set(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Removes and returns the recorded fault
    pub fn take(&self) -> Option<RecorderError> {
        self.error.lock().take()
    }
}

/// Counters shared by a sink's workers
#[derive(Debug, Default)]
pub struct SinkCounters {
    written: AtomicU64,
    failed: AtomicU64,
}

impl SinkCounters {
    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> SinkReport {
        SinkReport {
            frames_written: self.written.load(Ordering::Relaxed),
            frames_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Frames a sink persisted or gave up on
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SinkReport {
    /// PNGs saved, or frames accepted by the encoder
    pub frames_written: u64,
    pub frames_failed: u64,
}

/// Consumer side of the pipeline
pub trait FrameSink: Send {
    /// Spawns the sink's workers
    ///
    /// Workers exit on a shutdown message or when every sender is gone. A
    /// sink that hits a fatal error records it in `fault` and clears
    /// `running`.
    fn start(
        self: Box<Self>,
        receiver: ChannelReceiver<FrameJob>,
        running: Arc<AtomicBool>,
        fault: Arc<PipelineFault>,
    ) -> Result<SinkHandle>;
}

/// Running sink workers
pub struct SinkHandle {
    workers: Vec<(String, JoinHandle<()>)>,
    counters: Arc<SinkCounters>,
    kill_switch: Option<Arc<dyn KillSwitch>>,
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("workers", &self.workers)
            .field("counters", &self.counters)
            .field("killable", &self.kill_switch.is_some())
            .finish()
    }
}

impl SinkHandle {
    pub(crate) fn new(workers: Vec<(String, JoinHandle<()>)>, counters: Arc<SinkCounters>) -> Self {
        Self {
            workers,
            counters,
            kill_switch: None,
        }
    }

    /// Lets `abort` end an external process a worker may be blocked on
    pub(crate) fn with_kill_switch(mut self, kill_switch: Option<Arc<dyn KillSwitch>>) -> Self {
        self.kill_switch = kill_switch;
        self
    }

    /// Forcibly ends whatever the workers are blocked on
    ///
    /// A no-op for sinks without an external process.
    pub fn abort(&self) {
        if let Some(kill_switch) = &self.kill_switch {
            warn!("Aborting sink");
            kill_switch.kill();
        }
    }

    /// Shared counters, still readable after a failed shutdown
    pub fn counters(&self) -> Arc<SinkCounters> {
        Arc::clone(&self.counters)
    }

    /// True once every worker has exited
    ///
    /// Workers only exit on shutdown, so this is also how a panicked sink
    /// shows up while recording.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|(_, handle)| handle.is_finished())
    }

    /// Waits until every worker has finished or `deadline` passes
    fn wait_finished(&self, deadline: Instant) -> bool {
        loop {
            if self.is_finished() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Counters so far
    pub fn report(&self) -> SinkReport {
        self.counters.report()
    }

    /// Sends one shutdown message per worker and joins them all
    ///
    /// Workers still running after `timeout` are aborted and given a short
    /// grace period; any that remain are abandoned and reported as
    /// `StopTimeout`. Otherwise the first panic is returned.
    pub fn shutdown(self, sender: &ChannelSender<FrameJob>, timeout: Duration) -> Result<SinkReport> {
        let deadline = Instant::now() + timeout;

        // Workers keep consuming, so a full queue frees up eventually
        let mut remaining = self.workers.len();
        while remaining > 0 {
            remaining -= sender.send_shutdown(remaining, SHUTDOWN_SEND_SLICE);
            if remaining == 0 || self.is_finished() || Instant::now() >= deadline {
                break;
            }
            debug!("{} sink workers not signalled yet, retrying", remaining);
        }
        if remaining > 0 {
            warn!("{} sink workers not signalled before the deadline", remaining);
        }

        if !self.wait_finished(deadline) {
            warn!("Sink workers still busy after {:?}", timeout);
            self.abort();
            self.wait_finished(Instant::now() + ABORT_GRACE);
        }

        let mut first_error = None;
        for (name, handle) in self.workers {
            if !handle.is_finished() {
                // Dropping the handle detaches the thread
                error!("Sink worker {} abandoned after {:?}", name, timeout);
                first_error = Some(RecorderError::StopTimeout { name, timeout });
                continue;
            }
            if handle.join().is_err() {
                error!("Sink worker {} panicked", name);
                first_error.get_or_insert(RecorderError::ThreadPanicked(name));
            }
        }

        let report = self.counters.report();
        info!(
            "Sink stopped: {} frames written, {} failed",
            report.frames_written, report.frames_failed
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
