//! Pooled PNG file sink

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use image::{ImageFormat, RgbaImage};
use tracing::{debug, error, info};

use crate::desktop::compose::draw_cursor_marker;
use crate::desktop::types::FrameJob;
use crate::error::{RecorderError, Result};
use crate::pipeline::channel::{ChannelReceiver, Received};
use crate::sink::{FrameSink, PipelineFault, SinkCounters, SinkHandle, RECV_TIMEOUT};
use crate::telemetry::record::frame_path;

/// Default number of writer threads
pub const DEFAULT_WORKERS: usize = 3;

/// Writes each frame to `<directory>/<unix_ts>.png` using a pool of workers
///
/// Frames complete out of order across workers; the file name carries the
/// capture time so order can be recovered.
#[derive(Debug, Clone)]
pub struct FileSink {
    directory: PathBuf,
    workers: usize,
    /// Downscale factor when drawing the marker, `None` to skip it
    cursor_scale: Option<f32>,
}

impl FileSink {
    pub fn new(directory: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            directory: directory.into(),
            workers: workers.max(1),
            cursor_scale: None,
        }
    }

    /// Draws the cursor marker, scaling full-resolution cursor positions by `scale`
    pub fn with_cursor_marker(mut self, scale: f32) -> Self {
        self.cursor_scale = Some(scale);
        self
    }
}

impl FrameSink for FileSink {
    fn start(
        self: Box<Self>,
        receiver: ChannelReceiver<FrameJob>,
        // Per-frame failures are never fatal here
        _running: Arc<AtomicBool>,
        _fault: Arc<PipelineFault>,
    ) -> Result<SinkHandle> {
        let counters = Arc::new(SinkCounters::default());
        let mut workers = Vec::with_capacity(self.workers);

        for n in 0..self.workers {
            let name = format!("frame-writer-{}", n);
            let receiver = receiver.clone();
            let counters = Arc::clone(&counters);
            let directory = self.directory.clone();
            let cursor_scale = self.cursor_scale;

            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || writer_loop(&receiver, &counters, &directory, cursor_scale))
                .map_err(|source| RecorderError::ThreadSpawn {
                    name: name.clone(),
                    source,
                })?;
            workers.push((name, handle));
        }

        info!(
            "File sink started with {} workers -> {}",
            workers.len(),
            self.directory.display()
        );
        Ok(SinkHandle::new(workers, counters))
    }
}

fn writer_loop(
    receiver: &ChannelReceiver<FrameJob>,
    counters: &SinkCounters,
    directory: &Path,
    cursor_scale: Option<f32>,
) {
    loop {
        match receiver.recv_timeout(RECV_TIMEOUT) {
            Received::Item(mut job) => match write_frame(&mut job, directory, cursor_scale) {
                Ok(path) => {
                    counters.record_written();
                    debug!("Saved frame {} to {}", job.frame.sequence, path.display());
                }
                Err(e) => {
                    counters.record_failed();
                    error!("Frame {} not saved: {}", job.frame.sequence, e);
                }
            },
            Received::Shutdown | Received::Disconnected => break,
            Received::Timeout => {}
        }
    }
    debug!("Frame writer exiting");
}

/// Encodes one frame as PNG, consuming its pixel data
fn write_frame(job: &mut FrameJob, directory: &Path, cursor_scale: Option<f32>) -> Result<PathBuf> {
    let path = frame_path(directory, &job.frame.time);
    let data = std::mem::take(&mut job.frame.data);

    let mut image = RgbaImage::from_raw(job.frame.width, job.frame.height, data).ok_or_else(|| {
        RecorderError::FrameWrite {
            path: path.display().to_string(),
            reason: format!(
                "pixel buffer does not match {}x{}",
                job.frame.width, job.frame.height
            ),
        }
    })?;

    if let Some(scale) = cursor_scale {
        draw_cursor_marker(
            &mut image,
            job.cursor.x * scale as f64,
            job.cursor.y * scale as f64,
            scale,
        );
    }

    image
        .save_with_format(&path, ImageFormat::Png)
        .map_err(|e| RecorderError::FrameWrite {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(path)
}
