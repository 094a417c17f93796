//! External video encoder
//!
//! Frames are piped as raw RGBA8 into an ffmpeg child process producing a
//! VP9 WebM with an alpha channel.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::error::{EncoderError, EncoderResult};

/// Default time allowed for the encoder to finish after its input closes
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Wait slice while polling the encoder for exit; bounds how long a
/// [`KillSwitch`] waits for the process lock
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Sink for raw frames, closed exactly once
pub trait VideoEncoder: Send {
    /// Writes one frame of raw RGBA8 pixels
    fn write(&mut self, frame: &[u8]) -> EncoderResult<()>;

    /// Ends the input and waits for the encoder to finish
    fn close(&mut self) -> EncoderResult<()>;

    /// Handle that ends the encoder from another thread, even while a
    /// `write` is blocked
    fn kill_switch(&self) -> Option<Arc<dyn KillSwitch>> {
        None
    }
}

/// Forcibly ends an encoder from outside its worker thread
pub trait KillSwitch: Send + Sync {
    fn kill(&self);
}

/// Creates the encoder once the output geometry is known
pub trait EncoderFactory: Send + Sync {
    fn open(&self, spec: &EncoderSpec) -> EncoderResult<Box<dyn VideoEncoder>>;
}

/// Encoding quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    #[default]
    Low,
    Medium,
    High,
}

/// VP9 parameters derived from a [`QualityPreset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderTuning {
    pub crf: u8,
    pub deadline: &'static str,
    pub cpu_used: u8,
}

impl QualityPreset {
    pub fn tuning(&self) -> EncoderTuning {
        match self {
            QualityPreset::Low => EncoderTuning {
                crf: 28,
                deadline: "realtime",
                cpu_used: 8,
            },
            QualityPreset::Medium => EncoderTuning {
                crf: 23,
                deadline: "good",
                cpu_used: 4,
            },
            QualityPreset::High => EncoderTuning {
                crf: 18,
                deadline: "good",
                cpu_used: 1,
            },
        }
    }
}

/// Everything needed to start an encoder
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    /// Encoder executable
    pub program: String,
    pub width: u32,
    pub height: u32,
    /// Nominal input frame rate
    pub fps: f64,
    pub quality: QualityPreset,
    pub output: PathBuf,
    pub exit_timeout: Duration,
}

impl EncoderSpec {
    /// Size of one raw RGBA8 frame
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Command line arguments for ffmpeg
    pub fn args(&self) -> Vec<String> {
        let tuning = self.quality.tuning();
        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostats",
            "-loglevel",
            "warning",
            "-f",
            "rawvideo",
            "-vcodec",
            "rawvideo",
            "-s",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push(format!("{}x{}", self.width, self.height));
        args.extend(["-pix_fmt", "rgba", "-r"].map(String::from));
        args.push(format!("{}", self.fps));
        args.extend(
            [
                "-i",
                "-",
                "-an",
                "-vcodec",
                "libvpx-vp9",
                "-pix_fmt",
                "yuva420p",
                "-crf",
            ]
            .map(String::from),
        );
        args.push(tuning.crf.to_string());
        args.extend(["-b:v", "0", "-auto-alt-ref", "0", "-deadline"].map(String::from));
        args.push(tuning.deadline.to_string());
        args.push("-cpu-used".to_string());
        args.push(tuning.cpu_used.to_string());
        args.extend(["-vsync", "vfr", "-y"].map(String::from));
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Kills the encoder process; a blocked write then fails with a broken pipe
struct ProcessKill {
    child: Arc<Mutex<Child>>,
}

impl KillSwitch for ProcessKill {
    fn kill(&self) {
        let mut child = self.child.lock();
        match child.kill() {
            Ok(()) => warn!("Encoder process {} killed", child.id()),
            Err(e) => debug!("Encoder process already gone: {}", e),
        }
    }
}

/// Waits up to `timeout` for the process to exit, killing it afterwards
///
/// The lock is only held for one [`EXIT_POLL`] slice at a time so a
/// [`KillSwitch`] can get in between.
fn wait_for_exit(child: &Mutex<Child>, timeout: Duration) -> EncoderResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let waited = child.lock().wait_timeout(EXIT_POLL);
        match waited {
            Ok(Some(status)) if status.success() => {
                info!("Encoder finished");
                return Ok(());
            }
            Ok(Some(status)) => return Err(EncoderError::ExitStatus(status.to_string())),
            Ok(None) if Instant::now() < deadline => {}
            Ok(None) => {
                warn!("Encoder still running after {:?}, killing it", timeout);
                let mut child = child.lock();
                let _ = child.kill();
                let _ = child.wait();
                return Err(EncoderError::Timeout(timeout));
            }
            Err(e) => return Err(EncoderError::ExitStatus(e.to_string())),
        }
    }
}

/// Encoder backed by an ffmpeg child process
pub struct FfmpegEncoder {
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<JoinHandle<()>>,
    frame_bytes: usize,
    exit_timeout: Duration,
    closed: bool,
}

impl FfmpegEncoder {
    /// Spawns the encoder process
    pub fn spawn(spec: &EncoderSpec) -> EncoderResult<Self> {
        info!(
            "Starting encoder {} ({}x{} @ {} fps, {:?}) -> {}",
            spec.program,
            spec.width,
            spec.height,
            spec.fps,
            spec.quality,
            spec.output.display()
        );

        let mut child = Command::new(&spec.program)
            .args(spec.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stderr_drain = child.stderr.take().and_then(|stderr| {
            thread::Builder::new()
                .name("encoder-stderr".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        debug!("encoder: {}", line);
                    }
                })
                .map_err(|e| warn!("Failed to spawn encoder stderr reader: {}", e))
                .ok()
        });

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stderr_drain,
            frame_bytes: spec.frame_bytes(),
            exit_timeout: spec.exit_timeout,
            closed: false,
        })
    }

    /// Process id of the encoder
    pub fn id(&self) -> u32 {
        self.child.lock().id()
    }

    fn join_stderr(&mut self) {
        if let Some(handle) = self.stderr_drain.take() {
            let _ = handle.join();
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn write(&mut self, frame: &[u8]) -> EncoderResult<()> {
        if frame.len() != self.frame_bytes {
            return Err(EncoderError::FrameSize {
                expected: self.frame_bytes,
                actual: frame.len(),
            });
        }
        let stdin = self.stdin.as_mut().ok_or(EncoderError::Closed)?;
        stdin.write_all(frame).map_err(EncoderError::Write)
    }

    fn close(&mut self) -> EncoderResult<()> {
        if self.closed {
            return Err(EncoderError::Closed);
        }
        self.closed = true;

        // EOF on stdin tells the encoder to finish the file
        drop(self.stdin.take());

        let result = wait_for_exit(&self.child, self.exit_timeout);
        self.join_stderr();
        result
    }

    fn kill_switch(&self) -> Option<Arc<dyn KillSwitch>> {
        Some(Arc::new(ProcessKill {
            child: Arc::clone(&self.child),
        }))
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if !self.closed {
            drop(self.stdin.take());
            {
                let mut child = self.child.lock();
                let _ = child.kill();
                let _ = child.wait();
            }
            self.join_stderr();
        }
    }
}

/// Opens [`FfmpegEncoder`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegEncoderFactory;

impl EncoderFactory for FfmpegEncoderFactory {
    fn open(&self, spec: &EncoderSpec) -> EncoderResult<Box<dyn VideoEncoder>> {
        Ok(Box::new(FfmpegEncoder::spawn(spec)?))
    }
}
