//! cursor-recorder - records pointer telemetry with desktop snapshots
//!
//! This is the main entry point: it loads the configuration, starts a
//! recording and stops it on Ctrl+C.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use cursor_recorder::{
    config::{CaptureBackend, Config, ConfigManager},
    desktop,
    logging::{init_logging, LogLevel},
    sink::SinkMode,
    Recorder,
};
use tracing::{info, warn};

/// Period of the status line
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// How often the main loop checks for a pipeline that stopped itself
const FAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const USAGE: &str = "usage: cursor-recorder [-v|-vv] [--config <file>] [--mode files|video] [--tag <tag>]";

/// Command line overrides
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    verbosity: u8,
    mode: Option<SinkMode>,
    tag: Option<String>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Args::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-v" => parsed.verbosity += 1,
                "-vv" => parsed.verbosity += 2,
                "-c" | "--config" => {
                    parsed.config = Some(args.next().context("--config needs a path")?.into())
                }
                "--mode" => {
                    parsed.mode = Some(match args.next().as_deref() {
                        Some("files") => SinkMode::Files,
                        Some("video") => SinkMode::Video,
                        other => bail!("unknown mode {:?}\n{}", other, USAGE),
                    })
                }
                "--tag" => parsed.tag = Some(args.next().context("--tag needs a value")?),
                "-h" | "--help" => {
                    println!("{}", USAGE);
                    std::process::exit(0);
                }
                other => bail!("unexpected argument '{}'\n{}", other, USAGE),
            }
        }
        Ok(parsed)
    }

    fn apply(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.output.mode = mode;
        }
        if let Some(tag) = &self.tag {
            config.output.tag = Some(tag.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;
    init_logging(LogLevel::from_verbosity(args.verbosity));

    info!("Starting cursor-recorder v{}", env!("CARGO_PKG_VERSION"));

    let config_manager = match &args.config {
        Some(path) => ConfigManager::with_file(path),
        None => ConfigManager::new()?,
    };
    let mut config = config_manager
        .load_or_create_default()
        .with_context(|| format!("loading {}", config_manager.config_file().display()))?;
    args.apply(&mut config);
    config.validate()?;

    info!("Configuration loaded from: {:?}", config_manager.config_file());
    info!("Capture - Backend: {:?}", config.capture.backend);
    info!("Capture - Interval: {:?}", config.capture_interval());
    info!("Capture - Downscale: {}", config.capture.downscale);
    info!("Output - Mode: {}", config.output.mode);
    info!("Output - Directory: {}", config.output.directory.display());

    if config.capture.backend == CaptureBackend::Synthetic {
        warn!("Synthetic capture backend selected: frames and pointer are simulated");
    }
    let session = desktop::open_session(config.capture.backend)?;
    let mut recorder = Recorder::new(config)?;
    recorder.start(session).context("starting recording")?;

    info!("Recording. Press Ctrl+C to stop.");

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    let mut fault_poll = tokio::time::interval(FAULT_POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("listening for Ctrl+C")?;
                info!("Interrupt received, stopping");
                break;
            }
            _ = status.tick() => {
                if let Some(status) = recorder.status() {
                    info!("Status - {}", status);
                }
            }
            _ = fault_poll.tick() => {
                if !recorder.is_running() {
                    warn!("Pipeline stopped on its own, shutting down");
                    break;
                }
            }
        }
    }

    // Teardown joins threads and waits on the encoder
    let report = tokio::task::spawn_blocking(move || recorder.stop())
        .await
        .context("stop task failed")??;

    info!(
        "Recorded {} frames ({} dropped), {} telemetry rows",
        report.frames_produced, report.frames_dropped, report.telemetry_rows_written
    );
    info!("Session summary: {}", report.output.report.display());
    if !report.cleanup_errors.is_empty() {
        warn!("{} cleanup problems, see the session summary", report.cleanup_errors.len());
    }

    info!("cursor-recorder stopped.");
    Ok(())
}
