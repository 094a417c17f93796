//! cursor-recorder - Pointer telemetry with multi-display snapshots
//!
//! This library records where the pointer is together with what the screen
//! looked like, including:
//! - Multi-display geometry and pointer coordinate conversion
//! - A fixed-rate capture loop feeding a bounded frame channel
//! - PNG frame files or a single transparent WebM video
//! - Batched CSV telemetry
//! - Configuration and logging infrastructure
//!
//! # Examples
//!
//! ```no_run
//! use cursor_recorder::{config::ConfigManager, desktop, logging, Recorder};
//!
//! // Initialize logging
//! logging::init_default_logging();
//!
//! // Load configuration
//! let config_manager = ConfigManager::new().unwrap();
//! let config = config_manager.load_or_create_default().unwrap();
//!
//! // Record until stopped
//! let session = desktop::open_session(config.capture.backend).unwrap();
//! let mut recorder = Recorder::new(config).unwrap();
//! recorder.start(session).unwrap();
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! let report = recorder.stop().unwrap();
//!
//! println!("{} frames recorded", report.frames_written);
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod desktop;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod recorder;
pub mod sink;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use error::{RecorderError, Result};
pub use recorder::{Recorder, RecorderStatus, SessionReport};
