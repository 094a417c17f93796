//! Cursor telemetry
//!
//! One record per producer tick, buffered in memory and appended to a CSV
//! log in batches.

pub mod batcher;
pub mod log;
pub mod record;

pub use batcher::{TelemetryBatcher, TelemetryBuffer, TelemetryReport, DEFAULT_FLUSH_INTERVAL};
pub use log::{CsvTelemetryLog, TelemetryWriter};
pub use record::{FrameReference, FrameStatus, LogLayout, ReferenceStyle, TelemetryRecord};
