//! Error types for the recorder
//!
//! This module defines all error types used throughout the crate.
//! Each pipeline stage has its own error family; `RecorderError` is the
//! umbrella type returned by the lifecycle controller.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the recorder
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Display enumeration and capture errors
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// External encoder errors
    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    /// Telemetry log errors
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// `start()` called on a recorder that already started
    #[error("Recorder has already been started")]
    AlreadyStarted,

    /// `stop()` called on a recorder that is not running
    #[error("Recorder is not running")]
    NotRunning,

    /// A pipeline thread could not be spawned
    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A frame could not be persisted by the file sink
    #[error("Failed to write frame {path}: {reason}")]
    FrameWrite { path: String, reason: String },

    /// A pipeline thread panicked
    #[error("{0} thread panicked")]
    ThreadPanicked(String),

    /// A pipeline thread did not finish within its shutdown deadline
    #[error("{name} thread did not stop within {timeout:?} and was abandoned")]
    StopTimeout { name: String, timeout: Duration },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Failed to create directory: {0}")]
    DirectoryCreationFailed(String),
}

/// Display geometry and frame grab errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No active display reported by the system")]
    NoActiveDisplay,

    #[error("Failed to enumerate displays: {0}")]
    Enumeration(String),

    #[error("Failed to grab frame: {0}")]
    Grab(String),

    #[error(
        "Capture backend '{0}' is not available in this build; rebuild with \
         `--features native` or set `backend = \"synthetic\"` under [capture]"
    )]
    BackendUnavailable(String),

    #[error("Capture session already released")]
    Released,
}

/// External encoder errors
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Failed to start encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write frame to encoder: {0}")]
    Write(#[source] io::Error),

    #[error("Encoder exited with {0}")]
    ExitStatus(String),

    #[error("Encoder did not exit within {0:?} and was killed")]
    Timeout(Duration),

    #[error("Frame is {actual} bytes, encoder expects {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Frame {sequence} arrived after frame {last}")]
    OutOfOrder { last: u64, sequence: u64 },

    #[error("Encoder input already closed")]
    Closed,
}

/// Telemetry log errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to open telemetry log {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to append to telemetry log: {0}")]
    Append(String),
}

/// Type alias for Results using RecorderError
pub type Result<T> = std::result::Result<T, RecorderError>;

/// Type alias for Config Results
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Type alias for Capture Results
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Type alias for Encoder Results
pub type EncoderResult<T> = std::result::Result<T, EncoderError>;

/// Type alias for Telemetry Results
pub type TelemetryResult<T> = std::result::Result<T, TelemetryError>;

impl From<serde_json::Error> for RecorderError {
    fn from(err: serde_json::Error) -> Self {
        RecorderError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RecorderError {
    fn from(err: toml::de::Error) -> Self {
        RecorderError::Config(ConfigError::LoadFailed(err.to_string()))
    }
}

impl From<toml::ser::Error> for RecorderError {
    fn from(err: toml::ser::Error) -> Self {
        RecorderError::Config(ConfigError::SaveFailed(err.to_string()))
    }
}

impl From<csv::Error> for TelemetryError {
    fn from(err: csv::Error) -> Self {
        TelemetryError::Append(err.to_string())
    }
}

impl EncoderError {
    /// Returns true when the error means the encoder can no longer accept input
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EncoderError::FrameSize { .. })
    }
}
