//! Configuration management for the recorder
//!
//! This module handles recorder configuration including:
//! - Loading and saving configuration files
//! - Locating the platform configuration directory
//! - Providing sensible defaults
//! - Configuration validation

use crate::desktop::types::{Fps, DEFAULT_DOWNSCALE, DEFAULT_FPS, MAX_FPS, MIN_FPS};
use crate::error::{ConfigError, ConfigResult};
use crate::sink::encoder::QualityPreset;
use crate::sink::SinkMode;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Constants for configuration (avoiding magic numbers)
const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_OUTPUT_DIRECTORY: &str = "__cursor_data";
const DEFAULT_ERROR_BACKOFF_MS: u64 = 1000;
const DEFAULT_WORKERS: usize = 3;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;
const DEFAULT_ENCODER_PROGRAM: &str = "ffmpeg";
const DEFAULT_EXIT_TIMEOUT_MS: u64 = 15_000;

/// Recorder configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture loop configuration
    pub capture: CaptureConfig,

    /// Output files configuration
    pub output: OutputConfig,

    /// Channel and sink configuration
    pub pipeline: PipelineConfig,

    /// Telemetry log configuration
    pub telemetry: TelemetryConfig,

    /// Video encoder configuration
    pub encoder: EncoderConfig,
}

/// Where frames and pointer positions come from
///
/// Defaults to the real desktop in every build. A build without the
/// `native` feature refuses to start rather than record synthetic frames;
/// the synthetic display must be asked for explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Virtual display with a moving pointer
    Synthetic,
    /// The real desktop (requires the `native` feature)
    #[default]
    Native,
}

/// Capture loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Target frame rate
    pub fps: Fps,

    /// Explicit tick period; overrides `fps` when set
    pub capture_interval_ms: Option<u64>,

    /// Downscale factor applied to every frame (0 < S <= 1)
    pub downscale: f32,

    /// Pause after a failed tick
    pub error_backoff_ms: u64,

    /// Capture backend
    pub backend: CaptureBackend,
}

/// Output files configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving frames, video, telemetry and the session summary
    pub directory: PathBuf,

    /// Session tag used in file names; defaults to the start time
    pub tag: Option<String>,

    /// Pooled PNG files or a single video stream
    pub mode: SinkMode,

    /// Draw the cursor marker into saved PNGs
    pub draw_cursor: bool,
}

/// Channel and sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Channel capacity; defaults depend on the output mode
    pub channel_capacity: Option<usize>,

    /// File writer threads
    pub workers: usize,

    /// Time allowed for queued frames to drain on stop
    pub drain_timeout_ms: u64,
}

/// Telemetry log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Flush period of the telemetry batcher
    pub flush_interval_ms: u64,
}

/// Video encoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encoder executable
    pub program: String,

    /// Quality preset
    pub quality: QualityPreset,

    /// Time allowed for the encoder to exit after its input closes
    pub exit_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            capture_interval_ms: None,
            downscale: DEFAULT_DOWNSCALE,
            error_backoff_ms: DEFAULT_ERROR_BACKOFF_MS,
            backend: CaptureBackend::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_OUTPUT_DIRECTORY),
            tag: None,
            mode: SinkMode::Files,
            draw_cursor: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: None,
            workers: DEFAULT_WORKERS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_ENCODER_PROGRAM.to_string(),
            quality: QualityPreset::default(),
            exit_timeout_ms: DEFAULT_EXIT_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Producer tick period
    pub fn capture_interval(&self) -> Duration {
        match self.capture.capture_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(1000 / self.capture.fps.max(1) as u64),
        }
    }

    /// Channel capacity for the configured mode
    pub fn channel_capacity(&self) -> usize {
        self.pipeline
            .channel_capacity
            .unwrap_or_else(|| self.output.mode.default_capacity())
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.capture.error_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.drain_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry.flush_interval_ms)
    }

    pub fn encoder_exit_timeout(&self) -> Duration {
        Duration::from_millis(self.encoder.exit_timeout_ms)
    }

    /// Validates configuration values
    pub fn validate(&self) -> ConfigResult<()> {
        // Validate FPS (1-60)
        if self.capture.fps < MIN_FPS || self.capture.fps > MAX_FPS {
            return Err(ConfigError::InvalidValue(format!(
                "FPS must be between {} and {}",
                MIN_FPS, MAX_FPS
            )));
        }

        if self.capture.capture_interval_ms == Some(0) {
            return Err(ConfigError::InvalidValue(
                "Capture interval must be greater than zero".to_string(),
            ));
        }

        // Validate downscale (0 < S <= 1)
        if !(self.capture.downscale > 0.0 && self.capture.downscale <= 1.0) {
            return Err(ConfigError::InvalidValue(
                "Downscale must be in (0, 1]".to_string(),
            ));
        }

        if self.channel_capacity() == 0 {
            return Err(ConfigError::InvalidValue(
                "Channel capacity must be at least 1".to_string(),
            ));
        }

        if self.pipeline.workers == 0 || self.pipeline.workers > 64 {
            return Err(ConfigError::InvalidValue(
                "Worker count must be between 1 and 64".to_string(),
            ));
        }

        if self.telemetry.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "Telemetry flush interval must be greater than zero".to_string(),
            ));
        }

        if self.encoder.program.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "Encoder program must not be empty".to_string(),
            ));
        }

        if let Some(tag) = &self.output.tag {
            if tag.is_empty() || tag.contains(['/', '\\']) {
                return Err(ConfigError::InvalidValue(format!(
                    "Invalid session tag '{}'",
                    tag
                )));
            }
        }

        Ok(())
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Creates a ConfigManager for the platform configuration directory
    ///
    /// # Errors
    ///
    /// Returns error if project directory cannot be determined
    pub fn new() -> ConfigResult<Self> {
        let config_dir = Self::get_config_directory()?;
        let config_file = config_dir.join(CONFIG_FILE_NAME);

        Ok(Self {
            config_dir,
            config_file,
        })
    }

    /// Creates a ConfigManager for an explicit configuration file
    pub fn with_file(path: impl AsRef<Path>) -> Self {
        let config_file = path.as_ref().to_path_buf();
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            config_dir,
            config_file,
        }
    }

    /// Gets the configuration directory path
    fn get_config_directory() -> ConfigResult<PathBuf> {
        ProjectDirs::from("com", "cursorrecorder", "CursorRecorder")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::DirectoryNotFound(
                    "Could not determine configuration directory".to_string(),
                )
            })
    }

    /// Ensures the configuration directory exists
    fn ensure_config_directory(&self) -> ConfigResult<()> {
        if !self.config_dir.as_os_str().is_empty() && !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).map_err(|e| {
                ConfigError::DirectoryCreationFailed(format!(
                    "Failed to create config directory at {:?}: {}",
                    self.config_dir, e
                ))
            })?;
        }
        Ok(())
    }

    /// Loads configuration from file, or creates default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or created
    pub fn load_or_create_default(&self) -> ConfigResult<Config> {
        self.ensure_config_directory()?;

        if self.config_file.exists() {
            self.load()
        } else {
            let config = Config::default();
            self.save(&config)?;
            Ok(config)
        }
    }

    /// Loads configuration from file
    pub fn load(&self) -> ConfigResult<Config> {
        let content = fs::read_to_string(&self.config_file).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to read config file: {}", e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be saved
    pub fn save(&self, config: &Config) -> ConfigResult<()> {
        self.ensure_config_directory()?;
        config.validate()?;

        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&self.config_file, content).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Gets the configuration file path
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Gets the configuration directory path
    pub fn config_directory(&self) -> &PathBuf {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.capture.fps, 10);
        assert_eq!(config.capture_interval(), Duration::from_millis(100));
        assert_eq!(config.capture.downscale, 0.5);
        assert_eq!(config.output.directory, PathBuf::from("__cursor_data"));
        assert_eq!(config.channel_capacity(), 1000);
        assert_eq!(config.pipeline.workers, 3);
        assert_eq!(config.flush_interval(), Duration::from_millis(500));
        assert_eq!(config.encoder.quality, QualityPreset::Low);
        assert_eq!(config.capture.backend, CaptureBackend::Native);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_dependent_capacity() {
        let mut config = Config::default();
        config.output.mode = SinkMode::Video;
        assert_eq!(config.channel_capacity(), 300);

        config.pipeline.channel_capacity = Some(5);
        assert_eq!(config.channel_capacity(), 5);
    }

    #[test]
    fn test_interval_overrides_fps() {
        let mut config = Config::default();
        config.capture.capture_interval_ms = Some(250);
        assert_eq!(config.capture_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.capture.fps = 0; // Invalid
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.downscale = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.output.tag = Some("a/b".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [capture]
            backend = "synthetic"

            [output]
            mode = "video"

            [encoder]
            quality = "high"
            "#,
        )
        .unwrap();

        assert_eq!(config.output.mode, SinkMode::Video);
        assert_eq!(config.encoder.quality, QualityPreset::High);
        assert_eq!(config.capture.backend, CaptureBackend::Synthetic);
        assert_eq!(config.capture.fps, 10);
    }

    #[test]
    fn test_load_or_create_default() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_file(dir.path().join("nested").join("config.toml"));

        let created = manager.load_or_create_default().unwrap();
        assert!(manager.config_file().exists());

        let loaded = manager.load_or_create_default().unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[capture]\nfps = 120\n").unwrap();

        let manager = ConfigManager::with_file(&path);
        assert!(matches!(
            manager.load(),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
