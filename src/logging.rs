//! Log output setup
//!
//! Pipeline threads log through `tracing` macros; the binary installs one
//! `fmt` subscriber here. Thread names are printed on every line because
//! most events come from `frame-producer`, `telemetry-flush` and the sink
//! workers rather than from the main thread.

use tracing_subscriber::{fmt, EnvFilter};

/// Verbosity of the recorder's own events
///
/// Dependencies stay at `warn` unless `RUST_LOG` says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// `-v` raises info to debug, `-vv` and beyond to trace
    pub fn from_verbosity(verbosity: u8) -> Self {
        [LogLevel::Info, LogLevel::Debug, LogLevel::Trace][usize::from(verbosity.min(2))]
    }

    fn name(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Filter used when `RUST_LOG` is unset or empty
    fn directives(self) -> String {
        format!("warn,{}={}", env!("CARGO_CRATE_NAME"), self.name())
    }
}

fn filter_for(level: LogLevel, env: Option<String>) -> EnvFilter {
    match env {
        Some(spec) if !spec.trim().is_empty() => EnvFilter::new(spec),
        _ => EnvFilter::new(level.directives()),
    }
}

/// Installs the global subscriber
///
/// `RUST_LOG` replaces the level-derived filter entirely, e.g.
/// `RUST_LOG=cursor_recorder::sink=trace`. Calling this again after a
/// subscriber is installed only logs a debug event.
///
/// ```no_run
/// use cursor_recorder::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::from_verbosity(1));
/// ```
pub fn init_logging(level: LogLevel) {
    let filter = filter_for(level, std::env::var(EnvFilter::DEFAULT_ENV).ok());
    let installed = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();

    if installed.is_err() {
        tracing::debug!("Logging already initialised, keeping the existing subscriber");
    }
}

/// Installs the subscriber at [`LogLevel::Info`]
pub fn init_default_logging() {
    init_logging(LogLevel::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_steps() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Trace);
        assert_eq!(LogLevel::from_verbosity(u8::MAX), LogLevel::Trace);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_directives_quiet_dependencies() {
        assert_eq!(LogLevel::Debug.directives(), "warn,cursor_recorder=debug");
        assert_eq!(LogLevel::Error.directives(), "warn,cursor_recorder=error");
    }

    #[test]
    fn test_env_overrides_level() {
        let filter = filter_for(LogLevel::Info, Some("cursor_recorder::sink=trace".into()));
        assert_eq!(
            filter.to_string().to_lowercase(),
            "cursor_recorder::sink=trace"
        );

        let blank = filter_for(LogLevel::Trace, Some("  ".into()));
        assert!(blank
            .to_string()
            .to_lowercase()
            .contains("cursor_recorder=trace"));
    }

    #[test]
    fn test_second_init_is_harmless() {
        init_logging(LogLevel::Warn);
        init_logging(LogLevel::Trace);
    }
}
