// Logging setup
//
// Console or log file output through tracing-subscriber. The filter comes
// from RUST_LOG / LOG_LEVEL, falling back to the configured debug level.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Log filter (e.g., "info", "gearcheck_worker=debug")
    pub log_filter: Option<String>,
    /// Append to this file instead of writing to stdout
    pub logfile: Option<PathBuf>,
}

impl TelemetryConfig {
    /// Read the filter from `RUST_LOG` or `LOG_LEVEL`
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .or_else(|_| std::env::var("LOG_LEVEL"))
                .ok()
                .filter(|f| !f.is_empty()),
            logfile: None,
        }
    }

    /// Use the level for `debug` unless a filter is already set
    pub fn with_debug(mut self, debug: u8) -> Self {
        if self.log_filter.is_none() {
            self.log_filter = Some(debug_filter(debug).to_string());
        }
        self
    }

    pub fn with_logfile(mut self, logfile: Option<PathBuf>) -> Self {
        self.logfile = logfile;
        self
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_deref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Filter directive for a configured debug level
pub fn debug_filter(debug: u8) -> &'static str {
    match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber
///
/// Fails only when the log file cannot be opened.
pub fn init_telemetry(config: TelemetryConfig) -> std::io::Result<()> {
    let filter = config.filter();

    match &config.logfile {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file))
                        .with_filter(filter),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_filter(filter),
                )
                .init();
        }
    }
    Ok(())
}
