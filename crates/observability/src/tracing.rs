//! Tracing subscriber installation.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, with timestamps.
    Json,
    /// Human-readable single lines, captured by the test harness.
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    pub fn for_tests() -> Self {
        Self {
            default_filter: "warn".to_string(),
            format: LogFormat::Compact,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init(config: LogConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(false);

    match config.format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
            .is_ok(),
        LogFormat::Compact => builder.compact().with_test_writer().try_init().is_ok(),
    }
}
