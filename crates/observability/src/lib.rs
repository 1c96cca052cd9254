//! Process-wide tracing setup shared by services and tests.

/// Initialize tracing for a service process: JSON lines, filter from
/// `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogConfig::default());
}

/// Initialize tracing for tests: compact output through the test harness
/// writer, filter from `RUST_LOG` (default `warn`).
pub fn init_for_tests() {
    tracing::init(tracing::LogConfig::for_tests());
}

/// Tracing configuration (filters, formats).
pub mod tracing;
