//! Tracing/logging setup shared by every binary and test harness.

use serde::Deserialize;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable multi-line output.
    #[default]
    Pretty,
}

/// Initialize process-wide tracing with `RUST_LOG` (default `info`) and
/// pretty output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Pretty, "info");
}

/// Initialize tracing with an explicit format and fallback filter.
///
/// `RUST_LOG` still wins over `default_filter` when set.
pub fn init_with(format: LogFormat, default_filter: &str) {
    tracing::init(format, default_filter);
}

/// Tracing subscriber configuration (filters, layers).
pub mod tracing;
