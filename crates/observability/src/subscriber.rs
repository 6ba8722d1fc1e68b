//! Tracing/logging initialization.
//!
//! Structured JSON lines on stderr by default, filtered by `RUST_LOG`. The engine logs
//! with `account_id`, `invoice_id` and `tracking_id` fields, so JSON output can
//! be grepped per account.

use tracing_subscriber::EnvFilter;

/// Fallback filter when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    /// Human-readable, for local runs.
    Pretty,
}

/// Initialize tracing for the process: JSON output, `RUST_LOG` filter.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter, LogFormat::Json);
}

/// Initialize with explicit filter directives (e.g. `"cadence_infra=debug"`).
///
/// Invalid directives fall back to [`DEFAULT_FILTER`]. Returns whether this
/// call installed the global subscriber.
pub fn init_with(directives: &str, format: LogFormat) -> bool {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter, format)
}

fn install(filter: EnvFilter, format: LogFormat) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}
