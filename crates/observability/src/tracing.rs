//! Tracing/logging initialization.
//!
//! Workers log structured JSON with tenant/document/job correlation fields;
//! verbosity comes from `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}
