//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize logging with `RUST_LOG` filtering.
///
/// Falls back to `default_level` (e.g. "info") when `RUST_LOG` is unset.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
