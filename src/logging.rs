//! Shared logging configuration for the server and client binaries.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. The `LOG_LEVEL` environment
/// variable governs verbosity (any `EnvFilter` directive); the default shows
/// warnings and errors only.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}
