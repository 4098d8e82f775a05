//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt};

/// Initialize structured logging. Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Initialize with an explicit filter directive, for tests and embedding.
pub fn init_with_filter(directive: &str) {
    let filter = EnvFilter::new(directive);
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
