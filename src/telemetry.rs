//! Tracing setup for drivers and tests.

use tracing_subscriber::EnvFilter;

/// Installs a compact `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Calling it more than once is harmless; only the first call installs a subscriber.
///
/// ```text
/// RUST_LOG=stepgraph=debug cargo test
/// ```
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
