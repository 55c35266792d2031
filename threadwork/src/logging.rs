//! Tracing setup for the engine and the operator CLI.
//!
//! Diagnostics only: thread records under the data directory are the durable
//! output and are written regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=threadwork=debug threadwork threads list
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A host application may already have installed one.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
