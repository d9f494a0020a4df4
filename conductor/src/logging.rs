//! Diagnostic tracing for the conductor.
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//! - **Reports (`io/report`)** and **notifications (`io/notifier`)**: product
//!   artifacts, always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. When unset, defaults to `warn`, or `conductor=debug` when
/// `debug` is set (the config `debug` flag).
///
/// # Example
/// ```bash
/// RUST_LOG=conductor=debug conductor run workflow.toml
/// ```
pub fn init(debug: bool) {
    let fallback = if debug { "conductor=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
