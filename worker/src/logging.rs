//! Tracing setup for the worker binary.
//!
//! Diagnostics only. Evaluation results and completion outcomes go to the
//! store, never through the log.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` is used (for
/// example `"info"` or `"hypersearch_worker=debug"`). An unparsable directive
/// falls back to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=hypersearch_worker=debug hsworker run --job-id 1 --model-id 2 ...
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
