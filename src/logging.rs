//! Diagnostic tracing for autoloop.
//!
//! Verification output and iteration history are product data and go to
//! the datastore; this module only controls developer diagnostics on
//! stderr, so stdout stays clean for command output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `warn`, or
/// `autoloop=debug` with `--verbose`.
///
/// ```bash
/// RUST_LOG=autoloop::orchestrator=debug autoloop run 12
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "autoloop=debug,warn" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
