//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Install a JSON `fmt` subscriber filtered by `RUST_LOG`, or by `default_directives`
/// when `RUST_LOG` is unset or unparsable.
pub fn init(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        ::tracing::debug!(default_directives, "tracing initialized");
    }
}
