//! Process-wide logging setup shared by tidecrm binaries.

/// Initialize tracing with the default filter (`info`, overridable via `RUST_LOG`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init("info");
}

/// Tracing subscriber configuration (filters, formatting).
pub mod tracing;
