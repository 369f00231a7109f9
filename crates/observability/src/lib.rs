//! Process-wide tracing setup shared by every binary that embeds the invoicing core.

/// Initialize tracing from the process environment.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(&tracing::LogSettings::from_env());
}

/// Route tracing output through the libtest capture so it only shows for
/// failing tests.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;
