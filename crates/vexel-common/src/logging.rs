use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "VEXEL_LOG";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize structured logging with environment filter.
/// Set VEXEL_LOG=debug (or trace, info, warn, error) for verbosity control.
/// Thread ids are always printed since queue leases are owned per thread.
pub fn init_logging() {
    fmt()
        .with_env_filter(env_filter("info"))
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Logging for integration tests. Safe to call from every test; only the
/// first call installs the subscriber.
pub fn init_test_logging() {
    let _ = fmt()
        .with_env_filter(env_filter("warn"))
        .with_thread_ids(true)
        .with_test_writer()
        .try_init();
}
