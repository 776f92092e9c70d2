/// Structured logging setup shared by library consumers and tests.
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize logging with environment-based level filtering.
///
/// Targets stderr so token output on stdout stays clean for callers that
/// pipe completions.
pub fn init_logging() {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("noctua=debug".parse().unwrap())
        .add_directive("info".parse().unwrap());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Logging system initialized");
}

/// Initialize logging for tests with captured output.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
