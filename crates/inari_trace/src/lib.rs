//! Tracing setup shared by the inari binaries and tests.
//!
//! Filtering is driven by the `INARI_TRACE` environment variable using the
//! usual `tracing_subscriber::EnvFilter` syntax, e.g.
//! `INARI_TRACE=inari_dht=debug,info`.

use tracing_subscriber::filter::EnvFilter;

const FILTER_ENV: &str = "INARI_TRACE";

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

pub type TraceResult<T> = Result<T, TraceError>;

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the process-wide subscriber. Called once from `main`.
pub fn init() -> TraceResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter("info"))
        .with_target(true)
        .try_init()
        .map_err(|e| TraceError::AlreadyInstalled(e.to_string()))
}

/// Subscriber for tests: quiet by default, never panics when a previous
/// test already installed one. Call as `inari_trace::test_run().ok();`.
pub fn test_run() -> TraceResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter("warn"))
        .with_test_writer()
        .try_init()
        .map_err(|e| TraceError::AlreadyInstalled(e.to_string()))
}
