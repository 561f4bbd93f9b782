//! Subscriber setup for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{ReclaimError, Result};

/// Installs a stderr subscriber filtered by `level`, an `EnvFilter`
/// directive such as `info` or `reclaim::vacuum=debug`.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| ReclaimError::Config(format!("invalid log level: {e}")))?,
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| ReclaimError::Config("logging already initialized".into()))
}
