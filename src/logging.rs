//! Structured logging set-up (ambient stack, §5's `log_level` config field).
//!
//! Mirrors the teacher's own `init_logging`: an `EnvFilter`-driven
//! `tracing_subscriber` with target and thread-id annotations, so every
//! `tracing` call the engine makes downstream resolves against the
//! configured level string (e.g. `"info"`, `"derived_values_engine=debug"`).

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ProcessingError, Result};

/// Install the global `tracing` subscriber for `level`. Returns
/// `ProcessingError::Config` if `level` does not parse as an `EnvFilter`
/// directive, or if a subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| ProcessingError::Config(format!("invalid log level {level:?}: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| ProcessingError::Config("logging already initialized".into()))
}
