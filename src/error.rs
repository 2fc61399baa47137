use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Errors surfaced by the processing engine.
///
/// `SelfTrigger`, `CutoffBlocked`, and `SyncMismatch` from the design are
/// deliberately absent here: they are logged/counted outcomes, not failures,
/// and are tracked through [`crate::db::metrics::Stats`] instead.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// A batch could not proceed within its memory cap. Recovered locally by
    /// the controller: clear the cache, shrink the batch limit, retry.
    #[error("memory limit exceeded while building batch")]
    MemoryLimit,

    /// The external store rejected or failed a query/update.
    #[error("store access failed: {0}")]
    StoreAccess(String),

    /// A downstream collaborator (receptionist, alerter, control point) did
    /// not respond during a refresh.
    #[error("service not available: {0}")]
    ServiceNotAvailable(String),

    /// Cooperative cancellation requested mid-batch; the batch is abandoned
    /// without a commit.
    #[error("processing interrupted")]
    Interrupted,

    /// Configuration failed validation at start-up.
    #[error("configuration error: {0}")]
    Config(String),

    /// Trace stream I/O failure.
    #[error("trace I/O error: {0}")]
    Io(#[from] io::Error),
}
