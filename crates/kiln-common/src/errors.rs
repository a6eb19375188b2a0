use thiserror::Error;

/// Stable error taxonomy for the Worker's inbound operations.
///
/// Every inbound operation (`launch_builtin_model`, `terminate_model`, ...)
/// returns `Result<T, WorkerError>` so that callers — the Supervisor, a CLI,
/// or a test harness — can match on the variant rather than parse message
/// text.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("model {0} already launching or already launched")]
    Conflict(String),

    #[error("no slot available: {0}")]
    NoSlot(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("worker busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("model {0} is not currently launching")]
    NotLaunching(String),

    #[error("launch of {0} was cancelled")]
    Cancelled(String),

    #[error("downstream failure: {0}")]
    Downstream(#[source] anyhow::Error),

    #[error("transient failure, retry may succeed: {0}")]
    Transient(String),
}

impl WorkerError {
    /// Whether a caller could reasonably retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::Transient(_) | WorkerError::Busy(_))
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
