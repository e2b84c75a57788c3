use thiserror::Error;

/// Unified error type for the task system.
///
/// Enqueue-time failures (`Validation`, `QuotaExceeded`) are surfaced
/// synchronously to the caller; execution-time failures travel on the task
/// itself and never crash the pool.
#[derive(Debug, Error)]
pub enum OmniqError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("task not found: {id}")]
    TaskNotFound { id: String },
    #[error("message queue error: {0}")]
    MessageQueue(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type OmniqResult<T> = Result<T, OmniqError>;

impl OmniqError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn quota<S: Into<String>>(msg: S) -> Self {
        Self::QuotaExceeded(msg.into())
    }
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    /// Whether a caller may reasonably retry the failed operation after a
    /// backoff. Quota rejections do not count against a task's attempts
    /// because the task was never admitted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OmniqError::MessageQueue(_) | OmniqError::Timeout(_) | OmniqError::QuotaExceeded(_)
        )
    }
}

impl From<serde_json::Error> for OmniqError {
    fn from(err: serde_json::Error) -> Self {
        OmniqError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OmniqError {
    fn from(err: anyhow::Error) -> Self {
        OmniqError::Internal(err.to_string())
    }
}
