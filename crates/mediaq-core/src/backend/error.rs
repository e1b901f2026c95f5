//! Backend error type; cancellation is kept distinct from real failures.

/// Error returned by metadata resolution or execution.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The job's cancellation token fired. An expected outcome, never stored
    /// as the job's error.
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed metadata: {0}")]
    Parse(#[from] serde_json::Error),
}

impl BackendError {
    pub fn failed(message: impl Into<String>) -> Self {
        BackendError::Failed(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackendError::Cancelled)
    }
}
