//! Errors returned synchronously by scheduler operations.

use crate::job::{JobId, JobState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),
    /// Another job still in the collection has the same target.
    #[error("already queued: {0}")]
    DuplicateTarget(String),
    #[error("job id already in use: {0}")]
    DuplicateId(JobId),
    /// Retry requires a failed or cancelled job with no execution attached.
    #[error("job {id} cannot be retried while {state}")]
    NotRetryable { id: JobId, state: JobState },
    #[error("scheduler is shut down")]
    ShuttingDown,
}
