//! Execution backend contract: resolve metadata, then transfer/produce output.
//!
//! The scheduler owns when and how often these are called; a backend only
//! has to honour the cancellation token promptly and report progress.

mod error;
mod process;
mod progress;

pub use error::BackendError;
pub use process::CommandBackend;
pub use progress::{BackendPhase, BackendProgress, ProgressReporter};
pub(crate) use progress::clamp_percent;
pub use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use std::path::PathBuf;

use crate::job::{Job, MediaMetadata};

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Resolves descriptive metadata for `target`. Must return
    /// [`BackendError::Cancelled`] soon after `cancel` fires.
    async fn resolve_metadata(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, BackendError>;

    /// Produces the job's output and returns the path of the produced file.
    ///
    /// Percent reported through `progress` must be non-decreasing. When
    /// `cancel` fires the backend cleans up and returns
    /// [`BackendError::Cancelled`].
    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, BackendError>;
}
