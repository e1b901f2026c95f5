//! Job model: identity, desired output, lifecycle state and results.

mod state;
mod types;

pub use state::{InvalidTransition, JobState, UnknownState};
pub use types::{Job, JobId, MediaMetadata, OutputKind, OutputSpec};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
