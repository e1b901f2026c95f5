//! Job lifecycle states and the transitions allowed between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job, serialized in snake_case for UI consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    FetchingMetadata,
    /// Metadata resolved; waiting for an explicit start.
    Ready,
    Downloading,
    Converting,
    /// Cancellation raised; the execution unit has not unwound yet.
    CancelRequested,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::FetchingMetadata => "fetching_metadata",
            JobState::Ready => "ready",
            JobState::Downloading => "downloading",
            JobState::Converting => "converting",
            JobState::CancelRequested => "cancel_requested",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// States that occupy a concurrency slot (or are unwinding out of one).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::FetchingMetadata
                | JobState::Downloading
                | JobState::Converting
                | JobState::CancelRequested
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Only failed and cancelled jobs may re-enter the queue.
    pub fn is_retryable(self) -> bool {
        matches!(self, JobState::Failed | JobState::Cancelled)
    }

    /// States picked up by a bulk start.
    pub fn is_startable(self) -> bool {
        matches!(self, JobState::Queued | JobState::Ready)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match self {
            Queued => matches!(
                next,
                FetchingMetadata | Ready | Downloading | CancelRequested | Cancelled | Failed
            ),
            Ready => matches!(
                next,
                FetchingMetadata | Downloading | CancelRequested | Cancelled | Failed
            ),
            FetchingMetadata => matches!(
                next,
                Ready | Downloading | CancelRequested | Cancelled | Failed
            ),
            Downloading => matches!(
                next,
                Converting | Completed | CancelRequested | Cancelled | Failed
            ),
            Converting => matches!(
                next,
                Downloading | Completed | CancelRequested | Cancelled | Failed
            ),
            CancelRequested => matches!(next, Cancelled | Completed),
            Failed | Cancelled => next == Queued,
            Completed => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Returned when a state name does not match any [`JobState`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "queued" => JobState::Queued,
            "fetching_metadata" => JobState::FetchingMetadata,
            "ready" => JobState::Ready,
            "downloading" => JobState::Downloading,
            "converting" => JobState::Converting,
            "cancel_requested" => JobState::CancelRequested,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            other => return Err(UnknownState(other.to_string())),
        };
        Ok(state)
    }
}

/// A transition rejected by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid job state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}
