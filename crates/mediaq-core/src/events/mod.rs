//! Notifications pushed to UI consumers.
//!
//! The scheduler emits three events, serialized as
//! `{"event": "<name>", "payload": {...}}`:
//!
//! - `queue:updated` after every mutation, carrying an ordered snapshot;
//! - `download:progress` while a job executes;
//! - `download:complete` when a job produces its output.

mod bus;

pub use bus::{EventBus, DEFAULT_CAPACITY};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::job::{Job, JobId, JobState};

/// Ordered copy of every job, tagged with the mutation counter that produced it.
///
/// Snapshots are emitted outside the queue lock, so two concurrent mutations
/// may deliver out of order; consumers keep the highest `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub revision: u64,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_id: JobId,
    pub state: JobState,
    /// Percent complete in [0, 100].
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_done: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job_id: JobId,
    pub result_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum QueueEvent {
    #[serde(rename = "queue:updated")]
    QueueUpdated(QueueSnapshot),
    #[serde(rename = "download:progress")]
    Progress(ProgressRecord),
    #[serde(rename = "download:complete")]
    Complete(CompletionRecord),
}

impl QueueEvent {
    pub const QUEUE_UPDATED: &'static str = "queue:updated";
    pub const PROGRESS: &'static str = "download:progress";
    pub const COMPLETE: &'static str = "download:complete";

    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::QueueUpdated(_) => Self::QUEUE_UPDATED,
            QueueEvent::Progress(_) => Self::PROGRESS,
            QueueEvent::Complete(_) => Self::COMPLETE,
        }
    }
}

/// Receiver of scheduler notifications. Called outside the queue lock and
/// must not block.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: QueueEvent);
}

impl<F> NotificationSink for F
where
    F: Fn(QueueEvent) + Send + Sync,
{
    fn emit(&self, event: QueueEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn emit(&self, _event: QueueEvent) {}
}
