#![allow(dead_code)]

pub mod fake_backend;

use mediaq_core::events::{CompletionRecord, NotificationSink, ProgressRecord, QueueEvent, QueueSnapshot};
use mediaq_core::{ExecutionBackend, JobId, Scheduler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub use fake_backend::{Exec, FakeBackend, Resolve, Script};

/// Sink that keeps every event for later assertions.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<QueueEvent>>,
}

impl NotificationSink for Recorder {
    fn emit(&self, event: QueueEvent) {
        self.events.lock().push(event);
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<QueueSnapshot> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::QueueUpdated(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn progress_for(&self, id: &str) -> Vec<ProgressRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::Progress(p) if p.job_id.as_str() == id => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> Vec<CompletionRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::Complete(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Highest number of active jobs seen in any snapshot.
    pub fn max_active(&self) -> usize {
        self.snapshots()
            .iter()
            .map(|s| s.jobs.iter().filter(|j| j.is_active()).count())
            .max()
            .unwrap_or(0)
    }
}

pub fn scheduler(limit: usize, backend: &Arc<FakeBackend>, sink: &Arc<Recorder>) -> Scheduler {
    let backend: Arc<dyn ExecutionBackend> = backend.clone();
    let sink: Arc<dyn NotificationSink> = sink.clone();
    Scheduler::with_limit(limit, backend, sink)
}

/// Polls `cond` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn drain(sched: &Scheduler) {
    tokio::time::timeout(Duration::from_secs(5), sched.wait_idle())
        .await
        .expect("execution units did not exit");
}

pub fn id(s: &str) -> JobId {
    JobId::from(s)
}
