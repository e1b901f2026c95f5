//! Lock-protected job collection: identity map, insertion order and the
//! execution handle attached to each running job.

use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use super::error::QueueError;
use crate::events::QueueSnapshot;
use crate::job::{Job, JobId, JobState};

/// Cancel handle for one execution unit. Never leaves the scheduler.
///
/// `run` is unique per attach, so a unit from an earlier run of the same job
/// can be told apart from the current one.
#[derive(Debug, Clone)]
pub(crate) struct Handle {
    pub(crate) run: u64,
    pub(crate) cancel: CancellationToken,
}

impl Handle {
    pub(crate) fn new(run: u64, cancel: CancellationToken) -> Self {
        Self { run, cancel }
    }
}

/// Whether an execution unit is attached to a job, and what happens to the
/// job when that unit exits.
#[derive(Debug)]
pub(crate) enum Execution {
    Idle,
    Active(Handle),
    /// Delete the job once the unit unwinds.
    PendingRemoval(Handle),
}

impl Execution {
    fn handle(&self) -> Option<&Handle> {
        match self {
            Execution::Idle => None,
            Execution::Active(h) | Execution::PendingRemoval(h) => Some(h),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) job: Job,
    execution: Execution,
}

impl Entry {
    fn new(job: Job) -> Self {
        Self {
            job,
            execution: Execution::Idle,
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        !matches!(self.execution, Execution::Idle)
    }

    pub(crate) fn is_pending_removal(&self) -> bool {
        matches!(self.execution, Execution::PendingRemoval(_))
    }

    pub(crate) fn attach(&mut self, handle: Handle) {
        debug_assert!(!self.is_attached(), "job {} already has a unit", self.job.id);
        self.execution = Execution::Active(handle);
    }

    /// True while the unit of `run` is the one attached.
    pub(crate) fn is_run(&self, run: u64) -> bool {
        self.execution.handle().is_some_and(|h| h.run == run)
    }

    pub(crate) fn detach(&mut self) {
        self.execution = Execution::Idle;
    }

    /// Marks the job for cancellation and returns the token to trigger once
    /// the lock is released. A unit still waiting for a slot ends `cancelled`
    /// at once; one that is running goes to `cancel_requested` until it unwinds.
    pub(crate) fn request_cancel(&mut self) -> Option<CancellationToken> {
        let token = self.execution.handle()?.cancel.clone();
        let next = if self.job.state.is_startable() {
            JobState::Cancelled
        } else {
            JobState::CancelRequested
        };
        if let Err(e) = self.job.transition(next) {
            tracing::debug!(job_id = %self.job.id, "cancel request: {}", e);
        }
        Some(token)
    }

    /// Like [`request_cancel`](Self::request_cancel), and flags the job for
    /// deletion when its unit exits.
    pub(crate) fn request_removal(&mut self) -> Option<CancellationToken> {
        let token = self.request_cancel()?;
        self.execution = match std::mem::replace(&mut self.execution, Execution::Idle) {
            Execution::Active(h) | Execution::PendingRemoval(h) => Execution::PendingRemoval(h),
            Execution::Idle => Execution::Idle,
        };
        Some(token)
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    entries: HashMap<JobId, Entry>,
    order: Vec<JobId>,
    revision: u64,
    runs: u64,
    closed: bool,
}

impl QueueState {
    /// Appends `job`, rejecting a live duplicate id or target.
    pub(crate) fn insert(&mut self, job: Job) -> Result<&Job, QueueError> {
        if self.entries.contains_key(&job.id) {
            return Err(QueueError::DuplicateId(job.id));
        }
        if self.has_target(&job.target) {
            return Err(QueueError::DuplicateTarget(job.target));
        }
        let id = job.id.clone();
        self.order.push(id.clone());
        let entry = self.entries.entry(id).or_insert(Entry::new(job));
        Ok(&entry.job)
    }

    pub(crate) fn get(&self, id: &JobId) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &JobId) -> Option<&mut Entry> {
        self.entries.get_mut(id)
    }

    pub(crate) fn entry_mut(&mut self, id: &JobId) -> Result<&mut Entry, QueueError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    pub(crate) fn remove(&mut self, id: &JobId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|o| o != id);
        Some(entry)
    }

    /// Entries in insertion order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Ids of entries matching `pred`, in insertion order.
    pub(crate) fn ids_where(&self, pred: impl Fn(&Entry) -> bool) -> Vec<JobId> {
        self.iter()
            .filter(|e| pred(e))
            .map(|e| e.job.id.clone())
            .collect()
    }

    pub(crate) fn jobs(&self) -> Vec<Job> {
        self.iter().map(|e| e.job.clone()).collect()
    }

    pub(crate) fn has_target(&self, target: &str) -> bool {
        self.entries.values().any(|e| e.job.target == target)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.entries.values().filter(|e| e.job.is_active()).count()
    }

    #[cfg(test)]
    pub(crate) fn attached_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_attached()).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Bumps the revision and copies the ordered job list. Call once per
    /// mutation, while still holding the write lock.
    pub(crate) fn next_snapshot(&mut self) -> QueueSnapshot {
        self.revision += 1;
        QueueSnapshot {
            revision: self.revision,
            jobs: self.jobs(),
        }
    }

    /// Fresh id for the next attached unit.
    pub(crate) fn next_run(&mut self) -> u64 {
        self.runs += 1;
        self.runs
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.order.len(), self.entries.len());
        for id in &self.order {
            assert!(self.entries.contains_key(id), "order has {id} but map does not");
        }
        let mut targets: Vec<_> = self.entries.values().map(|e| &e.job.target).collect();
        targets.sort();
        targets.dedup();
        assert_eq!(targets.len(), self.entries.len(), "duplicate live target");
    }
}
