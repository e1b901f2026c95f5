//! Job queue scheduler.
//!
//! Owns the job collection and runs each started job in its own execution
//! unit on the Tokio runtime. At most `max_concurrent_jobs` units hold a
//! slot at once; the rest wait in `queued`. Every mutation publishes one
//! `queue:updated` snapshot to the notification sink.
//!
//! All mutations are synchronous and return immediately: starting a job
//! spawns its unit, cancelling a job raises its token. Neither waits for
//! the unit to finish; use [`Scheduler::wait_idle`] for that.

mod error;
mod slots;
mod state;
mod supervisor;

pub use error::QueueError;

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::ExecutionBackend;
use crate::config::QueueConfig;
use crate::events::{NotificationSink, QueueEvent, QueueSnapshot};
use crate::job::{Job, JobId, JobState, OutputSpec};
use slots::SlotGate;
use state::{Handle as RunHandle, QueueState};
use supervisor::UnitMode;

struct Shared {
    state: RwLock<QueueState>,
    slots: SlotGate,
    backend: Arc<dyn ExecutionBackend>,
    sink: Arc<dyn NotificationSink>,
    /// Execution units spawned and not yet done publishing their outcome.
    live_units: watch::Sender<usize>,
    runtime: Handle,
}

impl Shared {
    fn publish(&self, snapshot: QueueSnapshot) {
        self.sink.emit(QueueEvent::QueueUpdated(snapshot));
    }

    /// Attaches a fresh cancel handle to `id` while the write lock is held.
    /// `Ok(None)` means there is nothing to start.
    fn attach(
        &self,
        state: &mut QueueState,
        id: &JobId,
    ) -> Result<Option<RunHandle>, QueueError> {
        if state.is_closed() {
            return Err(QueueError::ShuttingDown);
        }
        let entry = state.entry_mut(id)?;
        if entry.is_attached() {
            tracing::debug!(job_id = %id, "already running");
            return Ok(None);
        }
        if entry.job.state.is_terminal() {
            tracing::debug!(job_id = %id, state = %entry.job.state, "not starting finished job");
            return Ok(None);
        }
        let handle = RunHandle::new(state.next_run(), CancellationToken::new());
        state.entry_mut(id)?.attach(handle.clone());
        self.live_units.send_modify(|n| *n += 1);
        Ok(Some(handle))
    }
}

/// Cheaply cloneable handle to one job queue.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Builds a scheduler from `config`. `max_concurrent_jobs` is read once.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the runtime handle is
    /// captured so that later calls may come from any thread.
    pub fn new(
        config: &QueueConfig,
        backend: Arc<dyn ExecutionBackend>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::with_limit(config.max_concurrent_jobs, backend, sink)
    }

    /// Like [`new`](Self::new) with an explicit slot count (0 is raised to 1).
    pub fn with_limit(
        max_concurrent_jobs: usize,
        backend: Arc<dyn ExecutionBackend>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (live_units, _) = watch::channel(0usize);
        let slots = SlotGate::new(max_concurrent_jobs);
        tracing::debug!(limit = slots.limit(), "scheduler created");
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(QueueState::default()),
                slots,
                backend,
                sink,
                live_units,
                runtime: Handle::current(),
            }),
        }
    }

    /// Appends a `queued` job. The target must not match any job still in the
    /// collection, finished ones included.
    pub fn add_item(
        &self,
        id: impl Into<JobId>,
        target: impl Into<String>,
        output: OutputSpec,
    ) -> Result<Job, QueueError> {
        let job = Job::new(id.into(), target, output);
        let (job, snapshot) = {
            let mut state = self.shared.state.write();
            let job = state.insert(job)?.clone();
            (job, state.next_snapshot())
        };
        tracing::info!(job_id = %job.id, target = %job.target, "job added");
        self.shared.publish(snapshot);
        Ok(job)
    }

    /// Deletes a job. An idle job goes at once; a job with a unit attached is
    /// cancelled and deleted when the unit exits.
    pub fn remove_item(&self, id: &JobId) -> Result<(), QueueError> {
        let (token, snapshot) = {
            let mut state = self.shared.state.write();
            let token = state.entry_mut(id)?.request_removal();
            if token.is_none() {
                state.remove(id);
            }
            (token, state.next_snapshot())
        };
        match token {
            Some(token) => {
                tracing::info!(job_id = %id, "removal deferred until execution stops");
                token.cancel();
            }
            None => tracing::info!(job_id = %id, "job removed"),
        }
        self.shared.publish(snapshot);
        Ok(())
    }

    /// Spawns an execution unit for `id` and returns immediately. A job that
    /// already has a unit, or is finished, is left alone.
    pub fn start_download(&self, id: &JobId) -> Result<(), QueueError> {
        self.launch(id, UnitMode::Full)
    }

    /// Resolves metadata for `id` without transferring; the job ends in
    /// `ready` and a later start skips resolution.
    pub fn resolve_item(&self, id: &JobId) -> Result<(), QueueError> {
        self.launch(id, UnitMode::ResolveOnly)
    }

    /// Starts every `queued` or `ready` job that has no unit yet.
    pub fn start_all(&self) {
        let started = {
            let mut state = self.shared.state.write();
            let ids = state.ids_where(|e| !e.is_attached() && e.job.state.is_startable());
            let mut started = Vec::with_capacity(ids.len());
            for id in ids {
                match self.shared.attach(&mut state, &id) {
                    Ok(Some(handle)) => started.push((id, handle)),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(job_id = %id, "start_all: {}", e),
                }
            }
            started
        };
        tracing::debug!(count = started.len(), "start_all");
        for (id, handle) in started {
            self.spawn(id, handle, UnitMode::Full);
        }
    }

    /// Running job: raise cancel, mark `cancel_requested`. Waiting or idle
    /// job: mark `cancelled`. Finished job: no-op.
    pub fn cancel_item(&self, id: &JobId) -> Result<(), QueueError> {
        let (token, snapshot) = {
            let mut state = self.shared.state.write();
            let entry = state.entry_mut(id)?;
            if entry.job.state.is_terminal() {
                return Ok(());
            }
            let token = entry.request_cancel();
            if token.is_none() {
                if let Err(e) = entry.job.transition(JobState::Cancelled) {
                    tracing::warn!(job_id = %id, "cancel: {}", e);
                }
            }
            (token, state.next_snapshot())
        };
        tracing::info!(job_id = %id, "cancel requested");
        if let Some(token) = token {
            token.cancel();
        }
        self.shared.publish(snapshot);
        Ok(())
    }

    /// Raises cancel for every job with a unit attached.
    pub fn cancel_all(&self) {
        let tokens = self.cancel_attached(false);
        tracing::info!(count = tokens, "cancel_all");
    }

    /// Resets a `failed` or `cancelled` job to `queued` and starts it again.
    /// Resolved metadata is kept.
    pub fn retry_item(&self, id: &JobId) -> Result<(), QueueError> {
        let (handle, snapshot) = {
            let mut state = self.shared.state.write();
            if state.is_closed() {
                return Err(QueueError::ShuttingDown);
            }
            let entry = state.entry_mut(id)?;
            let not_retryable = QueueError::NotRetryable {
                id: id.clone(),
                state: entry.job.state,
            };
            if entry.is_attached() || !entry.job.state.is_retryable() {
                return Err(not_retryable);
            }
            entry.job.reset_for_retry().map_err(|_| not_retryable)?;
            let handle = self.shared.attach(&mut state, id)?;
            (handle, state.next_snapshot())
        };
        tracing::info!(job_id = %id, "retrying");
        self.shared.publish(snapshot);
        if let Some(handle) = handle {
            self.spawn(id.clone(), handle, UnitMode::Full);
        }
        Ok(())
    }

    /// Removes every `completed` job.
    pub fn clear_completed(&self) {
        let (removed, snapshot) = {
            let mut state = self.shared.state.write();
            let ids =
                state.ids_where(|e| e.job.state == JobState::Completed && !e.is_attached());
            for id in &ids {
                state.remove(id);
            }
            (ids.len(), state.next_snapshot())
        };
        tracing::info!(count = removed, "cleared completed jobs");
        self.shared.publish(snapshot);
    }

    pub fn get_item(&self, id: &JobId) -> Result<Job, QueueError> {
        self.shared
            .state
            .read()
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    /// Owned copies of every job, in insertion order.
    pub fn get_all_items(&self) -> Vec<Job> {
        self.shared.state.read().jobs()
    }

    pub fn has_url(&self, target: &str) -> bool {
        self.shared.state.read().has_target(target)
    }

    /// Jobs currently in an active state.
    pub fn active_download_count(&self) -> usize {
        self.shared.state.read().active_count()
    }

    pub fn concurrency_limit(&self) -> usize {
        self.shared.slots.limit()
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every attached unit and refuses later starts and retries.
    /// Does not wait for units to exit.
    pub fn shutdown(&self) {
        let cancelled = self.cancel_attached(true);
        tracing::info!(cancelled, "scheduler shut down");
    }

    /// Resolves once no job has an execution unit attached and every unit's
    /// final events have reached the sink.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.live_units.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn launch(&self, id: &JobId, mode: UnitMode) -> Result<(), QueueError> {
        let handle = {
            let mut state = self.shared.state.write();
            self.shared.attach(&mut state, id)?
        };
        if let Some(handle) = handle {
            tracing::debug!(job_id = %id, ?mode, "unit spawned");
            self.spawn(id.clone(), handle, mode);
        }
        Ok(())
    }

    fn spawn(&self, id: JobId, handle: RunHandle, mode: UnitMode) {
        let shared = Arc::clone(&self.shared);
        self.shared
            .runtime
            .spawn(supervisor::run_unit(shared, id, handle, mode));
    }

    /// Requests cancellation of every attached, unfinished job in one critical
    /// section and raises the tokens after the lock is released.
    fn cancel_attached(&self, close: bool) -> usize {
        let (tokens, snapshot) = {
            let mut state = self.shared.state.write();
            if close {
                state.close();
            }
            let ids = state.ids_where(|e| e.is_attached() && !e.job.state.is_terminal());
            let tokens: Vec<_> = ids
                .iter()
                .filter_map(|id| state.get_mut(id).and_then(|e| e.request_cancel()))
                .collect();
            let snapshot = (!tokens.is_empty()).then(|| state.next_snapshot());
            (tokens, snapshot)
        };
        for token in &tokens {
            token.cancel();
        }
        if let Some(snapshot) = snapshot {
            self.shared.publish(snapshot);
        }
        tokens.len()
    }
}
