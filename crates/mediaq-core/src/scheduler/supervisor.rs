//! Execution unit: drives one job from slot acquisition to a final state.
//!
//! slot → (metadata) → transfer/produce → finalize. Whatever happens in
//! between, `finish` records the outcome, detaches the cancel handle and
//! deletes the job if its removal was deferred, all in one critical section,
//! and only then is the slot given back.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::Shared;
use super::state::Handle;
use crate::backend::{clamp_percent, BackendError, BackendProgress, ProgressReporter};
use crate::events::{CompletionRecord, ProgressRecord, QueueEvent};
use crate::job::{Job, JobId, JobState, MediaMetadata};

/// How far a unit takes its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UnitMode {
    /// Metadata then transfer.
    Full,
    /// Metadata only; the job parks in `ready`.
    ResolveOnly,
}

#[derive(Debug)]
enum Outcome {
    Completed(PathBuf),
    Ready,
    Failed(String),
    Cancelled,
}

pub(super) async fn run_unit(
    shared: Arc<Shared>,
    id: JobId,
    handle: Handle,
    mode: UnitMode,
) {
    let Handle { run, cancel } = handle;
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = shared.slots.acquire() => permit.ok(),
    };

    let outcome = match &permit {
        None => Outcome::Cancelled,
        Some(_) => {
            tracing::debug!(job_id = %id, in_use = shared.slots.in_use(), "slot acquired");
            AssertUnwindSafe(drive(&shared, &id, run, &cancel, mode))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!(job_id = %id, "execution unit panicked");
                    Outcome::Failed("execution unit panicked".to_string())
                })
        }
    };

    shared.finish(&id, outcome, &cancel);
    shared.live_units.send_modify(|n| *n -= 1);
    drop(permit);
}

async fn drive(
    shared: &Arc<Shared>,
    id: &JobId,
    run: u64,
    cancel: &CancellationToken,
    mode: UnitMode,
) -> Outcome {
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    let Some(job) = shared.job(id) else {
        return Outcome::Cancelled;
    };

    if job.metadata.is_none() {
        if !shared.set_state(id, JobState::FetchingMetadata) {
            return Outcome::Cancelled;
        }
        tracing::debug!(job_id = %id, target = %job.target, "resolving metadata");
        match shared.backend.resolve_metadata(&job.target, cancel).await {
            Ok(meta) => shared.store_metadata(id, meta),
            Err(e) => return failure(id, e, cancel),
        }
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
    }
    if mode == UnitMode::ResolveOnly {
        return Outcome::Ready;
    }

    if !shared.set_state(id, JobState::Downloading) {
        return Outcome::Cancelled;
    }
    let Some(job) = shared.job(id) else {
        return Outcome::Cancelled;
    };
    let reporter = {
        let shared = Arc::clone(shared);
        let id = id.clone();
        ProgressReporter::new(move |p| shared.record_progress(&id, run, p))
    };
    tracing::info!(job_id = %id, title = %job.display_name(), "transfer started");
    match shared.backend.execute(&job, cancel, &reporter).await {
        Ok(path) => Outcome::Completed(path),
        Err(e) => failure(id, e, cancel),
    }
}

fn failure(id: &JobId, e: BackendError, cancel: &CancellationToken) -> Outcome {
    if e.is_cancelled() || cancel.is_cancelled() {
        Outcome::Cancelled
    } else {
        tracing::warn!(job_id = %id, "job failed: {}", e);
        Outcome::Failed(e.to_string())
    }
}

impl Shared {
    fn job(&self, id: &JobId) -> Option<Job> {
        self.state.read().get(id).map(|e| e.job.clone())
    }

    /// Moves an attached job to `to`. Returns false if the job is gone or the
    /// state machine refuses (e.g. cancellation already recorded).
    fn set_state(&self, id: &JobId, to: JobState) -> bool {
        let snapshot = {
            let mut state = self.state.write();
            let Some(entry) = state.get_mut(id) else {
                return false;
            };
            if entry.job.state == to {
                return true;
            }
            if let Err(e) = entry.job.transition(to) {
                tracing::debug!(job_id = %id, "{}", e);
                return false;
            }
            state.next_snapshot()
        };
        tracing::debug!(job_id = %id, state = %to, "state changed");
        self.publish(snapshot);
        true
    }

    fn store_metadata(&self, id: &JobId, meta: MediaMetadata) {
        let snapshot = {
            let mut state = self.state.write();
            let Some(entry) = state.get_mut(id) else {
                return;
            };
            entry.job.metadata = Some(meta);
            state.next_snapshot()
        };
        self.publish(snapshot);
    }

    /// Re-emits backend progress and mirrors the backend's phase onto the job.
    /// Reports from any unit but the attached `run` are dropped.
    fn record_progress(&self, id: &JobId, run: u64, progress: BackendProgress) {
        let (record, snapshot) = {
            let mut state = self.state.write();
            let Some(entry) = state.get_mut(id) else {
                return;
            };
            if !entry.is_run(run) {
                tracing::trace!(job_id = %id, run, "stale progress dropped");
                return;
            }
            let phase_state = progress.phase.job_state();
            let mut changed = false;
            if matches!(entry.job.state, JobState::Downloading | JobState::Converting)
                && entry.job.state != phase_state
            {
                changed = entry.job.transition(phase_state).is_ok();
            }
            entry.job.progress = clamp_percent(progress.percent).max(entry.job.progress);
            let record = ProgressRecord {
                job_id: id.clone(),
                state: entry.job.state,
                percent: entry.job.progress,
                speed_bps: progress.speed_bps,
                eta_secs: progress.eta_secs,
                bytes_done: progress.bytes_done,
                total_bytes: progress.total_bytes,
            };
            let snapshot = changed.then(|| state.next_snapshot());
            (record, snapshot)
        };
        self.sink.emit(QueueEvent::Progress(record));
        if let Some(snapshot) = snapshot {
            self.publish(snapshot);
        }
    }

    /// Records the unit's outcome, detaches it and performs a deferred removal.
    fn finish(&self, id: &JobId, outcome: Outcome, cancel: &CancellationToken) {
        let (snapshot, completion) = {
            let mut state = self.state.write();
            let Some(entry) = state.get_mut(id) else {
                tracing::warn!(job_id = %id, "execution unit finished for unknown job");
                return;
            };

            // Anything but a finished transfer after a cancel request ends cancelled.
            let outcome = match outcome {
                Outcome::Completed(path) => Outcome::Completed(path),
                _ if cancel.is_cancelled() => Outcome::Cancelled,
                other => other,
            };

            let removing = entry.is_pending_removal();
            let mut completion = None;
            let applied = match outcome {
                Outcome::Completed(path) => {
                    let result = entry.job.complete(path.clone());
                    if result.is_ok() && !removing {
                        completion = Some(CompletionRecord {
                            job_id: id.clone(),
                            result_path: path,
                        });
                    }
                    result
                }
                Outcome::Ready => entry.job.transition(JobState::Ready),
                Outcome::Failed(msg) => entry.job.fail(msg),
                Outcome::Cancelled => entry.job.transition(JobState::Cancelled),
            };
            if let Err(e) = applied {
                tracing::warn!(job_id = %id, "could not record outcome: {}", e);
            }
            tracing::info!(job_id = %id, state = %entry.job.state, "execution finished");

            entry.detach();
            if removing {
                state.remove(id);
                tracing::info!(job_id = %id, "job removed after cancellation");
            }
            (state.next_snapshot(), completion)
        };

        if let Some(done) = completion {
            self.sink.emit(QueueEvent::Complete(done));
        }
        self.publish(snapshot);
    }
}
