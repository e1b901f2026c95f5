//! Scripted in-process backend. Each target gets a [`Script`]; unknown
//! targets resolve and transfer successfully at once.

use async_trait::async_trait;
use mediaq_core::backend::{
    BackendError, BackendPhase, BackendProgress, CancellationToken, ExecutionBackend,
    ProgressReporter,
};
use mediaq_core::job::{Job, MediaMetadata};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Resolve {
    Succeed,
    Fail(String),
    /// Waits for the job's cancellation.
    Hold,
}

#[derive(Debug, Clone)]
pub enum Exec {
    Succeed,
    Fail(String),
    Sleep(Duration),
    /// Waits until `release` fires (succeeds) or the job is cancelled.
    Hold(CancellationToken),
    /// Waits for `release` without watching cancellation, then succeeds.
    Stubborn(CancellationToken),
    /// Reports each step, then succeeds.
    Progress(Vec<(BackendPhase, f64)>),
    /// Reports the samples exactly as given, then succeeds.
    Samples(Vec<BackendProgress>),
    /// Keeps a clone of the reporter past the end of the run, then fails.
    KeepReporter(Arc<Mutex<Option<ProgressReporter>>>),
    Panic,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub resolve: Resolve,
    pub exec: Exec,
}

impl Script {
    pub fn exec(exec: Exec) -> Self {
        Self {
            resolve: Resolve::Succeed,
            exec,
        }
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::exec(Exec::Succeed)
    }
}

#[derive(Default)]
pub struct FakeBackend {
    scripts: Mutex<HashMap<String, Script>>,
    default: Mutex<Script>,
    pub resolve_calls: AtomicUsize,
    pub execute_calls: AtomicUsize,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, target: &str, script: Script) {
        self.scripts.lock().insert(target.to_string(), script);
    }

    pub fn set_default(&self, script: Script) {
        *self.default.lock() = script;
    }

    pub fn resolves(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn script_for(&self, target: &str) -> Script {
        self.scripts
            .lock()
            .get(target)
            .cloned()
            .unwrap_or_else(|| self.default.lock().clone())
    }

    fn enter(&self) -> Running<'_> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        Running(&self.running)
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn resolve_metadata(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, BackendError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let _running = self.enter();
        match self.script_for(target).resolve {
            Resolve::Succeed => Ok(MediaMetadata {
                title: format!("title of {target}"),
                duration_secs: Some(60.0),
                ..MediaMetadata::default()
            }),
            Resolve::Fail(msg) => Err(BackendError::Failed(msg)),
            Resolve::Hold => {
                cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, BackendError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let _running = self.enter();
        let out = job.output.destination.join(format!("{}.mp3", job.id));
        match self.script_for(&job.target).exec {
            Exec::Succeed => Ok(out),
            Exec::Fail(msg) => Err(BackendError::Failed(msg)),
            Exec::Sleep(d) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(BackendError::Cancelled),
                    _ = tokio::time::sleep(d) => Ok(out),
                }
            }
            Exec::Hold(release) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(BackendError::Cancelled),
                    _ = release.cancelled() => Ok(out),
                }
            }
            Exec::Stubborn(release) => {
                release.cancelled().await;
                Ok(out)
            }
            Exec::Progress(steps) => {
                for (phase, percent) in steps {
                    progress.report(BackendProgress::new(phase, percent));
                    tokio::task::yield_now().await;
                }
                Ok(out)
            }
            Exec::Samples(samples) => {
                for sample in samples {
                    progress.report(sample);
                    tokio::task::yield_now().await;
                }
                Ok(out)
            }
            Exec::KeepReporter(slot) => {
                *slot.lock() = Some(progress.clone());
                Err(BackendError::Failed("connection reset".into()))
            }
            Exec::Panic => panic!("backend exploded"),
        }
    }
}
