//! Progress reported by a backend while it executes a job.
//!
//! Consumers can compute rate and ETA from bytes when the backend only knows
//! sizes; backends that already parse speed/ETA fill those in directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::job::JobState;

/// Sub-state the backend is in; mirrored onto the job by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPhase {
    Downloading,
    Converting,
}

impl BackendPhase {
    pub fn job_state(self) -> JobState {
        match self {
            BackendPhase::Downloading => JobState::Downloading,
            BackendPhase::Converting => JobState::Converting,
        }
    }
}

/// One progress sample for a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendProgress {
    pub phase: BackendPhase,
    /// Percent complete in [0, 100].
    pub percent: f64,
    pub bytes_done: Option<u64>,
    pub total_bytes: Option<u64>,
    /// Transfer rate in bytes per second, when known.
    pub speed_bps: Option<f64>,
    /// Estimated seconds remaining, when known.
    pub eta_secs: Option<f64>,
}

impl BackendProgress {
    pub fn new(phase: BackendPhase, percent: f64) -> Self {
        Self {
            phase,
            percent: clamp_percent(percent),
            bytes_done: None,
            total_bytes: None,
            speed_bps: None,
            eta_secs: None,
        }
    }

    /// Builds a sample from byte counts over `elapsed_secs`, deriving percent,
    /// rate and ETA.
    pub fn from_bytes(bytes_done: u64, total_bytes: u64, elapsed_secs: f64) -> Self {
        let mut p = Self::new(BackendPhase::Downloading, 0.0);
        p.bytes_done = Some(bytes_done);
        p.total_bytes = Some(total_bytes);
        p.percent = p.fraction().map(|f| f * 100.0).unwrap_or(0.0);
        if elapsed_secs > 0.0 {
            let rate = bytes_done as f64 / elapsed_secs;
            p.speed_bps = Some(rate);
            let remaining = total_bytes.saturating_sub(bytes_done);
            p.eta_secs = if remaining == 0 {
                Some(0.0)
            } else if rate > 0.0 {
                Some(remaining as f64 / rate)
            } else {
                None
            };
        }
        p
    }

    pub fn with_speed(mut self, speed_bps: Option<f64>) -> Self {
        self.speed_bps = speed_bps;
        self
    }

    pub fn with_eta(mut self, eta_secs: Option<f64>) -> Self {
        self.eta_secs = eta_secs;
        self
    }

    pub fn with_total(mut self, total_bytes: Option<u64>) -> Self {
        self.total_bytes = total_bytes;
        self
    }

    /// Fraction complete in [0.0, 1.0] from byte counts (None if unknown).
    pub fn fraction(&self) -> Option<f64> {
        let done = self.bytes_done?;
        let total = self.total_bytes?;
        if total == 0 {
            return Some(1.0);
        }
        Some((done as f64 / total as f64).min(1.0))
    }
}

pub(crate) fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Callback handed to [`ExecutionBackend::execute`](super::ExecutionBackend::execute).
///
/// Cheap to clone; calls are forwarded synchronously, so samples from one
/// task arrive in the order they were reported.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<dyn Fn(BackendProgress) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(f: impl Fn(BackendProgress) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// A reporter that drops every sample.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, progress: BackendProgress) {
        (self.inner)(progress)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}
