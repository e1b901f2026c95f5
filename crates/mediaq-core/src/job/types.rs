//! Job record and the value types it carries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::now_ms;
use super::state::{InvalidTransition, JobState};

/// Caller-supplied job identifier. Opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&JobId> for JobId {
    fn from(id: &JobId) -> Self {
        id.clone()
    }
}

/// What the backend should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Audio track only.
    Audio,
    /// Video with audio.
    Video,
}

/// Desired output: kind, destination directory and an optional quality hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub kind: OutputKind,
    pub destination: PathBuf,
    /// Backend-specific format/quality selector (e.g. "mp3", "bestvideo[height<=720]").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

impl OutputSpec {
    pub fn audio(destination: impl Into<PathBuf>) -> Self {
        Self {
            kind: OutputKind::Audio,
            destination: destination.into(),
            quality: None,
        }
    }

    pub fn video(destination: impl Into<PathBuf>) -> Self {
        Self {
            kind: OutputKind::Video,
            destination: destination.into(),
            quality: None,
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }
}

/// Descriptive info resolved once per job before the transfer starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// One queued unit of work. Values handed out by the scheduler are copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: String,
    pub output: OutputSpec,
    pub state: JobState,
    /// Set only once the job is completed.
    pub result_path: Option<PathBuf>,
    /// Set only while the job is failed.
    pub last_error: Option<String>,
    pub metadata: Option<MediaMetadata>,
    /// Last reported percent complete (0..=100) for the current run.
    pub progress: f64,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds; bumped on every state transition.
    pub updated_at: i64,
}

impl Job {
    pub fn new(id: JobId, target: impl Into<String>, output: OutputSpec) -> Self {
        let now = now_ms();
        Self {
            id,
            target: target.into(),
            output,
            state: JobState::Queued,
            result_path: None,
            last_error: None,
            metadata: None,
            progress: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Title once resolved, otherwise the target.
    pub fn display_name(&self) -> &str {
        match &self.metadata {
            Some(meta) if !meta.title.is_empty() => &meta.title,
            _ => &self.target,
        }
    }

    pub fn result_path(&self) -> Option<&Path> {
        self.result_path.as_deref()
    }

    /// Moves to `to` if the state machine allows it. Re-entering the current
    /// state is a no-op.
    pub(crate) fn transition(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now_ms().max(self.updated_at);
        Ok(())
    }

    pub(crate) fn complete(&mut self, path: PathBuf) -> Result<(), InvalidTransition> {
        self.transition(JobState::Completed)?;
        self.result_path = Some(path);
        self.progress = 100.0;
        Ok(())
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Failed)?;
        self.last_error = Some(message.into());
        Ok(())
    }

    /// Back to `queued` from failed/cancelled; keeps resolved metadata.
    pub(crate) fn reset_for_retry(&mut self) -> Result<(), InvalidTransition> {
        if !self.state.is_retryable() {
            return Err(InvalidTransition {
                from: self.state,
                to: JobState::Queued,
            });
        }
        self.transition(JobState::Queued)?;
        self.last_error = None;
        self.result_path = None;
        self.progress = 0.0;
        Ok(())
    }
}
