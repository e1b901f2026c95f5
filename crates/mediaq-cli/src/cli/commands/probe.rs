//! `mediaq probe` – resolve metadata for one URL and print it.

use anyhow::{bail, Result};
use mediaq_core::config::QueueConfig;
use mediaq_core::events::NoopSink;
use mediaq_core::job::MediaMetadata;
use mediaq_core::{CommandBackend, JobId, JobState, OutputSpec, Scheduler};
use std::sync::Arc;

use super::parse_target;

pub async fn run_probe(cfg: &QueueConfig, raw: &str) -> Result<()> {
    let target = parse_target(raw)?;
    let backend = Arc::new(CommandBackend::from_config(&cfg.backend));
    let sched = Scheduler::with_limit(1, backend, Arc::new(NoopSink));

    let id = JobId::new("probe");
    sched.add_item(id.clone(), target, OutputSpec::video(std::env::temp_dir()))?;
    sched.resolve_item(&id)?;
    sched.wait_idle().await;

    let job = sched.get_item(&id)?;
    match (job.state, &job.metadata) {
        (JobState::Ready, Some(meta)) => {
            print!("{}", describe(meta));
            Ok(())
        }
        _ => bail!(
            "could not resolve {}: {}",
            job.target,
            job.last_error.as_deref().unwrap_or(job.state.as_str())
        ),
    }
}

fn describe(meta: &MediaMetadata) -> String {
    let mut out = format!("Title:     {}\n", meta.title);
    if let Some(uploader) = &meta.uploader {
        out.push_str(&format!("Uploader:  {}\n", uploader));
    }
    if let Some(secs) = meta.duration_secs {
        let secs = secs.round() as u64;
        out.push_str(&format!("Duration:  {}:{:02}\n", secs / 60, secs % 60));
    }
    if let Some(thumb) = &meta.thumbnail_url {
        out.push_str(&format!("Thumbnail: {}\n", thumb));
    }
    out
}
