//! `mediaq fetch` – queue URLs and run them to completion.

use anyhow::{bail, Result};
use mediaq_core::config::QueueConfig;
use mediaq_core::events::ProgressRecord;
use mediaq_core::{
    CommandBackend, EventBus, Job, JobId, JobState, OutputSpec, QueueError, QueueEvent, Scheduler,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::oneshot;

use super::parse_target;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub audio: bool,
    pub quality: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
}

impl FetchOptions {
    fn output_spec(&self, dest: &Path) -> OutputSpec {
        let spec = if self.audio {
            OutputSpec::audio(dest)
        } else {
            OutputSpec::video(dest)
        };
        match &self.quality {
            Some(q) => spec.with_quality(q.clone()),
            None => spec,
        }
    }
}

pub async fn run_fetch(cfg: &QueueConfig, urls: &[String], opts: FetchOptions) -> Result<()> {
    let targets = urls
        .iter()
        .map(|u| parse_target(u))
        .collect::<Result<Vec<_>>>()?;
    let dest = match opts.output_dir.clone().or_else(|| cfg.output_dir.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let limit = opts.jobs.unwrap_or(cfg.max_concurrent_jobs);

    let bus = Arc::new(EventBus::new(cfg.event_capacity()));
    let events = bus.subscribe();
    let backend = Arc::new(CommandBackend::from_config(&cfg.backend));
    let sched = Scheduler::with_limit(limit, backend, bus);

    for (n, target) in targets.into_iter().enumerate() {
        match sched.add_item(JobId::new((n + 1).to_string()), target, opts.output_spec(&dest)) {
            Ok(_) => {}
            Err(QueueError::DuplicateTarget(t)) => println!("Skipping duplicate: {t}"),
            Err(e) => return Err(e.into()),
        }
    }
    println!(
        "Fetching {} item(s), {} at a time, into {}",
        sched.len(),
        sched.concurrency_limit(),
        dest.display()
    );

    let (stop_printer, printer_stop) = oneshot::channel();
    let printer = tokio::spawn(print_events(events, printer_stop));
    sched.start_all();

    tokio::select! {
        _ = sched.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, cancelling...");
            sched.cancel_all();
            sched.wait_idle().await;
        }
    }
    let _ = stop_printer.send(());
    if let Err(e) = printer.await {
        tracing::debug!("progress printer ended abnormally: {}", e);
    }

    summarize(&sched.get_all_items())
}

/// Prints events until `stop` fires, then flushes whatever the bus still
/// holds. Returns the number of lines printed.
async fn print_events(
    mut rx: broadcast::Receiver<QueueEvent>,
    mut stop: oneshot::Receiver<()>,
) -> usize {
    let mut printer = Printer::default();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => printer.print(&event),
                Err(RecvError::Lagged(n)) => tracing::debug!("progress printer skipped {} event(s)", n),
                Err(RecvError::Closed) => return printer.lines,
            },
            _ = &mut stop => break,
        }
    }
    loop {
        match rx.try_recv() {
            Ok(event) => printer.print(&event),
            Err(TryRecvError::Lagged(n)) => tracing::debug!("progress printer skipped {} event(s)", n),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    printer.lines
}

#[derive(Default)]
struct Printer {
    last_print: HashMap<JobId, Instant>,
    lines: usize,
}

impl Printer {
    fn print(&mut self, event: &QueueEvent) {
        match event {
            QueueEvent::Progress(p) => {
                let now = Instant::now();
                let due = self
                    .last_print
                    .get(&p.job_id)
                    .map_or(true, |t| now.duration_since(*t) >= PROGRESS_INTERVAL);
                if due || p.percent >= 100.0 {
                    println!("  [{}] {:<11} {}", p.job_id, p.state, format_progress(p));
                    self.last_print.insert(p.job_id.clone(), now);
                    self.lines += 1;
                }
            }
            QueueEvent::Complete(done) => {
                println!("  [{}] saved {}", done.job_id, done.result_path.display());
                self.lines += 1;
            }
            QueueEvent::QueueUpdated(_) => {}
        }
    }
}

fn format_progress(p: &ProgressRecord) -> String {
    let mut line = format!("{:5.1}%", p.percent);
    if let Some(total) = p.total_bytes {
        line.push_str(&format!(" of {:.1} MiB", total as f64 / 1_048_576.0));
    }
    if let Some(speed) = p.speed_bps {
        line.push_str(&format!("  {:.2} MiB/s", speed / 1_048_576.0));
    }
    if let Some(eta) = p.eta_secs {
        line.push_str(&format!("  ETA {:.0}s", eta));
    }
    line
}

/// Prints one line per job; errors if any job failed.
fn summarize(jobs: &[Job]) -> Result<()> {
    if jobs.is_empty() {
        println!("Nothing to fetch.");
        return Ok(());
    }
    println!("{:<4} {:<10} {}", "ID", "STATE", "RESULT");
    let mut failed = 0;
    for job in jobs {
        let detail = match job.state {
            JobState::Completed => job
                .result_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            JobState::Failed => {
                failed += 1;
                job.last_error.clone().unwrap_or_default()
            }
            _ => job.display_name().to_string(),
        };
        println!("{:<4} {:<10} {}", job.id, job.state, detail);
    }
    if failed > 0 {
        bail!("{} of {} job(s) failed", failed, jobs.len());
    }
    Ok(())
}
