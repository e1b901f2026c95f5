//! Backend that drives an external yt-dlp compatible program.
//!
//! Metadata comes from `--dump-single-json`; execution parses `--newline`
//! progress lines and reads the produced path from `--print after_move:filepath`.
//! `--print` switches the program to quiet mode, so `--no-quiet` is passed to
//! keep the progress lines coming. Cancellation kills the child and removes
//! its `.part` file.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{BackendError, BackendPhase, BackendProgress, ExecutionBackend, ProgressReporter};
use crate::config::BackendConfig;
use crate::job::{Job, MediaMetadata, OutputKind};

const DEFAULT_AUDIO_FORMAT: &str = "mp3";
const DEFAULT_VIDEO_FORMAT: &str = "bestvideo+bestaudio/best";

/// Post-processor prefixes that mean the transfer is done and output is being produced.
const POSTPROCESSORS: &[&str] = &[
    "[ExtractAudio]",
    "[Merger]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
    "[FixupM3u8]",
    "[FixupM4a]",
    "[EmbedThumbnail]",
    "[Metadata]",
];

#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(cfg: &BackendConfig) -> Self {
        Self::new(&cfg.program).with_extra_args(cfg.extra_args.clone())
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> BackendError {
        BackendError::failed(format!("failed to run {}: {}", self.program.display(), e))
    }
}

#[async_trait]
impl ExecutionBackend for CommandBackend {
    async fn resolve_metadata(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, BackendError> {
        let mut cmd = self.command();
        cmd.args(["--dump-single-json", "--no-playlist", "--skip-download"])
            .arg(target);
        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            out = child.wait_with_output() => out?,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::failed(last_line(&stderr).unwrap_or_else(|| {
                format!("{} exited with {}", self.program.display(), output.status)
            })));
        }
        parse_metadata(&output.stdout)
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, BackendError> {
        tokio::fs::create_dir_all(&job.output.destination).await?;

        let mut cmd = self.command();
        cmd.args(download_args(job));
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::failed("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::failed("child stderr not captured"))?;

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let (mut out_open, mut err_open) = (true, true);
        let mut tracker = OutputTracker::default();
        let mut last_error: Option<String> = None;

        while out_open || err_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    tracker.remove_partial().await;
                    return Err(BackendError::Cancelled);
                }
                line = out_lines.next_line(), if out_open => match line? {
                    Some(line) => {
                        if let Some(p) = tracker.observe(&line) {
                            progress.report(p);
                        } else {
                            tracker.observe_output_path(&line);
                        }
                    }
                    None => out_open = false,
                },
                line = err_lines.next_line(), if err_open => match line? {
                    Some(line) => {
                        if let Some(p) = tracker.observe(&line) {
                            progress.report(p);
                        } else if !line.trim().is_empty() {
                            last_error = Some(line.trim().to_string());
                        }
                    }
                    None => err_open = false,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                tracker.remove_partial().await;
                return Err(BackendError::Cancelled);
            }
            status = child.wait() => status?,
        };
        if !status.success() {
            return Err(BackendError::failed(last_error.unwrap_or_else(|| {
                format!("{} exited with {}", self.program.display(), status)
            })));
        }
        tracker
            .output_path
            .ok_or_else(|| BackendError::failed("backend did not report an output path"))
    }
}

/// Command-line arguments for producing `job`'s output.
fn download_args(job: &Job) -> Vec<String> {
    let template = job.output.destination.join("%(title)s.%(ext)s");
    let mut args: Vec<String> = [
        "--newline",
        "--progress",
        "--no-playlist",
        "--print",
        "after_move:filepath",
        "--no-quiet",
        "-o",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(template.to_string_lossy().into_owned());

    let quality = job.output.quality.as_deref();
    match job.output.kind {
        OutputKind::Audio => {
            args.push("-x".into());
            args.push("--audio-format".into());
            args.push(quality.unwrap_or(DEFAULT_AUDIO_FORMAT).into());
        }
        OutputKind::Video => {
            args.push("-f".into());
            args.push(quality.unwrap_or(DEFAULT_VIDEO_FORMAT).into());
            args.push("--merge-output-format".into());
            args.push("mp4".into());
        }
    }
    args.push(job.target.clone());
    args
}

#[derive(Debug, Default)]
struct OutputTracker {
    last_percent: f64,
    /// Current `[download] Destination:` file, removed with a `.part` suffix on cancel.
    destination: Option<PathBuf>,
    output_path: Option<PathBuf>,
}

impl OutputTracker {
    /// Progress carried by a log line, if any.
    fn observe(&mut self, line: &str) -> Option<BackendProgress> {
        let line = line.trim();
        if let Some(dest) = line.strip_prefix("[download] Destination:") {
            self.destination = Some(PathBuf::from(dest.trim()));
            return None;
        }
        if let Some(p) = parse_progress_line(line) {
            self.last_percent = p.percent;
            return Some(p);
        }
        if POSTPROCESSORS.iter().any(|prefix| line.starts_with(prefix)) {
            return Some(BackendProgress::new(
                BackendPhase::Converting,
                self.last_percent,
            ));
        }
        None
    }

    /// Plain stdout lines are `--print` output: the final file path.
    fn observe_output_path(&mut self, line: &str) {
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('[') {
            self.output_path = Some(PathBuf::from(line));
        }
    }

    async fn remove_partial(&self) {
        let Some(dest) = &self.destination else {
            return;
        };
        let mut part = dest.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);
        match tokio::fs::remove_file(&part).await {
            Ok(()) => tracing::debug!(path = %part.display(), "removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %part.display(), "could not remove partial download: {}", e),
        }
    }
}

/// Parses `[download]  42.3% of ~ 10.00MiB at  1.23MiB/s ETA 00:05`.
fn parse_progress_line(line: &str) -> Option<BackendProgress> {
    let rest = line.trim().strip_prefix("[download]")?;
    let mut tokens = rest.split_whitespace();
    let percent: f64 = tokens.next()?.strip_suffix('%')?.parse().ok()?;

    let mut total = None;
    let mut speed = None;
    let mut eta = None;
    while let Some(tok) = tokens.next() {
        match tok {
            "of" => {
                let mut size = tokens.next();
                if size == Some("~") {
                    size = tokens.next();
                }
                total = size.and_then(|s| parse_size(s.trim_start_matches('~')));
            }
            "at" => {
                speed = tokens
                    .next()
                    .and_then(|s| s.strip_suffix("/s"))
                    .and_then(parse_size)
                    .map(|b| b as f64);
            }
            "ETA" => eta = tokens.next().and_then(parse_clock),
            _ => {}
        }
    }

    let mut p = BackendProgress::new(BackendPhase::Downloading, percent)
        .with_total(total)
        .with_speed(speed)
        .with_eta(eta);
    p.bytes_done = total.map(|t| (t as f64 * p.percent / 100.0) as u64);
    Some(p)
}

/// `10.00MiB` -> bytes. Binary and decimal units are both accepted.
fn parse_size(s: &str) -> Option<u64> {
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = s.split_at(split);
    let value: f64 = num.parse().ok()?;
    let mult: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * mult) as u64)
}

/// `01:02:03` / `02:03` -> seconds.
fn parse_clock(s: &str) -> Option<f64> {
    let mut secs = 0u64;
    for part in s.split(':') {
        secs = secs.checked_mul(60)?.checked_add(part.parse().ok()?)?;
    }
    Some(secs as f64)
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
}

#[derive(Deserialize)]
struct InfoJson {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
}

fn parse_metadata(json: &[u8]) -> Result<MediaMetadata, BackendError> {
    let info: InfoJson = serde_json::from_slice(json)?;
    Ok(MediaMetadata {
        title: info.title.unwrap_or_default(),
        duration_secs: info.duration,
        uploader: info.uploader,
        thumbnail_url: info.thumbnail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, OutputSpec};
    #[cfg(unix)]
    use {parking_lot::Mutex, std::path::Path, std::sync::Arc, std::time::Duration};

    #[test]
    fn parses_download_progress_line() {
        let p = parse_progress_line("[download]  42.0% of ~  10.00MiB at    1.50MiB/s ETA 00:05")
            .unwrap();
        assert_eq!(p.phase, BackendPhase::Downloading);
        assert_eq!(p.percent, 42.0);
        assert_eq!(p.total_bytes, Some(10 * 1024 * 1024));
        assert_eq!(p.speed_bps, Some(1.5 * 1024.0 * 1024.0));
        assert_eq!(p.eta_secs, Some(5.0));
        assert_eq!(p.bytes_done, Some((10.0 * 1024.0 * 1024.0 * 0.42) as u64));
    }

    #[test]
    fn parses_finished_and_unknown_fields() {
        let p = parse_progress_line("[download] 100% of   3.20MiB in 00:00:02 at 1.60MiB/s").unwrap();
        assert_eq!(p.percent, 100.0);
        assert_eq!(p.eta_secs, None);

        let p = parse_progress_line("[download]   0.1% of Unknown B at Unknown B/s ETA Unknown")
            .unwrap();
        assert_eq!(p.total_bytes, None);
        assert_eq!(p.speed_bps, None);
        assert_eq!(p.eta_secs, None);
    }

    #[test]
    fn ignores_non_progress_lines() {
        assert!(parse_progress_line("[download] Destination: /tmp/a.webm").is_none());
        assert!(parse_progress_line("[youtube] abc: Downloading webpage").is_none());
        assert!(parse_progress_line("/tmp/a.mp3").is_none());
    }

    #[test]
    fn size_and_clock_units() {
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("2KiB"), Some(2048));
        assert_eq!(parse_size("1.5MB"), Some(1_500_000));
        assert_eq!(parse_size("Unknown"), None);
        assert_eq!(parse_size("12XiB"), None);
        assert_eq!(parse_clock("00:05"), Some(5.0));
        assert_eq!(parse_clock("01:02:03"), Some(3723.0));
        assert_eq!(parse_clock("--:--"), None);
        assert_eq!(parse_clock("307445734561825860:59"), None);
        assert_eq!(parse_clock("99999:99999:99999:99999:99999"), None);
    }

    #[test]
    fn tracker_switches_to_converting_and_captures_path() {
        let mut t = OutputTracker::default();
        assert!(t.observe("[download] Destination: /tmp/out/Song.webm").is_none());
        assert_eq!(t.destination, Some(PathBuf::from("/tmp/out/Song.webm")));

        let p = t.observe("[download]  80.0% of 4.00MiB at 1.00MiB/s ETA 00:01").unwrap();
        assert_eq!(p.phase, BackendPhase::Downloading);

        let p = t
            .observe("[ExtractAudio] Destination: /tmp/out/Song.mp3")
            .unwrap();
        assert_eq!(p.phase, BackendPhase::Converting);
        assert_eq!(p.percent, 80.0);

        t.observe_output_path("[info] something");
        assert!(t.output_path.is_none());
        t.observe_output_path("/tmp/out/Song.mp3\n");
        assert_eq!(t.output_path, Some(PathBuf::from("/tmp/out/Song.mp3")));
    }

    #[test]
    fn audio_and_video_arguments() {
        let audio = Job::new(
            JobId::from("1"),
            "https://media.example/a",
            OutputSpec::audio("/music"),
        );
        let args = download_args(&audio);
        assert_eq!(args.last().map(String::as_str), Some("https://media.example/a"));
        assert!(args.windows(2).any(|w| w == ["--audio-format", "mp3"]));
        assert!(args.iter().any(|a| a == "/music/%(title)s.%(ext)s"));
        let pos = |flag: &str| args.iter().position(|a| a == flag);
        assert!(pos("--no-quiet").is_some());
        assert!(pos("--no-quiet") > pos("--print"), "--print would silence progress");

        let video = Job::new(
            JobId::from("2"),
            "https://media.example/v",
            OutputSpec::video("/videos").with_quality("best[height<=720]"),
        );
        let args = download_args(&video);
        assert!(args.windows(2).any(|w| w == ["-f", "best[height<=720]"]));
        assert!(args.windows(2).any(|w| w == ["--merge-output-format", "mp4"]));
        assert!(!args.iter().any(|a| a == "-x"));
    }

    #[test]
    fn metadata_from_info_json() {
        let json = br#"{"id":"abc","title":"A Song","duration":215.0,"uploader":"Band","thumbnail":"https://img/x.jpg","formats":[]}"#;
        let meta = parse_metadata(json).unwrap();
        assert_eq!(meta.title, "A Song");
        assert_eq!(meta.duration_secs, Some(215.0));
        assert_eq!(meta.uploader.as_deref(), Some("Band"));
        assert_eq!(meta.thumbnail_url.as_deref(), Some("https://img/x.jpg"));

        assert!(matches!(parse_metadata(b"not json"), Err(BackendError::Parse(_))));
    }

    #[test]
    fn last_line_skips_blank_lines() {
        assert_eq!(
            last_line("WARNING: x\nERROR: Video unavailable\n\n").as_deref(),
            Some("ERROR: Video unavailable")
        );
        assert_eq!(last_line("  \n"), None);
    }

    #[tokio::test]
    async fn missing_program_fails_without_panicking() {
        let backend = CommandBackend::new("/nonexistent/mediaq-test-program");
        let err = backend
            .resolve_metadata("https://media.example/a", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_cancelled());
        assert!(err.to_string().contains("failed to run"));
    }

    /// Backend running `body` as a stand-in program through `/bin/sh`.
    #[cfg(unix)]
    fn scripted(dir: &Path, body: &str) -> CommandBackend {
        let script = dir.join("fake-downloader.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        CommandBackend::new("/bin/sh").with_extra_args(vec![script.to_string_lossy().into_owned()])
    }

    #[cfg(unix)]
    fn recording() -> (ProgressReporter, Arc<Mutex<Vec<BackendProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reporter = {
            let seen = Arc::clone(&seen);
            ProgressReporter::new(move |p| seen.lock().push(p))
        };
        (reporter, seen)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_reports_progress_and_output_path() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let backend = scripted(
            tmp.path(),
            &format!(
                r#"case " $* " in *" --no-quiet "*) ;; *) echo "ERROR: started quiet" >&2; exit 3 ;; esac
echo "[download] Destination: {dir}/Song.webm"
echo "[download]  10.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "[download] 100% of 1.00MiB in 00:00:01 at 1.00MiB/s"
echo "[ExtractAudio] Destination: {dir}/Song.mp3"
echo "Deleting original file {dir}/Song.webm (pass -k to keep)"
echo "{dir}/Song.mp3""#,
                dir = out.display()
            ),
        );
        let job = Job::new(JobId::from("1"), "https://media.example/a", OutputSpec::audio(&out));
        let (reporter, seen) = recording();

        let path = backend
            .execute(&job, &CancellationToken::new(), &reporter)
            .await
            .unwrap();
        assert_eq!(path, out.join("Song.mp3"));
        assert!(out.is_dir());

        let seen = seen.lock();
        let steps: Vec<_> = seen.iter().map(|p| (p.phase, p.percent)).collect();
        assert_eq!(
            steps,
            [
                (BackendPhase::Downloading, 10.0),
                (BackendPhase::Downloading, 100.0),
                (BackendPhase::Converting, 100.0),
            ]
        );
        assert_eq!(seen[0].total_bytes, Some(1024 * 1024));
        assert_eq!(seen[0].eta_secs, Some(1.0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_failure_carries_last_stderr_line() {
        let tmp = tempfile::tempdir().unwrap();
        let job = Job::new(JobId::from("1"), "https://media.example/a", OutputSpec::audio(tmp.path()));
        let (reporter, seen) = recording();

        let backend = scripted(
            tmp.path(),
            r#"echo "[download]   5.0% of 1.00MiB at 1.00MiB/s ETA 00:09"
echo "WARNING: retrying fragment" >&2
echo "ERROR: boom" >&2
exit 2"#,
        );
        let err = backend
            .execute(&job, &CancellationToken::new(), &reporter)
            .await
            .unwrap_err();
        assert!(matches!(&err, BackendError::Failed(m) if m == "ERROR: boom"), "{err:?}");
        assert_eq!(seen.lock().len(), 1);

        let backend = scripted(tmp.path(), "exit 0");
        let err = backend
            .execute(&job, &CancellationToken::new(), &reporter)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backend did not report an output path");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_cancel_kills_child_and_removes_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let part = tmp.path().join("clip.webm.part");
        let backend = scripted(
            tmp.path(),
            &format!(
                r#"echo "[download] Destination: {dir}/clip.webm"
: > "{dir}/clip.webm.part"
echo "[download]   1.0% of 1.00MiB at 1.00MiB/s ETA 00:59"
exec sleep 30"#,
                dir = tmp.path().display()
            ),
        );
        let job = Job::new(JobId::from("1"), "https://media.example/a", OutputSpec::audio(tmp.path()));
        let cancel = CancellationToken::new();
        let reporter = {
            let cancel = cancel.clone();
            ProgressReporter::new(move |_| cancel.cancel())
        };

        let err = tokio::time::timeout(Duration::from_secs(5), backend.execute(&job, &cancel, &reporter))
            .await
            .expect("cancelled child was not killed")
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!part.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_reads_info_json_from_child() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = scripted(tmp.path(), r#"echo '{"title":"A Song","duration":12.5}'"#);
        let meta = backend
            .resolve_metadata("https://media.example/a", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(meta.title, "A Song");
        assert_eq!(meta.duration_secs, Some(12.5));

        let backend = scripted(tmp.path(), "echo 'ERROR: Unsupported URL' >&2; exit 1");
        let err = backend
            .resolve_metadata("https://media.example/a", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "ERROR: Unsupported URL");
    }
}
