//! Resumable artifact download.
//!
//! The [`DownloadManager`] owns one transfer slot. A transfer streams the
//! remote artifact into a staged file next to the destination
//! (`<dest>.download`), so a live artifact at `dest` is never touched while
//! bytes arrive. Promoting the staged file is the caller's job, after
//! validation.
//!
//! # Transfer lifecycle
//!
//! ```text
//! Idle ──start──▶ Downloading ──▶ Completed
//!                  │    ▲   └───▶ Error
//!             pause│    │resume
//!                  ▼    │
//!                 Paused ──cancel──▶ Cancelled
//! ```
//!
//! Resumption sends `Range: bytes=<k>-` where `k` is the staged file's
//! length. A server that ignores the range (`200`) restarts the file; a
//! `416` discards the staged bytes and retries from zero.
//!
//! Pause and cancel are cooperative: the transfer task notices the request
//! at its next await point (between chunks) and stops there.

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DownloadConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::{DownloadProgress, DownloadState};

const WRITE_BUFFER_BYTES: usize = 1 << 20;

/// Receives the events of one transfer.
///
/// Progress fires at a bounded cadence with non-decreasing byte counts.
/// Exactly one of `on_complete` / `on_error` fires when the transfer
/// finishes on its own; neither fires after a pause or cancel.
pub trait DownloadObserver: Send + Sync {
    fn on_progress(&self, progress: DownloadProgress);
    fn on_error(&self, error: &CoreError);
    /// `staged` holds the complete, not yet validated artifact.
    fn on_complete(&self, staged: &Path);
}

/// Identity of one transfer. Stays the same across pause and resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DownloadHandle(Uuid);

impl std::fmt::Display for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Path of the staged file used while downloading to `dest`.
pub fn staged_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".download");
    PathBuf::from(name)
}

/// Delete `path`. A file that is already gone counts as removed.
pub async fn remove_local_artifact(path: &Path) -> CoreResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::info!(path = %path.display(), "removed local artifact");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::Io(e)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

/// How a transfer task ended.
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(CoreError),
    Paused,
    Cancelled,
}

#[derive(Clone)]
struct TransferJob {
    handle: DownloadHandle,
    url: String,
    staged: PathBuf,
    observer: Arc<dyn DownloadObserver>,
    /// Highest byte count reported so far, shared across resumes.
    reported: Arc<AtomicU64>,
}

struct ActiveTransfer {
    job: TransferJob,
    control: watch::Sender<Control>,
    task: Option<JoinHandle<Outcome>>,
}

struct Slot {
    state: DownloadState,
    active: Option<ActiveTransfer>,
}

struct Shared {
    client: reqwest::Client,
    settings: DownloadConfig,
    slot: Mutex<Slot>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        // The slot holds plain bookkeeping; a poisoned lock still has usable state.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a self-terminated outcome if `handle` still owns the slot.
    fn settle(&self, handle: DownloadHandle, state: DownloadState) -> bool {
        let mut slot = self.slot();
        let owns = slot
            .active
            .as_ref()
            .map(|a| a.job.handle == handle)
            .unwrap_or(false);
        if owns && slot.state == DownloadState::Downloading {
            slot.state = state;
            slot.active = None;
            true
        } else {
            false
        }
    }
}

/// Single-slot resumable downloader.
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl DownloadManager {
    pub fn new(settings: DownloadConfig) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .build()
            .map_err(CoreError::transport)?;

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                settings,
                slot: Mutex::new(Slot {
                    state: DownloadState::Idle,
                    active: None,
                }),
            }),
        })
    }

    pub fn state(&self) -> DownloadState {
        self.shared.slot().state
    }

    /// Handle of the transfer currently owning the slot, if any.
    pub fn current(&self) -> Option<DownloadHandle> {
        self.shared.slot().active.as_ref().map(|a| a.job.handle)
    }

    /// Start streaming `url` into the staged file for `dest`.
    ///
    /// Bytes already present in the staged file are kept and the transfer
    /// continues after them. Fails with [`CoreError::AlreadyInProgress`]
    /// while another transfer is downloading or paused.
    pub fn start_download(
        &self,
        url: &str,
        dest: &Path,
        observer: Arc<dyn DownloadObserver>,
    ) -> CoreResult<DownloadHandle> {
        let mut slot = self.shared.slot();
        if matches!(
            slot.state,
            DownloadState::Downloading | DownloadState::Paused
        ) {
            return Err(CoreError::AlreadyInProgress);
        }

        let job = TransferJob {
            handle: DownloadHandle(Uuid::new_v4()),
            url: url.to_string(),
            staged: staged_path(dest),
            observer,
            reported: Arc::new(AtomicU64::new(0)),
        };
        let handle = job.handle;

        let (control, control_rx) = watch::channel(Control::Run);
        let task = spawn_transfer(Arc::clone(&self.shared), job.clone(), control_rx);

        slot.state = DownloadState::Downloading;
        slot.active = Some(ActiveTransfer {
            job,
            control,
            task: Some(task),
        });

        tracing::info!(%handle, url, dest = %dest.display(), "download started");
        Ok(handle)
    }

    /// Stop `handle` at the next chunk boundary, keeping the staged bytes.
    ///
    /// Returns `false` when there was nothing to pause.
    pub async fn pause(&self, handle: DownloadHandle) -> bool {
        let (task, control) = {
            let mut slot = self.shared.slot();
            if slot.state != DownloadState::Downloading {
                return false;
            }
            match slot.active.as_mut() {
                Some(active) if active.job.handle == handle => {
                    (active.task.take(), active.control.clone())
                }
                _ => return false,
            }
        };

        let _ = control.send(Control::Pause);
        let outcome = match task {
            Some(task) => task.await.ok(),
            None => None,
        };

        if !matches!(outcome, Some(Outcome::Paused)) {
            // The transfer finished on its own before it saw the request.
            return false;
        }

        let mut slot = self.shared.slot();
        let owns = slot
            .active
            .as_ref()
            .map(|a| a.job.handle == handle)
            .unwrap_or(false);
        if owns {
            slot.state = DownloadState::Paused;
            tracing::info!(%handle, "download paused");
        }
        owns
    }

    /// Continue a paused transfer from the staged bytes.
    ///
    /// Returns `false` when `handle` is not paused.
    pub fn resume(&self, handle: DownloadHandle) -> bool {
        let mut slot = self.shared.slot();
        if slot.state != DownloadState::Paused {
            return false;
        }
        let Some(active) = slot.active.as_mut() else {
            return false;
        };
        if active.job.handle != handle {
            return false;
        }

        let _ = active.control.send(Control::Run);
        let control_rx = active.control.subscribe();
        active.task = Some(spawn_transfer(
            Arc::clone(&self.shared),
            active.job.clone(),
            control_rx,
        ));
        slot.state = DownloadState::Downloading;
        tracing::info!(%handle, "download resumed");
        true
    }

    /// Stop `handle` and delete its staged bytes.
    ///
    /// Idempotent: cancelling an idle, finished, or unknown transfer does
    /// nothing and returns `false`.
    pub async fn cancel(&self, handle: DownloadHandle) -> bool {
        let (task, control, staged) = {
            let mut slot = self.shared.slot();
            let state = slot.state;
            match slot.active.as_mut() {
                Some(active) if active.job.handle == handle => match state {
                    DownloadState::Downloading => (
                        active.task.take(),
                        Some(active.control.clone()),
                        active.job.staged.clone(),
                    ),
                    DownloadState::Paused => (None, None, active.job.staged.clone()),
                    _ => return false,
                },
                _ => return false,
            }
        };

        if let Some(control) = control {
            let _ = control.send(Control::Cancel);
        }
        if let Some(task) = task {
            if let Ok(Outcome::Completed | Outcome::Failed(_)) = task.await {
                // Finished first; its terminal callback already ran.
                return false;
            }
        }

        if let Err(e) = remove_local_artifact(&staged).await {
            tracing::warn!(path = %staged.display(), error = %e, "failed to remove staged file");
        }

        let mut slot = self.shared.slot();
        let owns = slot
            .active
            .as_ref()
            .map(|a| a.job.handle == handle)
            .unwrap_or(false);
        if owns {
            slot.state = DownloadState::Cancelled;
            slot.active = None;
            tracing::info!(%handle, "download cancelled");
        }
        owns
    }

    /// Cancel whatever owns the slot and return to `Idle`.
    pub async fn reset(&self) {
        if let Some(handle) = self.current() {
            self.cancel(handle).await;
        }
        let mut slot = self.shared.slot();
        slot.state = DownloadState::Idle;
        slot.active = None;
    }

    /// See [`remove_local_artifact`].
    pub async fn remove_local_artifact(&self, path: &Path) -> CoreResult<()> {
        remove_local_artifact(path).await
    }
}

fn spawn_transfer(
    shared: Arc<Shared>,
    job: TransferJob,
    control: watch::Receiver<Control>,
) -> JoinHandle<Outcome> {
    tokio::spawn(async move {
        let outcome = run_transfer(&shared, &job, control).await;
        match &outcome {
            Outcome::Completed => {
                if shared.settle(job.handle, DownloadState::Completed) {
                    tracing::info!(handle = %job.handle, "download completed");
                    job.observer.on_complete(&job.staged);
                }
            }
            Outcome::Failed(err) => {
                if shared.settle(job.handle, DownloadState::Error) {
                    tracing::warn!(handle = %job.handle, error = %err, "download failed");
                    job.observer.on_error(err);
                }
            }
            Outcome::Paused | Outcome::Cancelled => {}
        }
        outcome
    })
}

async fn run_transfer(
    shared: &Shared,
    job: &TransferJob,
    mut control: watch::Receiver<Control>,
) -> Outcome {
    let settings = &shared.settings;
    let mut restarted = false;

    loop {
        let offset = match tokio::fs::metadata(&job.staged).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = shared.client.get(&job.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            biased;
            _ = control.changed() => return stopped(*control.borrow()),
            sent = tokio::time::timeout(settings.stall_timeout(), request.send()) => match sent {
                Err(_) => return Outcome::Failed(CoreError::Transport("connection timed out".to_string())),
                Ok(Err(e)) => return Outcome::Failed(CoreError::transport(e)),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        let (append, start) = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => (true, offset),
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 && !restarted => {
                tracing::warn!(offset, "server rejected resume range, restarting from zero");
                if let Err(e) = remove_local_artifact(&job.staged).await {
                    return Outcome::Failed(e);
                }
                restarted = true;
                continue;
            }
            s if s.is_success() => (false, 0),
            s => {
                let _ = remove_local_artifact(&job.staged).await;
                return Outcome::Failed(CoreError::Transport(format!(
                    "server responded with HTTP {}",
                    s
                )));
            }
        };

        let expected = if append {
            content_range_total(&response).or_else(|| response.content_length().map(|n| n + start))
        } else {
            response.content_length()
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&job.staged)
            .await;
        let file = match file {
            Ok(f) => f,
            Err(e) => return Outcome::Failed(CoreError::Io(e)),
        };
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);

        let mut tracker = ProgressTracker::new(
            settings.progress_interval(),
            expected,
            Arc::clone(&job.reported),
        );
        let mut written = start;
        if let Some(p) = tracker.observe(written, true) {
            job.observer.on_progress(p);
        }

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                biased;
                _ = control.changed() => {
                    let _ = writer.flush().await;
                    return stopped(*control.borrow());
                }
                next = tokio::time::timeout(settings.stall_timeout(), stream.next()) => match next {
                    Err(_) => {
                        let _ = writer.flush().await;
                        return Outcome::Failed(CoreError::Transport(format!(
                            "transfer stalled: no data for {}s",
                            settings.stall_timeout().as_secs()
                        )));
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = writer.flush().await;
                        return Outcome::Failed(CoreError::transport(e));
                    }
                    Ok(Some(Ok(chunk))) => {
                        if let Err(e) = writer.write_all(&chunk).await {
                            return Outcome::Failed(CoreError::Io(e));
                        }
                        written += chunk.len() as u64;
                        if let Some(p) = tracker.observe(written, false) {
                            job.observer.on_progress(p);
                        }
                    }
                },
            }
        }

        if let Err(e) = writer.flush().await {
            return Outcome::Failed(CoreError::Io(e));
        }
        if let Err(e) = writer.get_ref().sync_all().await {
            return Outcome::Failed(CoreError::Io(e));
        }

        if let Some(total) = expected {
            if written < total {
                return Outcome::Failed(CoreError::Transport(format!(
                    "incomplete transfer: {} of {} bytes",
                    written, total
                )));
            }
            if written > total {
                let _ = remove_local_artifact(&job.staged).await;
                return Outcome::Failed(CoreError::Transport(format!(
                    "received {} bytes, expected {}",
                    written, total
                )));
            }
        }

        if let Some(p) = tracker.observe(written, true) {
            job.observer.on_progress(p);
        }
        return Outcome::Completed;
    }
}

fn stopped(control: Control) -> Outcome {
    match control {
        Control::Pause => Outcome::Paused,
        // A dropped sender or a stray `Run` both end the task as cancelled.
        Control::Cancel | Control::Run => Outcome::Cancelled,
    }
}

/// Total length from `Content-Range: bytes a-b/total`.
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_total(value)
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Throttles progress events and derives speed / ETA from the previous
/// emitted sample.
struct ProgressTracker {
    interval: Duration,
    expected: Option<u64>,
    last: Option<(u64, Instant)>,
    reported: Arc<AtomicU64>,
}

impl ProgressTracker {
    fn new(interval: Duration, expected: Option<u64>, reported: Arc<AtomicU64>) -> Self {
        Self {
            interval,
            expected,
            last: None,
            reported,
        }
    }

    /// Returns an event when one is due. `force` skips the cadence check.
    /// Counts below an earlier report (a restart from zero) are held back
    /// until they catch up, so observers never see the count go down.
    fn observe(&mut self, written: u64, force: bool) -> Option<DownloadProgress> {
        let now = Instant::now();
        if !force {
            if let Some((_, at)) = self.last {
                if now.duration_since(at) < self.interval {
                    return None;
                }
            }
        }
        if written < self.reported.load(Ordering::Acquire) {
            return None;
        }

        let speed = self.last.and_then(|(bytes, at)| {
            let dt = now.duration_since(at).as_secs_f64();
            (dt > 0.0).then(|| written.saturating_sub(bytes) as f64 / dt)
        });
        let eta = match (self.expected, speed) {
            (Some(total), Some(s)) if s > 0.0 => Some(total.saturating_sub(written) as f64 / s),
            _ => None,
        };

        self.last = Some((written, now));
        self.reported.store(written, Ordering::Release);

        Some(DownloadProgress {
            bytes_written: written,
            bytes_expected: self.expected,
            speed_bytes_per_sec: speed,
            eta_seconds: eta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_path_appends_suffix() {
        let staged = staged_path(Path::new("/data/medical.db"));
        assert_eq!(staged, PathBuf::from("/data/medical.db.download"));
    }

    #[test]
    fn content_range_total_parsing() {
        assert_eq!(
            parse_content_range_total("bytes 400000-999999/1000000"),
            Some(1_000_000)
        );
        assert_eq!(parse_content_range_total("bytes 0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn tracker_respects_cadence() {
        let mut tracker =
            ProgressTracker::new(Duration::from_secs(3600), Some(100), Arc::new(AtomicU64::new(0)));
        assert!(tracker.observe(0, true).is_some());
        assert!(tracker.observe(10, false).is_none());
        assert!(tracker.observe(20, false).is_none());
        let last = tracker.observe(100, true).unwrap();
        assert_eq!(last.bytes_written, 100);
        assert_eq!(last.bytes_expected, Some(100));
    }

    #[test]
    fn tracker_first_sample_has_no_speed() {
        let mut tracker =
            ProgressTracker::new(Duration::ZERO, Some(100), Arc::new(AtomicU64::new(0)));
        let first = tracker.observe(0, false).unwrap();
        assert_eq!(first.speed_bytes_per_sec, None);
        assert_eq!(first.eta_seconds, None);

        std::thread::sleep(Duration::from_millis(5));
        let second = tracker.observe(50, false).unwrap();
        let speed = second.speed_bytes_per_sec.unwrap();
        assert!(speed > 0.0);
        let eta = second.eta_seconds.unwrap();
        assert!((eta - 50.0 / speed).abs() < 1e-9);
    }

    #[test]
    fn tracker_never_reports_a_smaller_count() {
        let reported = Arc::new(AtomicU64::new(0));
        let mut first = ProgressTracker::new(Duration::ZERO, None, Arc::clone(&reported));
        assert!(first.observe(500, true).is_some());

        // A restart from zero shares the same high-water mark.
        let mut second = ProgressTracker::new(Duration::ZERO, None, reported);
        assert!(second.observe(0, true).is_none());
        assert!(second.observe(499, false).is_none());
        assert_eq!(second.observe(600, false).unwrap().bytes_written, 600);
    }

    #[tokio::test]
    async fn remove_missing_artifact_is_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        remove_local_artifact(&dir.path().join("nothing.db"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_when_idle_is_a_noop() {
        let manager = DownloadManager::new(DownloadConfig::default()).unwrap();
        let handle = DownloadHandle(Uuid::new_v4());
        assert!(!manager.cancel(handle).await);
        assert_eq!(manager.state(), DownloadState::Idle);
        assert!(!manager.pause(handle).await);
        assert!(!manager.resume(handle));
        assert_eq!(manager.state(), DownloadState::Idle);
    }
}
