//! Artifact lifecycle: sequences validation, download, and store opening
//! into one application-visible state.
//!
//! ```text
//! Checking ──▶ Ready | Missing | Error
//! Missing  ──start──▶ Downloading ──▶ Ready | Error
//! Downloading ◀──pause/resume──▶ Paused
//! Downloading | Paused ──cancel──▶ Missing (or Ready if a valid artifact is still in place)
//! Error ──retry──▶ Downloading
//! any ──reset_and_download──▶ Downloading (from zero)
//! ```
//!
//! State is published through a `tokio::sync::watch` channel; callers read
//! the latest [`LifecycleSnapshot`] or [`subscribe`](LifecycleController::subscribe).
//!
//! Download callbacks carry the epoch they were created in. Cancel, reset,
//! removal, and every new download bump the epoch, so a late callback from
//! an abandoned transfer is dropped instead of resurrecting old state.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};

use crate::config::Config;
use crate::download::{remove_local_artifact, staged_path, DownloadManager, DownloadObserver};
use crate::error::{CoreError, CoreResult};
use crate::models::{ArtifactStatus, DownloadProgress, DownloadState};
use crate::store::KnowledgeStore;
use crate::validate::ArtifactValidator;

pub const CORRUPTED_MESSAGE: &str = "Knowledge base file is corrupted, please re-download.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Checking,
    Ready,
    Missing,
    Downloading,
    Paused,
    Error,
}

impl LifecycleState {
    /// Whether the state will not change without a user action.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            LifecycleState::Ready | LifecycleState::Missing | LifecycleState::Error
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub error: Option<String>,
    pub progress: Option<DownloadProgress>,
    pub artifact: Option<ArtifactStatus>,
}

struct Inner {
    url: String,
    dest: PathBuf,
    validator: ArtifactValidator,
    manager: DownloadManager,
    store: Arc<KnowledgeStore>,
    epoch: AtomicU64,
    /// Serializes user actions and download completion.
    ops: Mutex<()>,
    tx: watch::Sender<LifecycleSnapshot>,
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, state: LifecycleState, error: Option<String>) {
        self.tx.send_modify(|s| {
            s.state = state;
            s.error = error;
            if matches!(state, LifecycleState::Ready | LifecycleState::Missing) {
                s.progress = None;
            }
        });
    }

    fn publish_artifact(&self, state: LifecycleState, error: Option<String>, artifact: ArtifactStatus) {
        self.tx.send_modify(|s| {
            s.state = state;
            s.error = error;
            s.progress = None;
            s.artifact = Some(artifact);
        });
    }

    /// Validate and open the live artifact.
    async fn evaluate(&self) -> LifecycleState {
        self.publish(LifecycleState::Checking, None);

        let status = self.validator.status_async(&self.dest).await;
        if !status.exists {
            self.store.close().await;
            self.publish_artifact(LifecycleState::Missing, None, status);
            return LifecycleState::Missing;
        }
        if status.is_valid != Some(true) {
            tracing::warn!(path = %self.dest.display(), "local artifact failed validation");
            self.store.close().await;
            self.publish_artifact(LifecycleState::Missing, Some(CORRUPTED_MESSAGE.to_string()), status);
            return LifecycleState::Missing;
        }

        match self.store.open(&self.dest).await {
            Ok(()) => {
                self.publish_artifact(LifecycleState::Ready, None, status);
                LifecycleState::Ready
            }
            Err(CoreError::Validation(reason)) => {
                tracing::warn!(%reason, "local artifact could not be opened");
                let message = format!("{} ({})", CORRUPTED_MESSAGE, reason);
                self.publish_artifact(LifecycleState::Missing, Some(message), status);
                LifecycleState::Missing
            }
            Err(e) => {
                self.publish_artifact(LifecycleState::Error, Some(e.to_string()), status);
                LifecycleState::Error
            }
        }
    }

    /// Caller holds `ops`.
    fn begin_download(self: &Arc<Self>) -> CoreResult<()> {
        if matches!(
            self.manager.state(),
            DownloadState::Downloading | DownloadState::Paused
        ) {
            return Err(CoreError::AlreadyInProgress);
        }

        let epoch = self.bump_epoch();
        let previous = self.tx.borrow().clone();
        self.tx.send_modify(|s| {
            s.state = LifecycleState::Downloading;
            s.error = None;
            s.progress = None;
        });

        let observer = Arc::new(LifecycleObserver {
            inner: Arc::downgrade(self),
            epoch,
        });
        if let Err(e) = self.manager.start_download(&self.url, &self.dest, observer) {
            self.tx.send_replace(previous);
            return Err(e);
        }
        Ok(())
    }

    /// Promote a finished transfer after validating it.
    async fn finish_download(self: Arc<Self>, epoch: u64, staged: PathBuf) {
        let _ops = self.ops.lock().await;
        if !self.is_current(epoch) {
            tracing::debug!(epoch, "ignoring completion of an abandoned download");
            return;
        }

        if let Err(reason) = self.validator.check_async(&staged).await {
            tracing::warn!(%reason, "downloaded artifact failed validation");
            if let Err(e) = remove_local_artifact(&staged).await {
                tracing::warn!(error = %e, "failed to remove invalid download");
            }
            self.publish(
                LifecycleState::Error,
                Some(format!("Downloaded file failed validation: {}", reason)),
            );
            return;
        }

        match self.store.swap_in(&staged, &self.dest).await {
            Ok(()) => {
                let status = self.validator.status_async(&self.dest).await;
                self.publish_artifact(LifecycleState::Ready, None, status);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install downloaded artifact");
                self.publish(
                    LifecycleState::Error,
                    Some(format!("Cannot open downloaded knowledge base: {}", e)),
                );
            }
        }
    }
}

struct LifecycleObserver {
    inner: Weak<Inner>,
    epoch: u64,
}

impl LifecycleObserver {
    fn current(&self) -> Option<Arc<Inner>> {
        let inner = self.inner.upgrade()?;
        inner.is_current(self.epoch).then_some(inner)
    }
}

impl DownloadObserver for LifecycleObserver {
    fn on_progress(&self, progress: DownloadProgress) {
        if let Some(inner) = self.current() {
            inner.tx.send_if_modified(|s| {
                if s.state == LifecycleState::Downloading {
                    s.progress = Some(progress);
                    true
                } else {
                    false
                }
            });
        }
    }

    fn on_error(&self, error: &CoreError) {
        if let Some(inner) = self.current() {
            inner.publish(LifecycleState::Error, Some(error.to_string()));
        }
    }

    fn on_complete(&self, staged: &Path) {
        if let Some(inner) = self.current() {
            let staged = staged.to_path_buf();
            let epoch = self.epoch;
            tokio::spawn(inner.finish_download(epoch, staged));
        }
    }
}

/// Cheap to clone; all clones drive the same lifecycle.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(config: &Config, store: Arc<KnowledgeStore>) -> CoreResult<Self> {
        let manager = DownloadManager::new(config.download.clone())?;
        let (tx, _) = watch::channel(LifecycleSnapshot {
            state: LifecycleState::Checking,
            error: None,
            progress: None,
            artifact: None,
        });

        Ok(Self {
            inner: Arc::new(Inner {
                url: config.artifact.url.clone(),
                dest: config.artifact.path.clone(),
                validator: ArtifactValidator::new(config.artifact.min_size_bytes),
                manager,
                store,
                epoch: AtomicU64::new(0),
                ops: Mutex::new(()),
                tx,
            }),
        })
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.inner.tx.borrow().clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.tx.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn artifact_path(&self) -> &Path {
        &self.inner.dest
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.inner.store
    }

    /// Re-validate the local artifact and open it when valid.
    ///
    /// Leaves an active download alone and reports its state.
    pub async fn check(&self) -> LifecycleState {
        let _ops = self.inner.ops.lock().await;
        if matches!(
            self.inner.manager.state(),
            DownloadState::Downloading | DownloadState::Paused
        ) {
            return self.state();
        }
        self.inner.evaluate().await
    }

    /// Download the artifact, continuing from staged bytes if any.
    pub async fn start_download(&self) -> CoreResult<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.begin_download()
    }

    /// Start again after an error.
    pub async fn retry(&self) -> CoreResult<()> {
        self.start_download().await
    }

    pub async fn pause(&self) -> bool {
        let _ops = self.inner.ops.lock().await;
        let Some(handle) = self.inner.manager.current() else {
            return false;
        };
        let paused = self.inner.manager.pause(handle).await;
        if paused {
            self.inner.publish(LifecycleState::Paused, None);
        }
        paused
    }

    pub async fn resume(&self) -> bool {
        let _ops = self.inner.ops.lock().await;
        let Some(handle) = self.inner.manager.current() else {
            return false;
        };
        let resumed = self.inner.manager.resume(handle);
        if resumed {
            self.inner.publish(LifecycleState::Downloading, None);
        }
        resumed
    }

    /// Cancel the active download and delete its staged bytes.
    ///
    /// Returns `false`, changing nothing, when no download is active.
    pub async fn cancel(&self) -> bool {
        let _ops = self.inner.ops.lock().await;
        let Some(handle) = self.inner.manager.current() else {
            return false;
        };
        if !matches!(
            self.inner.manager.state(),
            DownloadState::Downloading | DownloadState::Paused
        ) {
            return false;
        }

        // A transfer that finished before seeing the cancel has already
        // delivered its terminal callback; let that one stand.
        let cancelled = self.inner.manager.cancel(handle).await;
        if cancelled {
            self.inner.bump_epoch();
            self.inner.evaluate().await;
        }
        cancelled
    }

    /// Drop everything local and download from zero.
    pub async fn reset_and_download(&self) -> CoreResult<()> {
        let _ops = self.inner.ops.lock().await;
        let inner = &self.inner;

        inner.bump_epoch();
        inner.manager.reset().await;
        inner.store.close().await;

        for path in [inner.dest.clone(), staged_path(&inner.dest)] {
            if let Err(e) = remove_local_artifact(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "reset could not remove file");
            }
        }

        tracing::info!("artifact reset, downloading from scratch");
        inner.begin_download()
    }

    /// Remove the local artifact and any staged bytes.
    pub async fn remove_artifact(&self) -> CoreResult<()> {
        let _ops = self.inner.ops.lock().await;
        let inner = &self.inner;

        inner.bump_epoch();
        inner.manager.reset().await;
        inner.store.close().await;
        remove_local_artifact(&staged_path(&inner.dest)).await?;
        remove_local_artifact(&inner.dest).await?;

        let status = inner.validator.status_async(&inner.dest).await;
        inner.publish_artifact(LifecycleState::Missing, None, status);
        Ok(())
    }

    /// Wait until the lifecycle reaches a settled state.
    pub async fn wait_settled(&self) -> LifecycleSnapshot {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|s| s.state.is_settled()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }
}
