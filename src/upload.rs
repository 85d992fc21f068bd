// Upload pipeline: one tracked task per object key, progress published as a
// single aggregate view, failed transfers retried after a fixed delay.
//
// Every mutation of the tracked set happens under one mutex and is followed
// by publishing a fresh view on a watch channel while still holding it, so
// subscribers observe updates in the order they were applied.

use crate::config::{UploadConfig, FAILED_PROGRESS_SENTINEL};
use crate::error::{RecorderError, Result};
use crate::storage::{
    FailureKind, ProgressReporter, StorageBackend, TransferError, TransferProgress, UploadRequest,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// A finished recording waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub key: String,
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
        }
    }

    /// Key the artifact as `<prefix>/<file name>`.
    pub fn for_recording(path: impl Into<PathBuf>, key_prefix: &str) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                RecorderError::InvalidConfig(format!(
                    "recording path {} has no file name",
                    path.display()
                ))
            })?;

        let prefix = key_prefix.trim_matches('/');
        let key = if prefix.is_empty() {
            file_name
        } else {
            format!("{}/{}", prefix, file_name)
        };

        Ok(Self { key, path })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum UploadState {
    /// Transfer running; completed fraction in `[0.0, 1.0]`.
    InFlight(f64),
    /// Last attempt failed, another one is scheduled.
    RetryPending,
    /// Cancelled, paused, or failed for good. Not retried.
    Halted(FailureKind),
    /// Retry limit reached.
    Abandoned,
}

impl UploadState {
    /// Progress as published in the aggregate view; every state other than
    /// in-flight reads as the failure sentinel.
    pub fn progress_fraction(&self) -> f64 {
        match self {
            UploadState::InFlight(fraction) => *fraction,
            _ => FAILED_PROGRESS_SENTINEL,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, UploadState::InFlight(_) | UploadState::RetryPending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub artifact: Artifact,
    pub state: UploadState,
    pub retry_count: u32,
}

/// Point-in-time mapping from object key to completed fraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressView {
    entries: BTreeMap<String, f64>,
}

impl ProgressView {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(key, progress)| (key.as_str(), *progress))
    }
}

impl fmt::Display for ProgressView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return Ok(());
        }
        f.write_str("Uploading: ")?;
        for (i, (key, progress)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {:.2}%", key, progress * 100.0)?;
        }
        Ok(())
    }
}

struct UploadTask {
    artifact: Artifact,
    state: UploadState,
    retry_count: u32,
    // Bumped on every attempt; callbacks carrying an older value are stale.
    generation: u64,
    // The running transfer or the pending retry timer.
    handle: Option<AbortHandle>,
    // Remote copy confirmed; the local file is being deleted.
    completing: bool,
}

struct Tracked {
    tasks: HashMap<String, UploadTask>,
    next_generation: u64,
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    config: UploadConfig,
    runtime: Handle,
    tracked: Mutex<Tracked>,
    view: watch::Sender<ProgressView>,
}

/// Tracks and drives uploads. Clones share the same tracked set.
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

impl UploadCoordinator {
    /// Must be created inside a Tokio runtime; transfers and retries are
    /// spawned onto it.
    pub fn new(backend: Arc<dyn StorageBackend>, config: UploadConfig) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let (view, _) = watch::channel(ProgressView::default());

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                config,
                runtime,
                tracked: Mutex::new(Tracked {
                    tasks: HashMap::new(),
                    next_generation: 0,
                }),
                view,
            }),
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    /// Start uploading `artifact`. A task already tracked under the same key
    /// is cancelled and replaced, unless it is the same file and its remote
    /// copy has already been confirmed.
    pub fn submit(&self, artifact: Artifact) {
        let mut tracked = self.inner.lock();

        // Already stored; restarting would read a file that is being deleted.
        let finishing = tracked
            .tasks
            .get(&artifact.key)
            .is_some_and(|task| task.completing && task.artifact.path == artifact.path);
        if finishing {
            debug!(key = %artifact.key, "upload already confirmed, ignoring resubmission");
            return;
        }

        self.inner.start_attempt(&mut tracked, artifact, 0);
    }

    /// Snapshot of every tracked upload.
    pub fn progress(&self) -> ProgressView {
        self.inner.view.borrow().clone()
    }

    /// Receiver that is notified after every change to the tracked set.
    pub fn subscribe(&self) -> watch::Receiver<ProgressView> {
        self.inner.view.subscribe()
    }

    pub fn task(&self, key: &str) -> Option<TaskSnapshot> {
        self.inner.lock().tasks.get(key).map(|task| TaskSnapshot {
            artifact: task.artifact.clone(),
            state: task.state,
            retry_count: task.retry_count,
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// True while any upload is running or waiting to retry.
    pub fn has_active(&self) -> bool {
        self.inner.lock().tasks.values().any(|task| task.state.is_active())
    }

    /// Wait until nothing is running or scheduled to retry.
    pub async fn settled(&self) {
        let mut updates = self.subscribe();
        while self.has_active() {
            if updates.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, tracked: &Tracked) {
        let entries = tracked
            .tasks
            .iter()
            .map(|(key, task)| (key.clone(), task.state.progress_fraction()))
            .collect();
        self.view.send_replace(ProgressView { entries });
    }

    fn start_attempt(self: &Arc<Self>, tracked: &mut Tracked, artifact: Artifact, retry_count: u32) {
        let key = artifact.key.clone();

        if let Some(previous) = tracked.tasks.remove(&key) {
            if let Some(handle) = previous.handle {
                handle.abort();
            }
            debug!(key = %key, "superseding tracked upload");
        }

        tracked.next_generation += 1;
        let generation = tracked.next_generation;

        let request = UploadRequest {
            key: key.clone(),
            path: artifact.path.clone(),
            storage_class: self.config.storage_class,
        };

        tracked.tasks.insert(
            key.clone(),
            UploadTask {
                artifact,
                state: UploadState::InFlight(0.0),
                retry_count,
                generation,
                handle: None,
                completing: false,
            },
        );
        self.publish(tracked);

        let reporter = {
            let inner = Arc::clone(self);
            let key = key.clone();
            ProgressReporter::new(move |progress| inner.on_progress(&key, generation, progress))
        };

        let inner = Arc::clone(self);
        let backend = Arc::clone(&self.backend);
        let task_key = key.clone();
        let transfer = self.runtime.spawn(async move {
            let result = backend.upload(request, reporter).await;
            inner.on_finished(task_key, generation, result).await;
        });

        if let Some(task) = tracked.tasks.get_mut(&key) {
            task.handle = Some(transfer.abort_handle());
        }

        info!(key = %key, retry = retry_count, backend = self.backend.name(), "upload started");
    }

    fn on_progress(&self, key: &str, generation: u64, progress: TransferProgress) {
        let mut tracked = self.lock();
        let Some(task) = tracked.tasks.get_mut(key) else {
            return;
        };
        if task.generation != generation || !matches!(task.state, UploadState::InFlight(_)) {
            return;
        }
        task.state = UploadState::InFlight(progress.fraction());
        self.publish(&tracked);
    }

    async fn on_finished(
        self: Arc<Self>,
        key: String,
        generation: u64,
        result: std::result::Result<(), TransferError>,
    ) {
        match result {
            Ok(()) => self.on_succeeded(key, generation).await,
            Err(error) => self.on_failed(&key, generation, error),
        }
    }

    async fn on_succeeded(&self, key: String, generation: u64) {
        let path = {
            let mut tracked = self.lock();
            match tracked.tasks.get_mut(&key) {
                Some(task) if task.generation == generation => {
                    task.completing = true;
                    task.artifact.path.clone()
                }
                _ => {
                    debug!(key = %key, "ignoring result of superseded upload");
                    return;
                }
            }
        };

        info!(key = %key, path = %path.display(), "file uploaded successfully");

        // The remote copy is authoritative; a failed delete only gets logged.
        if let Err(e) = delete_local(&path).await {
            warn!(path = %path.display(), error = %e, "could not delete uploaded file");
        }

        let mut tracked = self.lock();
        let current = tracked
            .tasks
            .get(&key)
            .is_some_and(|task| task.generation == generation);
        if current {
            tracked.tasks.remove(&key);
            self.publish(&tracked);
        }
    }

    fn on_failed(self: &Arc<Self>, key: &str, generation: u64, failure: TransferError) {
        let mut tracked = self.lock();
        let Some(task) = tracked.tasks.get_mut(key) else {
            return;
        };
        if task.generation != generation {
            debug!(key = %key, "ignoring failure of superseded upload");
            return;
        }
        task.handle = None;

        match failure.kind {
            FailureKind::Cancelled => {
                info!(key = %key, "upload cancelled");
                task.state = UploadState::Halted(FailureKind::Cancelled);
            }
            FailureKind::Paused => {
                info!(key = %key, "upload paused");
                task.state = UploadState::Halted(FailureKind::Paused);
            }
            FailureKind::Unrecoverable => {
                error!(key = %key, error = %failure.message, "upload failed, not retrying");
                task.state = UploadState::Halted(FailureKind::Unrecoverable);
            }
            FailureKind::Other => {
                let exhausted = match self.config.max_retries {
                    Some(max) => task.retry_count >= max,
                    None => false,
                };

                if exhausted {
                    error!(
                        key = %key,
                        error = %failure.message,
                        retries = task.retry_count,
                        "upload failed, giving up"
                    );
                    task.state = UploadState::Abandoned;
                } else {
                    warn!(
                        key = %key,
                        error = %failure.message,
                        retry_in_ms = self.config.retry_delay.as_millis() as u64,
                        "upload failed, retrying"
                    );
                    task.state = UploadState::RetryPending;

                    let inner = Arc::clone(self);
                    let delay = self.config.retry_delay;
                    let retry_key = key.to_string();
                    let timer = self.runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.retry(&retry_key, generation);
                    });
                    task.handle = Some(timer.abort_handle());
                }
            }
        }

        self.publish(&tracked);
    }

    fn retry(self: &Arc<Self>, key: &str, generation: u64) {
        let mut tracked = self.lock();
        let Some(task) = tracked.tasks.get_mut(key) else {
            return;
        };
        if task.generation != generation || task.state != UploadState::RetryPending {
            return;
        }
        // This timer is the task being run; don't abort it from inside.
        task.handle = None;
        let artifact = task.artifact.clone();
        let retry_count = task.retry_count.saturating_add(1);

        self.start_attempt(&mut tracked, artifact, retry_count);
    }
}

async fn delete_local(path: &Path) -> std::io::Result<()> {
    tokio::fs::remove_file(path).await
}
