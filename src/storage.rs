use crate::config::{StorageClass, TRANSFER_CHUNK_SIZE};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// How a transfer ended when it did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Cancelled,
    Paused,
    /// Retrying cannot help, e.g. the local source is gone or unreadable.
    Unrecoverable,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct TransferError {
    pub kind: FailureKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    pub fn paused(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Paused, message)
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unrecoverable, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Other
    }
}

impl From<std::io::Error> for TransferError {
    fn from(error: std::io::Error) -> Self {
        TransferError::other(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub key: String,
    pub path: PathBuf,
    pub storage_class: StorageClass,
}

/// One progress callback from a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_expected: u64,
}

impl TransferProgress {
    /// Completed fraction in `[0.0, 1.0]`; an unknown total counts as 0.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes_expected == 0 {
            return 0.0;
        }
        let fraction = self.total_bytes_sent as f64 / self.total_bytes_expected as f64;
        if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Handle a backend uses to report progress. Cheap to clone, callable from
/// any thread.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(TransferProgress) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        Self { sink: Arc::new(sink) }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, bytes_sent: u64, total_bytes_sent: u64, total_bytes_expected: u64) {
        (self.sink)(TransferProgress {
            bytes_sent,
            total_bytes_sent,
            total_bytes_expected,
        });
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

/// Remote storage the upload pipeline writes to.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Transfer `request.path` to `request.key`. Resolves once the remote
    /// copy is confirmed or the attempt failed.
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressReporter,
    ) -> Result<(), TransferError>;

    fn name(&self) -> &str;
}

/// A bucket that is a local directory; keys are relative paths inside it.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
    chunk_size: usize,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: TRANSFER_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `key` lands inside the bucket. Keys may not escape the root.
    pub fn object_path(&self, key: &str) -> Result<PathBuf, TransferError> {
        let relative = Path::new(key);
        let well_formed = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed {
            return Err(TransferError::other(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }

    async fn copy_into(
        &self,
        source: &mut tokio::fs::File,
        partial: &Path,
        total: u64,
        progress: &ProgressReporter,
    ) -> Result<u64, TransferError> {
        let mut sink = tokio::fs::File::create(partial).await?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        loop {
            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            sink.write_all(&buffer[..read]).await?;
            sent += read as u64;
            progress.report(read as u64, sent, total);
        }

        sink.flush().await?;
        sink.sync_all().await?;
        Ok(sent)
    }
}

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp name unique to this attempt: `.<file name>.<pid>-<n>.partial`, so
/// keys sharing a stem never share a temp file.
fn partial_path(destination: &Path) -> PathBuf {
    let n = PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.{}-{}.partial", file_name, std::process::id(), n))
}

// A missing or unreadable local source will not come back by retrying.
async fn open_source(path: &Path) -> Result<tokio::fs::File, TransferError> {
    tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            TransferError::unrecoverable(format!("cannot read {}: {}", path.display(), e))
        }
        _ => e.into(),
    })
}

#[async_trait]
impl StorageBackend for DirectoryStorage {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressReporter,
    ) -> Result<(), TransferError> {
        let destination = self.object_path(&request.key)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut source = open_source(&request.path).await?;
        let total = source.metadata().await?.len();

        // Write next to the destination and rename once complete so a
        // half-written object is never visible under its key.
        let partial = partial_path(&destination);
        let sent = match self.copy_into(&mut source, &partial, total, &progress).await {
            Ok(sent) => sent,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&partial, &destination).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        debug!(
            key = %request.key,
            bytes = sent,
            storage_class = ?request.storage_class,
            "object stored"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "directory"
    }
}
