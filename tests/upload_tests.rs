use async_trait::async_trait;
use demo_recorder::{
    Artifact, DirectoryStorage, FailureKind, ProgressReporter, ProgressView, StorageBackend,
    TransferError, UploadConfig, UploadCoordinator, UploadRequest, UploadState,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

enum Step {
    Report(u64, u64),
    WaitFor(Arc<Notify>),
    Signal(Arc<Notify>),
    Fail(TransferError),
}

/// Backend that plays one script per upload call, in call order. Calls
/// beyond the scripts succeed immediately.
#[derive(Default)]
struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<UploadRequest>>,
}

impl ScriptedBackend {
    fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageBackend for ScriptedBackend {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressReporter,
    ) -> Result<(), TransferError> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        for step in script {
            match step {
                Step::Report(sent, total) => progress.report(sent, sent, total),
                Step::WaitFor(gate) => gate.notified().await,
                Step::Signal(done) => done.notify_one(),
                Step::Fail(error) => return Err(error),
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn test_config() -> UploadConfig {
    UploadConfig {
        key_prefix: "Test".to_string(),
        ..UploadConfig::default()
    }
}

fn recording(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, vec![7u8; 128]).unwrap();
    path
}

async fn wait_for_view<F>(coordinator: &UploadCoordinator, condition: F) -> ProgressView
where
    F: Fn(&ProgressView) -> bool,
{
    let mut updates = coordinator.subscribe();
    let matched = tokio::time::timeout(Duration::from_secs(1), updates.wait_for(|view| condition(view)))
        .await
        .expect("progress view never reached the expected state")
        .expect("coordinator dropped");
    matched.clone()
}

#[tokio::test]
async fn test_progress_reflects_reported_bytes() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::new(vec![vec![
        Step::Report(50, 100),
        Step::WaitFor(gate.clone()),
    ]]);
    let uploads = UploadCoordinator::new(backend.clone(), test_config()).unwrap();

    uploads.submit(Artifact::new("a.wav", "/nonexistent/a.wav"));
    // Nothing has run yet on the current-thread runtime
    assert_eq!(uploads.progress().get("a.wav"), Some(0.0));

    let view = wait_for_view(&uploads, |view| view.get("a.wav") == Some(0.5)).await;
    assert_eq!(view.len(), 1);
    assert_eq!(view.to_string(), "Uploading: a.wav: 50.00%");
    assert_eq!(uploads.task("a.wav").unwrap().state, UploadState::InFlight(0.5));

    gate.notify_one();
    wait_for_view(&uploads, |view| view.is_empty()).await;
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_success_removes_entry_and_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = recording(&dir, "take.wav");
    let backend = ScriptedBackend::new(vec![vec![Step::Report(128, 128)]]);
    let uploads = UploadCoordinator::new(backend.clone(), test_config()).unwrap();

    let artifact = Artifact::for_recording(&path, "Test").unwrap();
    assert_eq!(artifact.key, "Test/take.wav");
    uploads.submit(artifact);
    assert!(uploads.has_active());

    uploads.settled().await;
    assert!(!uploads.progress().contains("Test/take.wav"));
    assert_eq!(uploads.tracked_count(), 0);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_missing_local_file_still_counts_as_success() {
    let backend = ScriptedBackend::new(vec![]);
    let uploads = UploadCoordinator::new(backend.clone(), test_config()).unwrap();

    uploads.submit(Artifact::new("gone.wav", "/nonexistent/gone.wav"));
    uploads.settled().await;

    assert_eq!(backend.calls(), 1);
    assert!(uploads.task("gone.wav").is_none());
    assert!(uploads.progress().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_generic_failure_retries_once_after_delay() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::new(vec![
        vec![Step::Fail(TransferError::other("connection reset"))],
        vec![Step::WaitFor(gate.clone())],
    ]);
    let uploads = UploadCoordinator::new(backend.clone(), test_config()).unwrap();

    uploads.submit(Artifact::new("a.wav", "/nonexistent/a.wav"));
    wait_for_view(&uploads, |view| view.get("a.wav") == Some(-1.0)).await;
    assert_eq!(uploads.task("a.wav").unwrap().state, UploadState::RetryPending);
    assert!(uploads.has_active());

    tokio::time::sleep(Duration::from_millis(4900)).await;
    assert_eq!(backend.calls(), 1);
    assert_eq!(uploads.progress().get("a.wav"), Some(-1.0));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.calls(), 2);
    assert_eq!(uploads.progress().get("a.wav"), Some(0.0));
    let task = uploads.task("a.wav").unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.state, UploadState::InFlight(0.0));

    // Exactly one retry was scheduled
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.calls(), 2);

    gate.notify_one();
    uploads.settled().await;
    assert!(uploads.progress().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_and_paused_are_not_retried() {
    let backend = ScriptedBackend::new(vec![
        vec![Step::Fail(TransferError::cancelled("user cancelled"))],
        vec![Step::Fail(TransferError::paused("suspended"))],
    ]);
    let uploads = UploadCoordinator::new(backend.clone(), test_config()).unwrap();

    uploads.submit(Artifact::new("a.wav", "/nonexistent/a.wav"));
    wait_for_view(&uploads, |view| view.get("a.wav") == Some(-1.0)).await;
    uploads.submit(Artifact::new("b.wav", "/nonexistent/b.wav"));
    wait_for_view(&uploads, |view| view.get("b.wav") == Some(-1.0)).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.calls(), 2);
    assert_eq!(
        uploads.task("a.wav").unwrap().state,
        UploadState::Halted(FailureKind::Cancelled)
    );
    assert_eq!(
        uploads.task("b.wav").unwrap().state,
        UploadState::Halted(FailureKind::Paused)
    );

    // Halted entries stay visible but nothing is left to wait for
    assert_eq!(uploads.progress().len(), 2);
    assert!(!uploads.has_active());
}

#[tokio::test]
async fn test_resubmitting_a_key_replaces_the_running_upload() {
    let first = Arc::new(Notify::new());
    let second = Arc::new(Notify::new());
    let backend = ScriptedBackend::new(vec![
        vec![Step::WaitFor(first.clone()), Step::Report(90, 100)],
        vec![Step::Report(10, 100), Step::WaitFor(second.clone())],
    ]);
    let uploads = UploadCoordinator::new(backend.clone(), test_config()).unwrap();

    uploads.submit(Artifact::new("a.wav", "/nonexistent/a.wav"));
    tokio::task::yield_now().await;
    assert_eq!(backend.calls(), 1);

    uploads.submit(Artifact::new("a.wav", "/nonexistent/a.wav"));
    assert_eq!(uploads.tracked_count(), 1);
    wait_for_view(&uploads, |view| view.get("a.wav") == Some(0.1)).await;

    // The superseded transfer was aborted and cannot report anymore
    first.notify_one();
    tokio::task::yield_now().await;
    assert_eq!(uploads.progress().get("a.wav"), Some(0.1));

    second.notify_one();
    uploads.settled().await;
    assert_eq!(backend.calls(), 2);
    assert!(uploads.progress().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resubmitting_cancels_a_pending_retry() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::new(vec![
        vec![Step::Fail(TransferError::other("timeout"))],
        vec![Step::WaitFor(gate.clone())],
    ]);
    let uploads = UploadCoordinator::new(backend.clone(), test_config()).unwrap();

    uploads.submit(Artifact::new("a.wav", "/nonexistent/a.wav"));
    wait_for_view(&uploads, |view| view.get("a.wav") == Some(-1.0)).await;

    uploads.submit(Artifact::new("a.wav", "/nonexistent/a.wav"));
    tokio::task::yield_now().await;
    assert_eq!(backend.calls(), 2);
    assert_eq!(uploads.task("a.wav").unwrap().retry_count, 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.calls(), 2);

    gate.notify_one();
    uploads.settled().await;
}

#[tokio::test(start_paused = true)]
async fn test_bounded_retries_give_up() {
    let backend = ScriptedBackend::new(vec![
        vec![Step::Fail(TransferError::other("denied"))],
        vec![Step::Fail(TransferError::other("denied"))],
    ]);
    let config = UploadConfig {
        max_retries: Some(1),
        retry_delay: Duration::from_secs(1),
        ..test_config()
    };
    let uploads = UploadCoordinator::new(backend.clone(), config).unwrap();

    uploads.submit(Artifact::new("a.wav", "/nonexistent/a.wav"));
    uploads.settled().await;

    let task = uploads.task("a.wav").unwrap();
    assert_eq!(task.state, UploadState::Abandoned);
    assert_eq!(task.retry_count, 1);
    assert_eq!(backend.calls(), 2);
    assert_eq!(uploads.progress().get("a.wav"), Some(-1.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_into_directory_storage() {
    let source = tempfile::tempdir().unwrap();
    let bucket = tempfile::tempdir().unwrap();
    let storage = Arc::new(DirectoryStorage::new(bucket.path()).with_chunk_size(16));
    let uploads = UploadCoordinator::new(storage, test_config()).unwrap();

    let paths: Vec<PathBuf> = (0..8)
        .map(|i| recording(&source, &format!("take-{}.wav", i)))
        .collect();

    let submissions = paths.iter().cloned().map(|path| {
        let uploads = uploads.clone();
        tokio::spawn(async move {
            let artifact = Artifact::for_recording(&path, "Test").unwrap();
            uploads.submit(artifact);
        })
    });
    for joined in futures::future::join_all(submissions).await {
        joined.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), uploads.settled())
        .await
        .expect("uploads did not settle");

    assert!(uploads.progress().is_empty());
    for (i, path) in paths.iter().enumerate() {
        assert!(!path.exists());
        let stored = bucket.path().join("Test").join(format!("take-{}.wav", i));
        assert_eq!(std::fs::read(stored).unwrap(), vec![7u8; 128]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_source_is_not_retried() {
    let bucket = tempfile::tempdir().unwrap();
    let storage = Arc::new(DirectoryStorage::new(bucket.path()));
    let uploads = UploadCoordinator::new(storage, test_config()).unwrap();

    uploads.submit(Artifact::new("gone.wav", "/nonexistent/gone.wav"));
    tokio::time::timeout(Duration::from_secs(600), uploads.settled())
        .await
        .expect("a missing source kept being retried");

    tokio::time::sleep(Duration::from_secs(600)).await;
    let task = uploads.task("gone.wav").unwrap();
    assert_eq!(task.state, UploadState::Halted(FailureKind::Unrecoverable));
    assert_eq!(task.retry_count, 0);
    assert_eq!(uploads.progress().get("gone.wav"), Some(-1.0));
    assert!(!uploads.has_active());
}

#[tokio::test]
async fn test_resubmit_while_deleting_confirmed_upload_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = recording(&dir, "take.wav");
    let stored = Arc::new(Notify::new());
    let backend = ScriptedBackend::new(vec![vec![
        Step::Report(128, 128),
        Step::Signal(stored.clone()),
    ]]);
    let uploads = UploadCoordinator::new(backend.clone(), test_config()).unwrap();

    let artifact = Artifact::for_recording(&path, "Test").unwrap();
    uploads.submit(artifact.clone());

    // The transfer has returned and its local file is being removed
    stored.notified().await;
    uploads.submit(artifact);
    assert_eq!(uploads.tracked_count(), 1);

    uploads.settled().await;
    assert_eq!(backend.calls(), 1);
    assert!(uploads.progress().is_empty());
    assert!(!path.exists());
}
