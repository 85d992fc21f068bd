//! Sound-activated recorder core.
//!
//! [`ActivityDetector`] turns a polled sensor level into debounced
//! start/stop edges; [`UploadCoordinator`] ships finished recordings to
//! storage, retrying failed transfers and publishing per-file progress.

pub mod audio;
pub mod config;
pub mod detector;
pub mod error;
pub mod logging;
pub mod session;
pub mod storage;
pub mod upload;

pub use audio::{AudioInput, RecordingSink, SampleCapture, SensorSource, WavRecorder};
pub use config::{Calibration, DetectorConfig, RecordingConfig, StorageClass, UploadConfig};
pub use detector::{ActivityDetector, DetectorDelegate, DetectorState, Mode, Signal};
pub use error::{RecorderError, Result};
pub use session::{Listener, RecordingSession, SessionStatus};
pub use storage::{
    DirectoryStorage, FailureKind, ProgressReporter, StorageBackend, TransferError,
    TransferProgress, UploadRequest,
};
pub use upload::{Artifact, ProgressView, TaskSnapshot, UploadCoordinator, UploadState};
