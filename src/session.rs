use crate::audio::{RecordingSink, SampleCapture, SensorSource, WavRecorder};
use crate::config::{Calibration, RecordingConfig};
use crate::detector::{ActivityDetector, DetectorDelegate, Mode};
use crate::error::{RecorderError, Result};
use crate::upload::{Artifact, UploadCoordinator};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// What the countdown line shows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionStatus {
    pub mode: Mode,
    pub seconds_left: f64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            mode: Mode::Inactive,
            seconds_left: 0.0,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Mode::Inactive => write!(f, "{:.2} seconds of audio required to start", self.seconds_left),
            Mode::Active => write!(f, "{:.2} seconds of recording left", self.seconds_left),
        }
    }
}

/// Detector delegate that records while activity lasts and hands each
/// finished recording to the upload coordinator.
pub struct RecordingSession {
    sensor: Arc<dyn SensorSource>,
    recorder: Arc<dyn RecordingSink>,
    uploads: UploadCoordinator,
    key_prefix: String,
    runtime: Handle,
    status: watch::Sender<SessionStatus>,
}

impl RecordingSession {
    pub fn new(
        sensor: Arc<dyn SensorSource>,
        recorder: Arc<dyn RecordingSink>,
        uploads: UploadCoordinator,
    ) -> Result<Self> {
        let key_prefix = uploads.config().key_prefix.clone();
        let (status, _) = watch::channel(SessionStatus::default());

        Ok(Self {
            sensor,
            recorder,
            uploads,
            key_prefix,
            runtime: Handle::try_current()?,
            status,
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn uploads(&self) -> &UploadCoordinator {
        &self.uploads
    }

    /// Finish a recording still open at shutdown and queue it for upload.
    pub fn flush(&self) -> Result<()> {
        if !self.recorder.is_recording() {
            return Ok(());
        }
        finish_and_submit(self.recorder.as_ref(), &self.uploads, &self.key_prefix)
    }
}

fn finish_and_submit(
    recorder: &dyn RecordingSink,
    uploads: &UploadCoordinator,
    key_prefix: &str,
) -> Result<()> {
    let path = recorder.finish()?;
    info!(path = %path.display(), "capture output finished recording");
    let artifact = Artifact::for_recording(path, key_prefix)?;
    uploads.submit(artifact);
    Ok(())
}

impl DetectorDelegate for RecordingSession {
    fn current_sensor_value(&self) -> f64 {
        self.sensor.current_value()
    }

    fn activity_detected(&self) {
        self.status.send_modify(|status| status.mode = Mode::Active);
        match self.recorder.start() {
            Ok(path) => debug!(path = %path.display(), "activity detected"),
            Err(e) => error!(error = %e, "could not start recording"),
        }
    }

    fn inactivity_detected(&self) {
        self.status.send_modify(|status| status.mode = Mode::Inactive);

        // Writing the file is blocking I/O; keep it off the polling task.
        let recorder = Arc::clone(&self.recorder);
        let uploads = self.uploads.clone();
        let key_prefix = self.key_prefix.clone();
        self.runtime.spawn_blocking(move || {
            match finish_and_submit(recorder.as_ref(), &uploads, &key_prefix) {
                Ok(()) => {}
                Err(RecorderError::NotRecording) => debug!("inactivity without an open recording"),
                Err(e) => error!(error = %e, "capture output finished recording with error"),
            }
        });
    }

    fn remaining_time_changed(&self, seconds_left: f64) {
        self.status.send_modify(|status| status.seconds_left = seconds_left);
    }
}

/// A running session: input open, recorder ready, detector polling.
pub struct Listener {
    session: Arc<RecordingSession>,
    detector: ActivityDetector,
}

impl Listener {
    /// Bring a session up. Failing to open the input, to prepare the output
    /// directory, or to find a runtime is returned before anything polls.
    pub fn start<I, F>(
        open_input: F,
        uploads: UploadCoordinator,
        recording: &RecordingConfig,
        poll_interval: Duration,
        calibration: &Calibration,
    ) -> Result<Self>
    where
        I: SensorSource + SampleCapture + 'static,
        F: FnOnce() -> Result<I>,
    {
        let input = Arc::new(open_input()?);
        let recorder = Arc::new(WavRecorder::new(input.clone(), recording.output_dir.clone())?);
        let session = Arc::new(RecordingSession::new(input, recorder, uploads)?);

        let mut detector = ActivityDetector::new(session.clone(), poll_interval)?;
        detector.apply_calibration(calibration);
        detector.start_detecting()?;

        info!(output_dir = %recording.output_dir.display(), "listening");
        Ok(Self { session, detector })
    }

    pub fn session(&self) -> &Arc<RecordingSession> {
        &self.session
    }

    pub fn detector(&self) -> &ActivityDetector {
        &self.detector
    }

    /// Stop polling and hand any open recording to the uploader.
    pub fn stop(&mut self) -> Result<()> {
        self.detector.stop_detecting();
        self.session.flush()
    }
}
