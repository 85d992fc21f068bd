use crate::config::{NO_DATA_READING, SILENCE_FLOOR_DB};
use crate::error::{RecorderError, Result};
use chrono::{DateTime, Local};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use hound::{WavSpec, WavWriter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Pull-based scalar sensor.
pub trait SensorSource: Send + Sync {
    fn current_value(&self) -> f64;
}

/// Something that buffers mono samples between `begin_capture` and
/// `end_capture`.
pub trait SampleCapture: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn begin_capture(&self) -> Result<()>;
    fn end_capture(&self) -> Result<Vec<f32>>;
}

/// Average power of a block in dBFS, never below the silence floor.
pub fn power_db(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return SILENCE_FLOOR_DB;
    }
    let mean_square = samples
        .iter()
        .map(|&s| (s as f64) * (s as f64))
        .sum::<f64>()
        / samples.len() as f64;
    if mean_square <= 0.0 || !mean_square.is_finite() {
        return SILENCE_FLOOR_DB;
    }
    (10.0 * mean_square.log10()).max(SILENCE_FLOOR_DB)
}

fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

#[derive(Default)]
struct CaptureState {
    // None until the first callback block arrives
    level_db: Option<f64>,
    recording: Option<Vec<f32>>,
}

fn lock_state(state: &Mutex<CaptureState>) -> MutexGuard<'_, CaptureState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Default input device, captured on a dedicated thread that owns the cpal
/// stream. Publishes the latest block's power level and buffers samples
/// while a capture is open.
pub struct AudioInput {
    state: Arc<Mutex<CaptureState>>,
    sample_rate: u32,
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl AudioInput {
    pub fn open() -> Result<Self> {
        let state = Arc::new(Mutex::new(CaptureState::default()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("audio-input".to_string())
            .spawn(move || match build_stream(thread_state) {
                Ok((stream, sample_rate)) => {
                    let _ = ready_tx.send(Ok(sample_rate));
                    // Keep the stream alive until asked to stop
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| RecorderError::AudioThreadDisconnected)??;

        info!(sample_rate, "audio input opened");

        Ok(Self {
            state,
            sample_rate,
            stop_tx,
            thread: Some(thread),
        })
    }

    /// Latest power level in dBFS, or the neutral reading before any audio
    /// has arrived.
    pub fn level_db(&self) -> f64 {
        lock_state(&self.state).level_db.unwrap_or(NO_DATA_READING)
    }
}

impl SensorSource for AudioInput {
    fn current_value(&self) -> f64 {
        self.level_db()
    }
}

impl SampleCapture for AudioInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn begin_capture(&self) -> Result<()> {
        let mut state = lock_state(&self.state);
        if state.recording.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }
        state.recording = Some(Vec::new());
        Ok(())
    }

    fn end_capture(&self) -> Result<Vec<f32>> {
        lock_state(&self.state)
            .recording
            .take()
            .ok_or(RecorderError::NotRecording)
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_stream(state: Arc<Mutex<CaptureState>>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(RecorderError::NoInputDevice)?;

    let config = device.default_input_config()?;
    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;

    let stream = device.build_input_stream(
        &config.into(),
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono = downmix(data, channels);
            let level = power_db(&mono);
            let mut state = lock_state(&state);
            state.level_db = Some(level);
            if let Some(buffer) = state.recording.as_mut() {
                buffer.extend_from_slice(&mono);
            }
        },
        move |err| {
            error!(error = %err, "audio stream error");
        },
        None,
    )?;

    stream.play()?;
    Ok((stream, sample_rate))
}

/// Where recordings go and what they are called.
pub trait RecordingSink: Send + Sync {
    fn start(&self) -> Result<PathBuf>;
    fn finish(&self) -> Result<PathBuf>;
    fn is_recording(&self) -> bool;
}

/// Name a recording after its start time.
pub fn recording_file_name(started: DateTime<Local>) -> String {
    format!("{}.wav", started.format("%Y-%m-%d %H:%M:%S"))
}

pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Writes captured audio to a mono float WAV file per recording.
pub struct WavRecorder {
    capture: Arc<dyn SampleCapture>,
    output_dir: PathBuf,
    current: Mutex<Option<PathBuf>>,
}

impl WavRecorder {
    /// Creates `output_dir` up front; starting a recording does no file I/O.
    pub fn new(capture: Arc<dyn SampleCapture>, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;

        Ok(Self {
            capture,
            output_dir,
            current: Mutex::new(None),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn current(&self) -> MutexGuard<'_, Option<PathBuf>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordingSink for WavRecorder {
    fn start(&self) -> Result<PathBuf> {
        let mut current = self.current();
        if current.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }

        let path = self.output_dir.join(recording_file_name(Local::now()));
        self.capture.begin_capture()?;

        info!(path = %path.display(), "recording started");
        *current = Some(path.clone());
        Ok(path)
    }

    fn finish(&self) -> Result<PathBuf> {
        let path = self.current().take().ok_or(RecorderError::NotRecording)?;
        let samples = self.capture.end_capture()?;
        write_wav(&path, &samples, self.capture.sample_rate())?;

        debug!(samples = samples.len(), path = %path.display(), "recording written");
        Ok(path)
    }

    fn is_recording(&self) -> bool {
        self.current().is_some()
    }
}
