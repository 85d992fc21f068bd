use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("No input device found")]
    NoInputDevice,

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio thread disconnected")]
    AudioThreadDisconnected,

    #[error("WAV file error: {0}")]
    WavFile(String),

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("Not currently recording")]
    NotRecording,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No async runtime available: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::BuildStreamError> for RecorderError {
    fn from(error: cpal::BuildStreamError) -> Self {
        RecorderError::AudioStream(error.to_string())
    }
}

impl From<cpal::PlayStreamError> for RecorderError {
    fn from(error: cpal::PlayStreamError) -> Self {
        RecorderError::AudioStream(error.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for RecorderError {
    fn from(error: cpal::DefaultStreamConfigError) -> Self {
        RecorderError::AudioStream(error.to_string())
    }
}

impl From<hound::Error> for RecorderError {
    fn from(error: hound::Error) -> Self {
        RecorderError::WavFile(error.to_string())
    }
}

impl From<tokio::runtime::TryCurrentError> for RecorderError {
    fn from(error: tokio::runtime::TryCurrentError) -> Self {
        RecorderError::Runtime(error.to_string())
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, RecorderError>;
