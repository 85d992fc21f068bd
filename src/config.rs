use crate::error::{RecorderError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

// Detector defaults
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 600;
pub const DEFAULT_THRESHOLD: f64 = -10.0;
pub const DEFAULT_DWELL_TO_START_MS: u64 = 600;
pub const DEFAULT_DWELL_TO_STOP_MS: u64 = 10_000;

// Audio level meter
pub const SILENCE_FLOOR_DB: f64 = -160.0;
pub const NO_DATA_READING: f64 = 0.0;

// Upload pipeline
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
pub const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;
pub const FAILED_PROGRESS_SENTINEL: f64 = -1.0;

// Calibration environment keys
pub const ENV_THRESHOLD: &str = "DR_THRESHOLD";
pub const ENV_MINIMUM_TRIGGER_TIME: &str = "DR_MINIMUM_TRIGGER_TIME";
pub const ENV_MINIMUM_RECORD_TIME: &str = "DR_MINIMUM_RECORD_TIME";
pub const ENV_BUCKET_DIR: &str = "DR_BUCKET_DIR";
pub const ENV_KEY_PREFIX: &str = "DR_KEY_PREFIX";

/// Tunables consulted on every poll. The poll interval itself is not part of
/// this struct: it is fixed when the detector is built.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    pub threshold: f64,
    pub dwell_to_start: Duration,
    pub dwell_to_stop: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            dwell_to_start: Duration::from_millis(DEFAULT_DWELL_TO_START_MS),
            dwell_to_stop: Duration::from_millis(DEFAULT_DWELL_TO_STOP_MS),
        }
    }
}

pub fn validate_poll_interval(poll_interval: Duration) -> Result<Duration> {
    if poll_interval.is_zero() {
        return Err(RecorderError::InvalidConfig(
            "poll interval must be greater than zero".to_string(),
        ));
    }
    Ok(poll_interval)
}

/// Externally supplied calibration values, in seconds.
///
/// A value of exactly `0.0` means "not set" and never overrides the current
/// configuration, so none of these can be configured to zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub threshold: f64,
    pub min_trigger_secs: f64,
    pub min_record_secs: f64,
}

impl Calibration {
    pub fn from_env() -> Self {
        Self {
            threshold: env_f64(ENV_THRESHOLD),
            min_trigger_secs: env_f64(ENV_MINIMUM_TRIGGER_TIME),
            min_record_secs: env_f64(ENV_MINIMUM_RECORD_TIME),
        }
    }

    pub fn from_cli_args(
        threshold: Option<f64>,
        min_trigger_secs: Option<f64>,
        min_record_secs: Option<f64>,
    ) -> Self {
        let mut calibration = Self::from_env();

        // CLI args override environment variables
        if let Some(value) = threshold {
            calibration.threshold = value;
        }

        if let Some(value) = min_trigger_secs {
            calibration.min_trigger_secs = value;
        }

        if let Some(value) = min_record_secs {
            calibration.min_record_secs = value;
        }

        calibration
    }

    /// Copy every set value onto `config`.
    pub fn apply(&self, config: &mut DetectorConfig) {
        if self.threshold != 0.0 {
            if self.threshold.is_finite() {
                config.threshold = self.threshold;
            } else {
                warn!(value = self.threshold, "ignoring non-finite threshold");
            }
        }

        if let Some(dwell) = dwell_from_secs("minimum trigger time", self.min_trigger_secs) {
            config.dwell_to_start = dwell;
        }

        if let Some(dwell) = dwell_from_secs("minimum record time", self.min_record_secs) {
            config.dwell_to_stop = dwell;
        }
    }
}

fn dwell_from_secs(name: &str, secs: f64) -> Option<Duration> {
    if secs == 0.0 {
        return None;
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(dwell) => Some(dwell),
        Err(_) => {
            warn!(value = secs, "ignoring invalid {}", name);
            None
        }
    }
}

// Unset or unparseable values read as 0, which calibration treats as "not set".
fn env_f64(key: &str) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0.0)
}

/// Storage tier hint handed to the transfer backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageClass {
    Standard,
    #[default]
    ReducedRedundancy,
}

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub bucket_dir: PathBuf,
    pub key_prefix: String,
    pub storage_class: StorageClass,
    pub retry_delay: Duration,
    /// `None` keeps retrying for as long as transfers keep failing.
    pub max_retries: Option<u32>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket_dir: PathBuf::from("./bucket"),
            key_prefix: "recordings".to_string(),
            storage_class: StorageClass::default(),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retries: None,
        }
    }
}

impl UploadConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_BUCKET_DIR) {
            if !dir.trim().is_empty() {
                config.bucket_dir = PathBuf::from(dir.trim());
            }
        }

        if let Ok(prefix) = std::env::var(ENV_KEY_PREFIX) {
            config.key_prefix = prefix.trim().trim_matches('/').to_string();
        }

        config
    }
}

#[derive(Clone, Debug)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./recordings"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_calibration_leaves_config_unchanged() {
        let mut config = DetectorConfig {
            threshold: -25.0,
            dwell_to_start: Duration::from_secs(2),
            dwell_to_stop: Duration::from_secs(30),
        };
        let before = config.clone();

        Calibration::default().apply(&mut config);

        assert_eq!(config, before);
    }

    #[test]
    fn test_nonzero_calibration_overrides() {
        let mut config = DetectorConfig::default();
        let calibration = Calibration {
            threshold: -30.5,
            min_trigger_secs: 1.5,
            min_record_secs: 0.0,
        };

        calibration.apply(&mut config);

        assert_eq!(config.threshold, -30.5);
        assert_eq!(config.dwell_to_start, Duration::from_millis(1500));
        assert_eq!(config.dwell_to_stop, Duration::from_millis(DEFAULT_DWELL_TO_STOP_MS));
    }

    #[test]
    fn test_invalid_dwell_is_ignored() {
        let mut config = DetectorConfig::default();
        let calibration = Calibration {
            threshold: f64::NAN,
            min_trigger_secs: -2.0,
            min_record_secs: f64::INFINITY,
        };

        calibration.apply(&mut config);

        assert_eq!(config, DetectorConfig::default());
    }

    #[test]
    fn test_poll_interval_must_be_positive() {
        assert!(validate_poll_interval(Duration::ZERO).is_err());
        assert!(validate_poll_interval(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.threshold, -10.0);
        assert_eq!(config.dwell_to_start, Duration::from_millis(600));
        assert_eq!(config.dwell_to_stop, Duration::from_secs(10));

        let upload = UploadConfig::default();
        assert_eq!(upload.retry_delay, Duration::from_secs(5));
        assert_eq!(upload.storage_class, StorageClass::ReducedRedundancy);
        assert!(upload.max_retries.is_none());
    }
}
