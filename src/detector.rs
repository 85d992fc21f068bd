// Debounced threshold-crossing detector.
// A sensor is polled on a fixed interval; the detector flips between
// Inactive and Active once the signal has stayed on the far side of the
// threshold for the configured dwell time.

use crate::config::{validate_poll_interval, Calibration, DetectorConfig};
use crate::error::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    Inactive,
    Active,
}

/// Notification produced by a poll step, in delivery order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    RemainingTimeChanged(f64),
    ActivityDetected,
    InactivityDetected,
}

/// Collaborator interface for the detector.
///
/// Only the sensor read is required. Edge signals and the countdown update
/// are optional and default to doing nothing. All methods are called from
/// the polling task and must return promptly.
pub trait DetectorDelegate: Send + Sync {
    fn current_sensor_value(&self) -> f64;

    /// Rising edge.
    fn activity_detected(&self) {}

    /// Falling edge.
    fn inactivity_detected(&self) {}

    /// Seconds left until the next transition changed. The value may be
    /// slightly negative on the poll that triggers a transition.
    fn remaining_time_changed(&self, _seconds_left: f64) {}
}

/// Two-state hysteresis machine. Plain data, driven one reading at a time.
#[derive(Debug, Clone)]
pub struct DetectorState {
    mode: Mode,
    consecutive_readings: u32,
    poll_interval: Duration,
}

impl DetectorState {
    pub fn new(poll_interval: Duration) -> Result<Self> {
        Ok(Self {
            mode: Mode::Inactive,
            consecutive_readings: 0,
            poll_interval: validate_poll_interval(poll_interval)?,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn consecutive_readings(&self) -> u32 {
        self.consecutive_readings
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// How long the qualifying condition has held so far.
    pub fn elapsed(&self) -> Duration {
        self.poll_interval.saturating_mul(self.consecutive_readings)
    }

    pub fn seconds_until_transition(&self, config: &DetectorConfig) -> f64 {
        self.required_dwell(config).as_secs_f64() - self.elapsed().as_secs_f64()
    }

    fn required_dwell(&self, config: &DetectorConfig) -> Duration {
        match self.mode {
            Mode::Inactive => config.dwell_to_start,
            Mode::Active => config.dwell_to_stop,
        }
    }

    // Rising above the threshold starts, falling below it stops.
    fn qualifies(&self, value: f64, config: &DetectorConfig) -> bool {
        match self.mode {
            Mode::Inactive => value > config.threshold,
            Mode::Active => value < config.threshold,
        }
    }

    /// Feed one sensor reading and return the signals it produced.
    pub fn poll(&mut self, value: f64, config: &DetectorConfig) -> Vec<Signal> {
        let mut signals = Vec::new();
        let previous = self.consecutive_readings;

        if self.qualifies(value, config) {
            self.consecutive_readings = self.consecutive_readings.saturating_add(1);
        } else {
            self.consecutive_readings = 0;
        }

        trace!(
            value,
            threshold = config.threshold,
            mode = ?self.mode,
            readings = self.consecutive_readings,
            "sensor poll"
        );

        if previous != self.consecutive_readings {
            signals.push(Signal::RemainingTimeChanged(
                self.seconds_until_transition(config),
            ));
        }

        // Strict comparison: sitting exactly on the dwell boundary is not enough.
        if self.elapsed() > self.required_dwell(config) {
            let edge = match self.mode {
                Mode::Inactive => {
                    self.mode = Mode::Active;
                    Signal::ActivityDetected
                }
                Mode::Active => {
                    self.mode = Mode::Inactive;
                    Signal::InactivityDetected
                }
            };
            debug!(mode = ?self.mode, "detector transition");
            signals.push(edge);
            self.consecutive_readings = 0;
            signals.push(Signal::RemainingTimeChanged(
                self.seconds_until_transition(config),
            ));
        }

        signals
    }
}

struct Shared {
    state: DetectorState,
    config: DetectorConfig,
}

/// Polls a [`DetectorDelegate`] on a recurring Tokio timer and forwards the
/// resulting signals to it.
pub struct ActivityDetector {
    shared: Arc<Mutex<Shared>>,
    delegate: Arc<dyn DetectorDelegate>,
    timer: Option<JoinHandle<()>>,
}

impl ActivityDetector {
    pub fn new(delegate: Arc<dyn DetectorDelegate>, poll_interval: Duration) -> Result<Self> {
        Self::with_config(delegate, poll_interval, DetectorConfig::default())
    }

    pub fn with_config(
        delegate: Arc<dyn DetectorDelegate>,
        poll_interval: Duration,
        config: DetectorConfig,
    ) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                state: DetectorState::new(poll_interval)?,
                config,
            })),
            delegate,
            timer: None,
        })
    }

    /// Begin polling. Any polling already running is stopped first, so at
    /// most one timer is ever live. Must be called inside a Tokio runtime.
    pub fn start_detecting(&mut self) -> Result<()> {
        self.stop_detecting();

        let runtime = tokio::runtime::Handle::try_current()?;
        let poll_interval = self.poll_interval();
        let shared = Arc::clone(&self.shared);
        let delegate = Arc::clone(&self.delegate);

        self.timer = Some(runtime.spawn(async move {
            let start = tokio::time::Instant::now() + poll_interval;
            let mut ticker = tokio::time::interval_at(start, poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_poll(&shared, delegate.as_ref());
            }
        }));

        info!(interval_ms = poll_interval.as_millis() as u64, "activity detection started");
        Ok(())
    }

    /// Halt polling. A no-op when not running.
    pub fn stop_detecting(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            info!("activity detection stopped");
        }
    }

    pub fn is_detecting(&self) -> bool {
        self.timer.as_ref().is_some_and(|timer| !timer.is_finished())
    }

    /// Run a single poll step right now, outside the timer.
    pub fn poll_now(&self) {
        run_poll(&self.shared, self.delegate.as_ref());
    }

    pub fn mode(&self) -> Mode {
        lock(&self.shared).state.mode()
    }

    pub fn consecutive_readings(&self) -> u32 {
        lock(&self.shared).state.consecutive_readings()
    }

    pub fn seconds_until_transition(&self) -> f64 {
        let shared = lock(&self.shared);
        shared.state.seconds_until_transition(&shared.config)
    }

    pub fn poll_interval(&self) -> Duration {
        lock(&self.shared).state.poll_interval()
    }

    pub fn configuration(&self) -> DetectorConfig {
        lock(&self.shared).config.clone()
    }

    /// Replace the tunables. Takes effect on the next poll; polling itself
    /// is not interrupted.
    pub fn update_configuration(&self, config: DetectorConfig) {
        lock(&self.shared).config = config;
    }

    pub fn apply_calibration(&self, calibration: &Calibration) {
        let mut shared = lock(&self.shared);
        calibration.apply(&mut shared.config);
        debug!(config = ?shared.config, "calibration applied");
    }
}

impl Drop for ActivityDetector {
    fn drop(&mut self) {
        self.stop_detecting();
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// The delegate is only called with the lock released, so it may read the
// detector back.
fn run_poll(shared: &Mutex<Shared>, delegate: &dyn DetectorDelegate) {
    let value = delegate.current_sensor_value();

    let signals = {
        let mut guard = lock(shared);
        let Shared { state, config } = &mut *guard;
        state.poll(value, config)
    };

    for signal in signals {
        match signal {
            Signal::RemainingTimeChanged(seconds_left) => delegate.remaining_time_changed(seconds_left),
            Signal::ActivityDetected => delegate.activity_detected(),
            Signal::InactivityDetected => delegate.inactivity_detected(),
        }
    }
}
