use demo_recorder::{
    Calibration, DetectorConfig, DetectorState, Mode, Signal, TransferProgress,
};
use proptest::prelude::*;
use std::time::Duration;

fn config(threshold: f64, start_ms: u64, stop_ms: u64) -> DetectorConfig {
    DetectorConfig {
        threshold,
        dwell_to_start: Duration::from_millis(start_ms),
        dwell_to_stop: Duration::from_millis(stop_ms),
    }
}

proptest! {
    #[test]
    fn test_counter_tracks_current_qualifying_run(
        readings in prop::collection::vec(-60.0f64..20.0, 0..300),
        interval_ms in 1u64..1000,
        start_ms in 0u64..5000,
        stop_ms in 0u64..5000,
    ) {
        let config = config(-10.0, start_ms, stop_ms);
        let mut state = DetectorState::new(Duration::from_millis(interval_ms)).unwrap();
        let mut run: u32 = 0;

        for value in readings {
            let mode_before = state.mode();
            let qualifies = match mode_before {
                Mode::Inactive => value > config.threshold,
                Mode::Active => value < config.threshold,
            };
            run = if qualifies { run + 1 } else { 0 };

            let signals = state.poll(value, &config);
            if state.mode() != mode_before {
                run = 0;
            }

            // Property: the counter only ever covers the current run
            prop_assert_eq!(state.consecutive_readings(), run);

            // Property: at most one edge per poll, and only on a mode change
            let edges = signals
                .iter()
                .filter(|s| !matches!(s, Signal::RemainingTimeChanged(_)))
                .count();
            prop_assert_eq!(edges, usize::from(state.mode() != mode_before));

            // Property: a qualifying run is never longer than the dwell it needs
            let dwell = match state.mode() {
                Mode::Inactive => config.dwell_to_start,
                Mode::Active => config.dwell_to_stop,
            };
            prop_assert!(state.elapsed() <= dwell);
        }
    }

    #[test]
    fn test_alternating_readings_never_transition(
        pairs in 1usize..200,
        interval_ms in 1u64..1000,
        dwell_factor in 1u64..10,
        start_loud in any::<bool>(),
    ) {
        // Any dwell of at least one interval needs two qualifying polls in a row
        let config = config(-10.0, interval_ms * dwell_factor, interval_ms * dwell_factor);
        let mut state = DetectorState::new(Duration::from_millis(interval_ms)).unwrap();

        for i in 0..pairs * 2 {
            let loud = (i % 2 == 0) == start_loud;
            let value = if loud { 0.0 } else { -30.0 };
            let signals = state.poll(value, &config);

            prop_assert!(signals.iter().all(|s| matches!(s, Signal::RemainingTimeChanged(_))));
            prop_assert_eq!(state.mode(), Mode::Inactive);
            prop_assert!(state.consecutive_readings() <= 1);
        }
    }

    #[test]
    fn test_zero_calibration_changes_nothing(
        threshold in -100.0f64..0.0,
        start_ms in 0u64..60_000,
        stop_ms in 0u64..60_000,
    ) {
        let original = config(threshold, start_ms, stop_ms);
        let mut calibrated = original.clone();
        Calibration::default().apply(&mut calibrated);
        prop_assert_eq!(calibrated, original);
    }

    #[test]
    fn test_transfer_fraction_in_unit_range(
        sent in any::<u64>(),
        expected in any::<u64>(),
    ) {
        let progress = TransferProgress {
            bytes_sent: 0,
            total_bytes_sent: sent,
            total_bytes_expected: expected,
        };
        let fraction = progress.fraction();
        prop_assert!((0.0..=1.0).contains(&fraction));
    }
}
