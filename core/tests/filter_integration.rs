//! End-to-end tests on synthetic scenarios
//!
//! A seeded constant-acceleration trajectory with a constant yaw bias is synthesized, written to
//! and read back from CSV, and replayed through a filter built from a [`FilterConfig`]. The error
//! bounds are regression checks observed across many seeds, not design goals.
use nalgebra::Vector3;
use tempfile::tempdir;

use pose_estimator::chi_square::RejectionThreshold;
use pose_estimator::config::FilterConfig;
use pose_estimator::filter::{MeasurementStream, PosYawBiasFilter, RejectionSettings};
use pose_estimator::kalman::CovarianceUpdate;
use pose_estimator::replay::{
    EstimateRecord, EventKind, ReplayOutcome, Scenario, ScenarioConfig, read_events, run_replay, synthesize,
    write_estimates, write_events,
};

fn tuned_config(scenario: &ScenarioConfig, gated: bool) -> FilterConfig {
    let mut initial_state = vec![0.0; 7];
    initial_state[3..6].copy_from_slice(&scenario.initial_velocity);
    let gate = if gated {
        RejectionThreshold::Confidence95
    } else {
        RejectionThreshold::None
    };
    FilterConfig {
        initial_state,
        process_noise: vec![1e-6, 1e-6, 1e-6, 1e-6, 1e-6, 1e-6, 1e-10],
        rejection: RejectionSettings {
            position: gate,
            velocity: gate,
            scan_match: RejectionThreshold::None,
            gps: RejectionThreshold::None,
        },
        ..FilterConfig::default()
    }
}

fn final_errors(filter: &PosYawBiasFilter, scenario: &Scenario, cfg: &ScenarioConfig) -> (f64, f64, f64) {
    let truth = scenario.truth.last().unwrap();
    let state = filter.state();
    (
        (state.position() - truth.position()).norm(),
        (state.velocity() - truth.velocity()).norm(),
        (state.yaw_bias() - cfg.yaw_bias).abs(),
    )
}

/// Largest position error over all rows, skipping the initial transient
fn worst_position_error(
    estimates: &[EstimateRecord],
    scenario: &Scenario,
    cfg: &ScenarioConfig,
) -> f64 {
    estimates
        .iter()
        .filter(|e| e.time >= 10.0)
        .map(|e| {
            let tick = (e.time * cfg.imu_rate_hz).round() as usize;
            let truth = &scenario.truth[tick];
            (Vector3::new(e.x, e.y, e.z) - truth.position()).norm()
        })
        .fold(0.0, f64::max)
}

#[test]
fn converges_on_clean_scenario() {
    for seed in [1, 2, 3] {
        let cfg = ScenarioConfig {
            seed,
            ..ScenarioConfig::default()
        };
        let scenario = synthesize(&cfg).unwrap();
        let mut filter = tuned_config(&cfg, true).build().unwrap();
        let estimates = run_replay(&mut filter, &scenario.events);
        assert_eq!(estimates.len(), scenario.events.len());
        assert!(estimates.iter().all(|e| e.outcome != ReplayOutcome::Failed));

        let (position_error, velocity_error, bias_error) = final_errors(&filter, &scenario, &cfg);
        assert!(position_error < 2.0, "seed {seed}: position error {position_error}");
        assert!(velocity_error < 0.3, "seed {seed}: velocity error {velocity_error}");
        assert!(bias_error < 0.05, "seed {seed}: yaw bias error {bias_error}");
        // started at zero with 0.05 rad² variance
        assert!(filter.state().yaw_bias_variance() < 0.01);
    }
}

#[test]
fn outliers_are_gated_out() {
    let cfg = ScenarioConfig {
        outlier_probability: 0.1,
        seed: 11,
        ..ScenarioConfig::default()
    };
    let scenario = synthesize(&cfg).unwrap();

    let mut gated = tuned_config(&cfg, true).build().unwrap();
    let gated_estimates = run_replay(&mut gated, &scenario.events);
    let stats = gated.statistics(MeasurementStream::Position);
    assert!(stats.rejected as usize >= scenario.outliers);
    let (position_error, _, bias_error) = final_errors(&gated, &scenario, &cfg);
    assert!(position_error < 2.0, "position error {position_error}");
    assert!(bias_error < 0.05, "yaw bias error {bias_error}");

    if scenario.outliers > 0 {
        let mut ungated = tuned_config(&cfg, false).build().unwrap();
        let ungated_estimates = run_replay(&mut ungated, &scenario.events);
        assert_eq!(ungated.statistics(MeasurementStream::Position).rejected, 0);
        // an accepted 50 m outlier drags the estimate far off right after the fix
        assert!(worst_position_error(&ungated_estimates, &scenario, &cfg) > 5.0);
        assert!(worst_position_error(&gated_estimates, &scenario, &cfg) < 5.0);
    }
}

#[test]
fn joseph_and_standard_updates_agree() {
    let cfg = ScenarioConfig {
        duration: 20.0,
        ..ScenarioConfig::default()
    };
    let scenario = synthesize(&cfg).unwrap();
    let standard = tuned_config(&cfg, false);
    let joseph = FilterConfig {
        covariance_update: CovarianceUpdate::Joseph,
        ..standard.clone()
    };
    let mut a = standard.build().unwrap();
    let mut b = joseph.build().unwrap();
    run_replay(&mut a, &scenario.events);
    run_replay(&mut b, &scenario.events);
    assert!((a.state().position() - b.state().position()).norm() < 1e-6);
    assert!((a.state().yaw_bias() - b.state().yaw_bias()).abs() < 1e-8);
    assert!((a.covariance() - b.covariance()).amax() < 1e-8);
}

#[test]
fn csv_replay_matches_in_memory_replay() {
    let cfg = ScenarioConfig {
        duration: 10.0,
        outlier_probability: 0.2,
        ..ScenarioConfig::default()
    };
    let scenario = synthesize(&cfg).unwrap();
    let dir = tempdir().unwrap();
    let events_path = dir.path().join("events.csv");
    let estimates_path = dir.path().join("estimates.csv");

    write_events(&scenario.events, &events_path).unwrap();
    let loaded = read_events(&events_path).unwrap();
    assert_eq!(loaded, scenario.events);

    let config = tuned_config(&cfg, true);
    let mut from_memory = config.build().unwrap();
    let mut from_disk = config.build().unwrap();
    let expected = run_replay(&mut from_memory, &scenario.events);
    let replayed = run_replay(&mut from_disk, &loaded);
    assert_eq!(expected, replayed);

    write_estimates(&replayed, &estimates_path).unwrap();
    let mut rdr = csv::Reader::from_path(&estimates_path).unwrap();
    let headers = rdr.headers().unwrap().clone();
    assert_eq!(&headers[0], "time");
    assert_eq!(&headers[2], "outcome");
    assert_eq!(rdr.records().count(), replayed.len());
}

#[test]
fn scan_match_rows_drive_their_own_stream() {
    let cfg = ScenarioConfig {
        duration: 5.0,
        velocity_noise_std: 0.0,
        ..ScenarioConfig::default()
    };
    let mut scenario = synthesize(&cfg).unwrap();
    for event in scenario.events.iter_mut() {
        if event.kind == EventKind::Position {
            event.kind = EventKind::ScanMatch;
        }
    }
    assert!(scenario.events.iter().all(|e| e.kind != EventKind::Velocity));

    let mut filter = tuned_config(&cfg, true).build().unwrap();
    run_replay(&mut filter, &scenario.events);
    let scan = filter.statistics(MeasurementStream::ScanMatch);
    assert_eq!(scan.accepted + scan.rejected, 5);
    assert_eq!(filter.statistics(MeasurementStream::Position).accepted, 0);
    let truth = scenario.truth.last().unwrap();
    assert!((filter.state().position() - truth.position()).norm() < 2.0);
    assert!(filter.state().velocity().iter().all(|v| v.is_finite()));
    assert_ne!(filter.state().velocity(), Vector3::zeros());
}
