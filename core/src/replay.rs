//! Event replay and synthetic scenarios
//!
//! Recorded (or synthesized) sensor data is stored as a flat CSV event log, one row per sample:
//!
//! ```text
//! time,kind,x,y,z,sx,sy,sz
//! 0.00,imu,0.01,-0.02,9.81,0,0,0
//! 0.01,imu,0.02,-0.01,9.80,0,0,0
//! 1.00,position,0.52,0.11,0.00,0.5,0.5,0.5
//! ```
//!
//! `imu` rows carry the navigation-frame acceleration and drive [`PosYawBiasFilter::predict`]
//! with the elapsed time since the previous `imu` row. Every other kind drives the matching
//! correction with `R = diag(sx², sy², sz²)`. [`run_replay`] pushes a log through a filter and
//! returns one [`EstimateRecord`] per row.
//!
//! [`synthesize`] produces such a log from a seeded constant-acceleration scenario with a
//! constant yaw bias, which is what the integration tests and the `simulate` command use.

use std::fmt::{self, Display};
use std::path::Path;

use log::{error, info};
use nalgebra::{Matrix3, Vector3};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::filter::{CorrectionOutcome, MeasurementStream, PosYawBiasFilter};
use crate::linearize::yaw_rotation;

/// Kind of row in an event log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Imu,
    Position,
    Velocity,
    ScanMatch,
    Gps,
}

impl EventKind {
    /// Measurement stream fed by this kind, `None` for IMU rows
    pub fn stream(&self) -> Option<MeasurementStream> {
        match self {
            EventKind::Imu => None,
            EventKind::Position => Some(MeasurementStream::Position),
            EventKind::Velocity => Some(MeasurementStream::Velocity),
            EventKind::ScanMatch => Some(MeasurementStream::ScanMatch),
            EventKind::Gps => Some(MeasurementStream::Gps),
        }
    }
}

/// One row of an event log
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Seconds
    pub time: f64,
    pub kind: EventKind,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Per-axis standard deviation, unused for IMU rows
    #[serde(default)]
    pub sx: f64,
    #[serde(default)]
    pub sy: f64,
    #[serde(default)]
    pub sz: f64,
}

impl EventRecord {
    pub fn imu(time: f64, acceleration: &Vector3<f64>) -> Self {
        EventRecord {
            time,
            kind: EventKind::Imu,
            x: acceleration[0],
            y: acceleration[1],
            z: acceleration[2],
            sx: 0.0,
            sy: 0.0,
            sz: 0.0,
        }
    }

    pub fn fix(time: f64, kind: EventKind, value: &Vector3<f64>, std: &Vector3<f64>) -> Self {
        EventRecord {
            time,
            kind,
            x: value[0],
            y: value[1],
            z: value[2],
            sx: std[0],
            sy: std[1],
            sz: std[2],
        }
    }

    pub fn value(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// Measurement noise `diag(sx², sy², sz²)`
    pub fn noise(&self) -> Matrix3<f64> {
        Matrix3::from_diagonal(&Vector3::new(
            self.sx * self.sx,
            self.sy * self.sy,
            self.sz * self.sz,
        ))
    }
}

/// What happened to a replayed row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutcome {
    /// First IMU row, only sets the time reference
    Start,
    Predicted,
    Accepted,
    Rejected,
    /// The filter returned an error; the state is unchanged
    Failed,
}

impl Display for ReplayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplayOutcome::Start => "start",
            ReplayOutcome::Predicted => "predicted",
            ReplayOutcome::Accepted => "accepted",
            ReplayOutcome::Rejected => "rejected",
            ReplayOutcome::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Filter estimate after a replayed row
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub time: f64,
    pub kind: EventKind,
    pub outcome: ReplayOutcome,
    /// Squared Mahalanobis distance of gated corrections
    pub statistic: Option<f64>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub yaw_bias: f64,
    pub covariance_trace: f64,
}

impl EstimateRecord {
    fn capture(
        event: &EventRecord,
        outcome: ReplayOutcome,
        statistic: Option<f64>,
        filter: &PosYawBiasFilter,
    ) -> Self {
        let state = filter.state();
        let p = state.position();
        let v = state.velocity();
        EstimateRecord {
            time: event.time,
            kind: event.kind,
            outcome,
            statistic,
            x: p[0],
            y: p[1],
            z: p[2],
            vx: v[0],
            vy: v[1],
            vz: v[2],
            yaw_bias: state.yaw_bias(),
            covariance_trace: state.covariance().trace(),
        }
    }
}

/// Read an event log from CSV.
pub fn read_events<P: AsRef<Path>>(path: P) -> Result<Vec<EventRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: EventRecord = result?;
        records.push(record);
    }
    Ok(records)
}

/// Write an event log to CSV.
pub fn write_events<P: AsRef<Path>>(records: &[EventRecord], path: P) -> Result<()> {
    write_csv(records, path)
}

/// Write replay estimates to CSV.
pub fn write_estimates<P: AsRef<Path>>(records: &[EstimateRecord], path: P) -> Result<()> {
    write_csv(records, path)
}

/// Write synthetic ground truth to CSV.
pub fn write_truth<P: AsRef<Path>>(records: &[TruthRecord], path: P) -> Result<()> {
    write_csv(records, path)
}

fn write_csv<T: Serialize, P: AsRef<Path>>(records: &[T], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Push an event log through an initialized filter, in order.
///
/// Per-row filter errors are logged and reported as [`ReplayOutcome::Failed`] without stopping
/// the replay. A failed IMU row does not advance the time reference.
pub fn run_replay(filter: &mut PosYawBiasFilter, events: &[EventRecord]) -> Vec<EstimateRecord> {
    let mut estimates = Vec::with_capacity(events.len());
    let mut last_imu_time: Option<f64> = None;

    for event in events {
        let (outcome, statistic) = match (event.kind.stream(), last_imu_time) {
            (None, None) => {
                last_imu_time = Some(event.time);
                (ReplayOutcome::Start, None)
            }
            (None, Some(previous)) => {
                match filter.predict(&event.value(), event.time - previous) {
                    Ok(()) => {
                        last_imu_time = Some(event.time);
                        (ReplayOutcome::Predicted, None)
                    }
                    Err(e) => {
                        error!("t = {:.3}s: prediction failed: {}", event.time, e);
                        (ReplayOutcome::Failed, None)
                    }
                }
            }
            (Some(stream), _) => {
                match filter.correction(stream, &event.value(), &event.noise()) {
                    Ok(CorrectionOutcome::Accepted { statistic }) => {
                        (ReplayOutcome::Accepted, statistic)
                    }
                    Ok(CorrectionOutcome::Rejected { statistic, .. }) => {
                        (ReplayOutcome::Rejected, Some(statistic))
                    }
                    Err(e) => {
                        error!("t = {:.3}s: {} correction failed: {}", event.time, stream, e);
                        (ReplayOutcome::Failed, None)
                    }
                }
            }
        };
        estimates.push(EstimateRecord::capture(event, outcome, statistic, filter));
    }

    for stream in MeasurementStream::ALL {
        let stats = filter.statistics(stream);
        if stats.accepted + stats.rejected > 0 {
            info!(
                "{}: {} accepted, {} rejected",
                stream, stats.accepted, stats.rejected
            );
        }
    }
    estimates
}

fn default_seed() -> u64 {
    42
}

/// Constant-acceleration scenario with a constant yaw bias.
///
/// The true motion happens in the bias-corrected frame. IMU rows report the acceleration in the
/// frame without bias correction, i.e. rotated by `-yaw_bias`, plus white noise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Seconds
    pub duration: f64,
    pub imu_rate_hz: f64,
    pub fix_rate_hz: f64,
    pub initial_velocity: [f64; 3],
    /// True acceleration in the bias-corrected frame (m/s²)
    pub acceleration: [f64; 3],
    /// Radians
    pub yaw_bias: f64,
    pub imu_noise_std: f64,
    pub position_noise_std: f64,
    /// Velocity fixes are skipped when zero
    pub velocity_noise_std: f64,
    /// Chance that a position fix is replaced by an outlier
    pub outlier_probability: f64,
    /// Offset added to every axis of an outlier (m)
    pub outlier_magnitude: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            duration: 60.0,
            imu_rate_hz: 100.0,
            fix_rate_hz: 1.0,
            initial_velocity: [1.0, 0.0, 0.0],
            acceleration: [0.2, 0.1, 0.0],
            yaw_bias: 0.1,
            imu_noise_std: 0.05,
            position_noise_std: 0.5,
            velocity_noise_std: 0.1,
            outlier_probability: 0.0,
            outlier_magnitude: 50.0,
            seed: default_seed(),
        }
    }
}

/// True state at one IMU tick
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TruthRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

impl TruthRecord {
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.vx, self.vy, self.vz)
    }
}

/// Output of [`synthesize`]
#[derive(Clone, Debug, Default)]
pub struct Scenario {
    pub events: Vec<EventRecord>,
    pub truth: Vec<TruthRecord>,
    /// Number of injected outliers
    pub outliers: usize,
}

fn noise(std: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, std)
        .map_err(|e| FilterError::Config(format!("invalid noise standard deviation {}: {}", std, e)))
}

fn sample3<R: Rng>(dist: &Normal<f64>, rng: &mut R) -> Vector3<f64> {
    Vector3::new(dist.sample(rng), dist.sample(rng), dist.sample(rng))
}

/// Upper bound on `duration * imu_rate_hz` accepted by [`synthesize`]
pub const MAX_SCENARIO_TICKS: usize = 100_000_000;

/// Generate a seeded event log and its ground truth.
///
/// Truth is integrated with the same discrete model the filter uses (`p += v dt`, then
/// `v += a dt`), starting at the origin. Fixes are emitted right after the IMU row of every
/// `imu_rate_hz / fix_rate_hz`-th tick.
pub fn synthesize(cfg: &ScenarioConfig) -> Result<Scenario> {
    let positive = |v: f64| v.is_finite() && v > 0.0;
    if !(positive(cfg.duration) && positive(cfg.imu_rate_hz) && positive(cfg.fix_rate_hz)) {
        return Err(FilterError::Config(
            "duration and rates must be positive and finite".to_string(),
        ));
    }
    if cfg.duration * cfg.imu_rate_hz > MAX_SCENARIO_TICKS as f64 {
        return Err(FilterError::Config(format!(
            "scenario longer than {} IMU ticks",
            MAX_SCENARIO_TICKS
        )));
    }
    if cfg.fix_rate_hz > cfg.imu_rate_hz {
        return Err(FilterError::Config(
            "fix rate cannot exceed the IMU rate".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&cfg.outlier_probability) {
        return Err(FilterError::Config(format!(
            "outlier probability {} outside [0, 1]",
            cfg.outlier_probability
        )));
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(cfg.seed);
    let imu_noise = noise(cfg.imu_noise_std)?;
    let position_noise = noise(cfg.position_noise_std)?;
    let velocity_noise = noise(cfg.velocity_noise_std)?;

    let dt = 1.0 / cfg.imu_rate_hz;
    let ticks = (cfg.duration * cfg.imu_rate_hz).round() as usize;
    let fix_every = ((cfg.imu_rate_hz / cfg.fix_rate_hz).round() as usize).max(1);

    let acceleration = Vector3::from(cfg.acceleration);
    // Reported acceleration lives in the frame without bias correction
    let acceleration_nav = yaw_rotation(-cfg.yaw_bias) * acceleration;
    let position_std = Vector3::repeat(cfg.position_noise_std);
    let velocity_std = Vector3::repeat(cfg.velocity_noise_std);

    let mut position = Vector3::zeros();
    let mut velocity = Vector3::from(cfg.initial_velocity);
    let mut scenario = Scenario::default();

    for k in 0..=ticks {
        let time = k as f64 * dt;
        if k > 0 {
            position += velocity * dt;
            velocity += acceleration * dt;
        }
        scenario.truth.push(TruthRecord {
            time,
            x: position[0],
            y: position[1],
            z: position[2],
            vx: velocity[0],
            vy: velocity[1],
            vz: velocity[2],
        });
        let measured = acceleration_nav + sample3(&imu_noise, &mut rng);
        scenario.events.push(EventRecord::imu(time, &measured));

        if k == 0 || k % fix_every != 0 {
            continue;
        }
        let mut fix = position + sample3(&position_noise, &mut rng);
        if cfg.outlier_probability > 0.0 && rng.random_bool(cfg.outlier_probability) {
            let sign = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
            fix += Vector3::repeat(sign * cfg.outlier_magnitude);
            scenario.outliers += 1;
        }
        scenario
            .events
            .push(EventRecord::fix(time, EventKind::Position, &fix, &position_std));
        if cfg.velocity_noise_std > 0.0 {
            let fix = velocity + sample3(&velocity_noise, &mut rng);
            scenario
                .events
                .push(EventRecord::fix(time, EventKind::Velocity, &fix, &velocity_std));
        }
    }
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chi_square::RejectionThreshold;
    use crate::{StateCovariance, StateVector};
    use assert_approx_eq::assert_approx_eq;
    use tempfile::NamedTempFile;

    fn filter() -> PosYawBiasFilter {
        let mut filter = PosYawBiasFilter::new();
        filter
            .init(&StateCovariance::identity(), &StateVector::zeros())
            .unwrap();
        filter
    }

    #[test]
    fn kinds_map_to_streams() {
        assert_eq!(EventKind::Imu.stream(), None);
        assert_eq!(EventKind::ScanMatch.stream(), Some(MeasurementStream::ScanMatch));
        assert_eq!(EventKind::Gps.stream(), Some(MeasurementStream::Gps));
    }

    #[test]
    fn noise_is_diagonal_of_squares() {
        let e = EventRecord::fix(
            0.0,
            EventKind::Position,
            &Vector3::zeros(),
            &Vector3::new(0.5, 2.0, 3.0),
        );
        let r = e.noise();
        assert_eq!(r[(0, 0)], 0.25);
        assert_eq!(r[(1, 1)], 4.0);
        assert_eq!(r[(2, 2)], 9.0);
        assert_eq!(r[(0, 1)], 0.0);
    }

    #[test]
    fn csv_roundtrip_with_named_kinds() {
        let events = vec![
            EventRecord::imu(0.0, &Vector3::new(0.0, 0.0, 9.81)),
            EventRecord::fix(
                1.0,
                EventKind::ScanMatch,
                &Vector3::new(1.0, 2.0, 3.0),
                &Vector3::repeat(0.1),
            ),
        ];
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("csv");
        write_events(&events, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("time,kind,x,y,z,sx,sy,sz"));
        assert!(text.contains("scan_match"));
        assert_eq!(read_events(&path).unwrap(), events);
    }

    #[test]
    fn replay_predicts_with_imu_spacing() {
        let events = vec![
            EventRecord::imu(10.0, &Vector3::new(0.0, 0.0, 9.81)),
            EventRecord::imu(10.1, &Vector3::new(0.0, 0.0, 9.81)),
        ];
        let mut filter = filter();
        let estimates = run_replay(&mut filter, &events);
        assert_eq!(estimates[0].outcome, ReplayOutcome::Start);
        assert_eq!(estimates[0].vz, 0.0);
        assert_eq!(estimates[1].outcome, ReplayOutcome::Predicted);
        assert_approx_eq!(estimates[1].vz, 0.981, 1e-9);
    }

    #[test]
    fn replay_reports_rejections_and_failures() {
        let mut filter = filter();
        filter.set_pos_reject_threshold(RejectionThreshold::Confidence95);
        let events = vec![
            EventRecord::imu(0.0, &Vector3::zeros()),
            EventRecord::fix(
                0.0,
                EventKind::Position,
                &Vector3::new(0.5, 0.0, 0.0),
                &Vector3::repeat(1.0),
            ),
            EventRecord::fix(
                0.0,
                EventKind::Position,
                &Vector3::repeat(100.0),
                &Vector3::repeat(0.1),
            ),
            // goes back in time
            EventRecord::imu(-1.0, &Vector3::zeros()),
            EventRecord::imu(0.5, &Vector3::zeros()),
        ];
        let estimates = run_replay(&mut filter, &events);
        let outcomes: Vec<_> = estimates.iter().map(|e| e.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                ReplayOutcome::Start,
                ReplayOutcome::Accepted,
                ReplayOutcome::Rejected,
                ReplayOutcome::Failed,
                ReplayOutcome::Predicted,
            ]
        );
        assert!(estimates[1].statistic.is_some());
        assert_eq!(estimates[2].x, estimates[1].x);
        assert_eq!(filter.statistics(MeasurementStream::Position).rejected, 1);
    }

    #[test]
    fn synthesize_is_reproducible() {
        let cfg = ScenarioConfig {
            duration: 5.0,
            outlier_probability: 0.3,
            ..ScenarioConfig::default()
        };
        let a = synthesize(&cfg).unwrap();
        let b = synthesize(&cfg).unwrap();
        assert_eq!(a.events, b.events);
        assert_eq!(a.outliers, b.outliers);

        let c = synthesize(&ScenarioConfig { seed: 7, ..cfg }).unwrap();
        assert_ne!(a.events, c.events);
    }

    #[test]
    fn synthesize_layout() {
        let cfg = ScenarioConfig {
            duration: 2.0,
            imu_rate_hz: 10.0,
            fix_rate_hz: 1.0,
            ..ScenarioConfig::default()
        };
        let scenario = synthesize(&cfg).unwrap();
        let imu = scenario
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Imu)
            .count();
        let position = scenario
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Position)
            .count();
        assert_eq!(imu, 21);
        assert_eq!(position, 2);
        assert_eq!(scenario.truth.len(), 21);
        // twenty steps of a * dt
        let last = scenario.truth.last().unwrap();
        assert_approx_eq!(last.vx, 1.0 + 0.2 * 2.0, 1e-12);
        assert!(scenario.events.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn synthesize_rejects_bad_config() {
        let bad_rate = ScenarioConfig {
            fix_rate_hz: 0.0,
            ..ScenarioConfig::default()
        };
        assert!(synthesize(&bad_rate).is_err());
        let bad_prob = ScenarioConfig {
            outlier_probability: 1.5,
            ..ScenarioConfig::default()
        };
        assert!(synthesize(&bad_prob).is_err());
        let bad_std = ScenarioConfig {
            imu_noise_std: -1.0,
            ..ScenarioConfig::default()
        };
        assert!(matches!(synthesize(&bad_std), Err(FilterError::Config(_))));
        for (duration, imu_rate_hz) in [(f64::INFINITY, 100.0), (60.0, f64::INFINITY), (f64::NAN, 100.0)] {
            let unbounded = ScenarioConfig {
                duration,
                imu_rate_hz,
                ..ScenarioConfig::default()
            };
            assert!(matches!(synthesize(&unbounded), Err(FilterError::Config(_))));
        }
        let too_long = ScenarioConfig {
            duration: 1e12,
            ..ScenarioConfig::default()
        };
        assert!(matches!(synthesize(&too_long), Err(FilterError::Config(_))));
    }
}
