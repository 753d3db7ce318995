//! Position / velocity / yaw-bias filter
//!
//! [`PosYawBiasFilter`] owns the canonical [`PoseState`], one [`ExtendedKalmanFilter`] engine
//! per measurement stream and the per-stream gating configuration. It implements the nonlinear
//! models (through [`crate::linearize`]) and drives the engines:
//!
//! ```text
//! init(P0, x0)
//! loop {
//!     predict(a, dt)
//!     correction_*(z, R)   // zero or more, applied sequentially
//! }
//! ```
//!
//! Each correction runs innovation → gate → (accept: gain + update | reject: discard). A
//! rejected observation leaves the state and covariance bit-identical and is reported as
//! [`CorrectionOutcome::Rejected`], never as an error. Numerical failures (singular innovation
//! covariance) and misuse (uninitialized filter, non-finite inputs) are returned as
//! [`FilterError`] and leave the state untouched.

use std::fmt::{self, Display};

use log::{debug, warn};
use nalgebra::{Isometry3, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::chi_square::{self, RejectionThreshold};
use crate::error::{FilterError, Result};
use crate::kalman::{CovarianceUpdate, ExtendedKalmanFilter};
use crate::linalg::{ensure_finite, validate_covariance};
use crate::linearize::{
    GpsObservation, ObservationModel, PositionObservation, ScanMatchObservation,
    VelocityObservation, rotate_process_noise, transition, transition_jacobian,
};
use crate::{INPUT_SIZE, PoseState, STATE_SIZE, StateCovariance, StateVector};

pub const MEASUREMENT_SIZE_POS: usize = 3;
pub const MEASUREMENT_SIZE_VEL: usize = 3;
pub const MEASUREMENT_SIZE_SCAN_MATCH: usize = 3;
pub const MEASUREMENT_SIZE_GPS: usize = 3;

pub type PositionEngine = ExtendedKalmanFilter<STATE_SIZE, INPUT_SIZE, MEASUREMENT_SIZE_POS>;
pub type VelocityEngine = ExtendedKalmanFilter<STATE_SIZE, INPUT_SIZE, MEASUREMENT_SIZE_VEL>;
pub type ScanMatchEngine =
    ExtendedKalmanFilter<STATE_SIZE, INPUT_SIZE, MEASUREMENT_SIZE_SCAN_MATCH>;
pub type GpsEngine = ExtendedKalmanFilter<STATE_SIZE, INPUT_SIZE, MEASUREMENT_SIZE_GPS>;

/// Measurement streams the filter can be corrected with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementStream {
    Position,
    Velocity,
    ScanMatch,
    Gps,
}

impl MeasurementStream {
    pub const ALL: [MeasurementStream; 4] = [
        MeasurementStream::Position,
        MeasurementStream::Velocity,
        MeasurementStream::ScanMatch,
        MeasurementStream::Gps,
    ];

    fn index(&self) -> usize {
        match self {
            MeasurementStream::Position => 0,
            MeasurementStream::Velocity => 1,
            MeasurementStream::ScanMatch => 2,
            MeasurementStream::Gps => 3,
        }
    }
}

impl Display for MeasurementStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementStream::Position => write!(f, "position"),
            MeasurementStream::Velocity => write!(f, "velocity"),
            MeasurementStream::ScanMatch => write!(f, "scan match"),
            MeasurementStream::Gps => write!(f, "GPS"),
        }
    }
}

/// Result of a correction call that did not fail numerically
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CorrectionOutcome {
    /// The observation was fused. `statistic` is the squared Mahalanobis distance, `None` when
    /// the stream is not gated.
    Accepted { statistic: Option<f64> },
    /// The gate discarded the observation; the state is unchanged.
    Rejected { statistic: f64, threshold: f64 },
}

impl CorrectionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CorrectionOutcome::Accepted { .. })
    }

    pub fn is_rejected(&self) -> bool {
        !self.is_accepted()
    }

    pub fn statistic(&self) -> Option<f64> {
        match self {
            CorrectionOutcome::Accepted { statistic } => *statistic,
            CorrectionOutcome::Rejected { statistic, .. } => Some(*statistic),
        }
    }
}

/// Gating setting for every measurement stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectionSettings {
    pub position: RejectionThreshold,
    pub velocity: RejectionThreshold,
    pub scan_match: RejectionThreshold,
    pub gps: RejectionThreshold,
}

impl RejectionSettings {
    pub fn get(&self, stream: MeasurementStream) -> RejectionThreshold {
        match stream {
            MeasurementStream::Position => self.position,
            MeasurementStream::Velocity => self.velocity,
            MeasurementStream::ScanMatch => self.scan_match,
            MeasurementStream::Gps => self.gps,
        }
    }

    pub fn set(&mut self, stream: MeasurementStream, threshold: RejectionThreshold) {
        match stream {
            MeasurementStream::Position => self.position = threshold,
            MeasurementStream::Velocity => self.velocity = threshold,
            MeasurementStream::ScanMatch => self.scan_match = threshold,
            MeasurementStream::Gps => self.gps = threshold,
        }
    }
}

/// Accepted / rejected counters of one stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStatistics {
    pub accepted: u64,
    pub rejected: u64,
}

/// Extended Kalman filter over position, velocity and yaw bias.
///
/// # Example
///
/// ```rust
/// use pose_estimator::filter::PosYawBiasFilter;
/// use pose_estimator::{StateCovariance, StateVector};
/// use nalgebra::{Matrix3, Vector3};
///
/// let mut ekf = PosYawBiasFilter::new();
/// ekf.init(&StateCovariance::identity(), &StateVector::zeros()).unwrap();
/// ekf.process_noise(&(StateCovariance::identity() * 0.01)).unwrap();
/// ekf.predict(&Vector3::new(0.0, 0.0, 9.81), 0.1).unwrap();
/// let outcome = ekf
///     .correction_position(&Vector3::new(0.1, 0.0, 0.0), &(Matrix3::identity() * 0.5))
///     .unwrap();
/// assert!(outcome.is_accepted());
/// ```
#[derive(Clone, Debug)]
pub struct PosYawBiasFilter {
    state: PoseState,
    /// Process noise in the world frame without bias correction
    process_noise: StateCovariance,
    initialized: bool,
    rejection: RejectionSettings,
    filter_position: PositionEngine,
    filter_velocity: VelocityEngine,
    filter_scan_match: ScanMatchEngine,
    filter_gps: GpsEngine,
    position_model: PositionObservation,
    velocity_model: VelocityObservation,
    scan_match_model: ScanMatchObservation,
    gps_model: GpsObservation,
    statistics: [StreamStatistics; 4],
}

impl Default for PosYawBiasFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PosYawBiasFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PosYawBiasFilter {{ {} }}", self.state)
    }
}

impl PosYawBiasFilter {
    /// Create an uninitialized filter. [`Self::init`] must be called before predicting or
    /// correcting.
    pub fn new() -> Self {
        PosYawBiasFilter {
            state: PoseState::default(),
            process_noise: StateCovariance::zeros(),
            initialized: false,
            rejection: RejectionSettings::default(),
            filter_position: PositionEngine::new(),
            filter_velocity: VelocityEngine::new(),
            filter_scan_match: ScanMatchEngine::new(),
            filter_gps: GpsEngine::new(),
            position_model: PositionObservation,
            velocity_model: VelocityObservation,
            scan_match_model: ScanMatchObservation,
            gps_model: GpsObservation::default(),
            statistics: [StreamStatistics::default(); 4],
        }
    }

    /// Establish the initial belief.
    ///
    /// Resets the scan-match and GPS rejection thresholds to no gating, zeroes the process noise
    /// and the per-stream statistics. Position and velocity thresholds keep their setting.
    pub fn init(&mut self, p0: &StateCovariance, x0: &StateVector) -> Result<()> {
        ensure_finite(x0, "initial state")?;
        validate_covariance(p0, "initial covariance")?;
        self.rejection.scan_match = RejectionThreshold::None;
        self.rejection.gps = RejectionThreshold::None;
        self.process_noise = StateCovariance::zeros();
        self.state = PoseState::from_parts(*x0, *p0);
        self.statistics = [StreamStatistics::default(); 4];
        self.initialized = true;
        debug!("filter initialized: {}", self.state);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set the base process noise, specified in the world frame without bias correction.
    ///
    /// The noise is rotated into the bias-corrected frame with the yaw bias current at each
    /// [`Self::predict`], so its magnitude stays consistent as the bias estimate evolves.
    pub fn process_noise(&mut self, q: &StateCovariance) -> Result<()> {
        validate_covariance(q, "process noise")?;
        self.process_noise = *q;
        Ok(())
    }

    /// Base process noise as configured
    pub fn base_process_noise(&self) -> &StateCovariance {
        &self.process_noise
    }

    /// Process noise rotated into the current bias-corrected frame
    pub fn process_noise_in_frame(&self) -> StateCovariance {
        rotate_process_noise(&self.process_noise, self.state.yaw_bias())
    }

    pub fn set_pos_reject_threshold(&mut self, threshold: RejectionThreshold) {
        self.rejection.position = threshold;
    }

    pub fn set_vel_reject_threshold(&mut self, threshold: RejectionThreshold) {
        self.rejection.velocity = threshold;
    }

    pub fn set_scan_match_reject_threshold(&mut self, threshold: RejectionThreshold) {
        self.rejection.scan_match = threshold;
    }

    pub fn set_gps_reject_threshold(&mut self, threshold: RejectionThreshold) {
        self.rejection.gps = threshold;
    }

    pub fn set_rejection_settings(&mut self, settings: RejectionSettings) {
        self.rejection = settings;
    }

    pub fn rejection_settings(&self) -> &RejectionSettings {
        &self.rejection
    }

    /// Use the given covariance update form on every measurement engine
    pub fn set_covariance_update(&mut self, form: CovarianceUpdate) {
        self.filter_position.set_covariance_update(form);
        self.filter_velocity.set_covariance_update(form);
        self.filter_scan_match.set_covariance_update(form);
        self.filter_gps.set_covariance_update(form);
    }

    /// Fixed world → GPS-world transform used by [`Self::correction_gps`]
    pub fn set_world_to_gps(&mut self, world_to_gps: Isometry3<f64>) {
        self.gps_model = GpsObservation::new(world_to_gps);
    }

    pub fn gps_model(&self) -> &GpsObservation {
        &self.gps_model
    }

    pub fn state(&self) -> &PoseState {
        &self.state
    }

    pub fn covariance(&self) -> &StateCovariance {
        self.state.covariance()
    }

    pub fn statistics(&self, stream: MeasurementStream) -> StreamStatistics {
        self.statistics[stream.index()]
    }

    /// Propagate the belief by `dt` seconds with the navigation-frame acceleration.
    ///
    /// # Arguments
    /// * `acceleration_nav` - acceleration reported in the world frame without bias correction (m/s²)
    /// * `dt` - elapsed time in seconds, must be finite and non-negative
    pub fn predict(&mut self, acceleration_nav: &Vector3<f64>, dt: f64) -> Result<()> {
        self.ensure_initialized()?;
        if !dt.is_finite() || dt < 0.0 {
            return Err(FilterError::InvalidTimeStep(dt));
        }
        ensure_finite(acceleration_nav, "acceleration")?;

        let f = transition(&self.state.mean, acceleration_nav, dt);
        let j_f = transition_jacobian(&self.state.mean, acceleration_nav, dt);
        let q = self.process_noise_in_frame();

        self.filter_position.prediction(
            &mut self.state.mean,
            &mut self.state.covariance,
            &f,
            &j_f,
            &q,
        );
        debug!("predict dt={:.4}s: {}", dt, self.state);
        Ok(())
    }

    /// Correct with an absolute position fix in the navigation frame.
    pub fn correction_position(
        &mut self,
        measurement: &Vector3<f64>,
        noise: &Matrix3<f64>,
    ) -> Result<CorrectionOutcome> {
        self.ensure_initialized()?;
        let outcome = correct(
            &mut self.filter_position,
            &mut self.state,
            &self.position_model,
            self.rejection.position,
            MeasurementStream::Position,
            measurement,
            noise,
        )?;
        self.record(MeasurementStream::Position, &outcome);
        Ok(outcome)
    }

    /// Correct with a velocity fix in the navigation frame.
    pub fn correction_velocity(
        &mut self,
        measurement: &Vector3<f64>,
        noise: &Matrix3<f64>,
    ) -> Result<CorrectionOutcome> {
        self.ensure_initialized()?;
        let outcome = correct(
            &mut self.filter_velocity,
            &mut self.state,
            &self.velocity_model,
            self.rejection.velocity,
            MeasurementStream::Velocity,
            measurement,
            noise,
        )?;
        self.record(MeasurementStream::Velocity, &outcome);
        Ok(outcome)
    }

    /// Correct with a scan-matching position result.
    pub fn correction_scan_match(
        &mut self,
        measurement: &Vector3<f64>,
        noise: &Matrix3<f64>,
    ) -> Result<CorrectionOutcome> {
        self.ensure_initialized()?;
        let outcome = correct(
            &mut self.filter_scan_match,
            &mut self.state,
            &self.scan_match_model,
            self.rejection.scan_match,
            MeasurementStream::ScanMatch,
            measurement,
            noise,
        )?;
        self.record(MeasurementStream::ScanMatch, &outcome);
        Ok(outcome)
    }

    /// Correct with a GPS position expressed in the GPS world frame.
    ///
    /// The observation depends on the yaw bias, so this is the one correction that makes the
    /// bias observable from position data.
    pub fn correction_gps(
        &mut self,
        measurement: &Vector3<f64>,
        noise: &Matrix3<f64>,
    ) -> Result<CorrectionOutcome> {
        self.ensure_initialized()?;
        let outcome = correct(
            &mut self.filter_gps,
            &mut self.state,
            &self.gps_model,
            self.rejection.gps,
            MeasurementStream::Gps,
            measurement,
            noise,
        )?;
        self.record(MeasurementStream::Gps, &outcome);
        Ok(outcome)
    }

    /// Dispatch a correction by stream
    pub fn correction(
        &mut self,
        stream: MeasurementStream,
        measurement: &Vector3<f64>,
        noise: &Matrix3<f64>,
    ) -> Result<CorrectionOutcome> {
        match stream {
            MeasurementStream::Position => self.correction_position(measurement, noise),
            MeasurementStream::Velocity => self.correction_velocity(measurement, noise),
            MeasurementStream::ScanMatch => self.correction_scan_match(measurement, noise),
            MeasurementStream::Gps => self.correction_gps(measurement, noise),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(FilterError::Uninitialized)
        }
    }

    fn record(&mut self, stream: MeasurementStream, outcome: &CorrectionOutcome) {
        let stats = &mut self.statistics[stream.index()];
        if outcome.is_accepted() {
            stats.accepted += 1;
        } else {
            stats.rejected += 1;
        }
    }
}

/// Innovation → gate → gain + update for one 3-element observation.
fn correct<O: ObservationModel<3>>(
    engine: &mut ExtendedKalmanFilter<STATE_SIZE, INPUT_SIZE, 3>,
    state: &mut PoseState,
    model: &O,
    setting: RejectionThreshold,
    stream: MeasurementStream,
    measurement: &Vector3<f64>,
    noise: &Matrix3<f64>,
) -> Result<CorrectionOutcome> {
    ensure_finite(measurement, "measurement")?;
    validate_covariance(noise, "measurement noise")?;

    let j_h = model.jacobian(&state.mean);
    let h = model.expected_measurement(&state.mean);
    engine.innovation(&state.covariance, measurement, &h, &j_h, noise);

    let decision = match chi_square::evaluate(
        engine.last_innovation(),
        engine.last_innovation_covariance(),
        setting,
    ) {
        Ok(decision) => decision,
        Err(e) => {
            engine.discard();
            return Err(e);
        }
    };

    if decision.rejected {
        engine.discard();
        let threshold = decision.threshold.unwrap_or(f64::INFINITY);
        warn!(
            "Rejected {} observation: d2 = {:.3} > {:.3} ({})",
            stream, decision.statistic, threshold, setting
        );
        return Ok(CorrectionOutcome::Rejected {
            statistic: decision.statistic,
            threshold,
        });
    }

    if let Err(e) = engine
        .gain(&state.covariance, &j_h)
        .and_then(|_| engine.update(&mut state.mean, &mut state.covariance, &j_h))
    {
        engine.discard();
        return Err(e);
    }
    state.normalize_yaw_bias();

    let statistic = decision.threshold.map(|_| decision.statistic);
    debug!("{} correction accepted: {}", stream, state);
    Ok(CorrectionOutcome::Accepted { statistic })
}
