//! Position / velocity / yaw-bias estimator for mobile platforms
//!
//! This crate provides a recursive Extended Kalman Filter that fuses asynchronous, heterogeneous
//! observations (absolute position fixes, velocity fixes, scan-matching displacement and GPS)
//! into a single estimate of a platform's position, velocity and a slowly varying heading (yaw)
//! bias. The filter is call-driven: an external driver invokes `predict` once per elapsed time
//! step with the navigation-frame acceleration, followed by zero or more corrections for whatever
//! observations arrived in that step. Every correction is independently gated by a chi-square
//! test before it is allowed to touch the state.
//!
//! The crate does not talk to sensors, schedule calls or synchronize clocks. It receives already
//! computed elapsed times and measurements with their noise covariances.
//!
//! This crate is primarily built off of:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): fixed-size linear algebra for the filter math.
//! - [`serde`](https://crates.io/crates/serde): configuration and data I/O.
//!
//! ## Crate overview
//!
//! - [chi_square]: Mahalanobis gating and chi-square critical values.
//! - [kalman]: the generic fixed-size EKF engine (prediction, innovation, gain, update).
//! - [linearize]: nonlinear transition and observation models with their Jacobians.
//! - [filter]: the [`filter::PosYawBiasFilter`] orchestrator.
//! - [linalg]: symmetrization, inversion and covariance validation helpers.
//! - [config]: serde configuration loaded from JSON, YAML or TOML.
//! - [replay]: CSV event replay and seeded synthetic scenarios.
//!
//! ## Coordinate and state definitions
//!
//! The state vector is
//!
//! $$
//! x = [p_x, p_y, p_z, v_x, v_y, v_z, \psi_b]
//! $$
//!
//! Position and velocity are expressed in the bias-corrected navigation frame. $\psi_b$ is the yaw
//! bias: the heading offset between the frame the acceleration is reported in and the true
//! navigation frame. The rotation $R_z(\psi_b)$ resolves reported quantities into the
//! navigation frame.
//!
//! ### Transition model
//!
//! $$
//! p(+) = p(-) + v(-) t, \quad v(+) = v(-) + R_z(\psi_b) a t, \quad \psi_b(+) = \psi_b(-)
//! $$
//!
//! Position is advanced with the pre-step velocity. The bias is modelled as a random walk driven
//! only by its process noise.

pub mod chi_square;
pub mod config;
pub mod error;
pub mod filter;
pub mod kalman;
pub mod linalg;
pub mod linearize;
pub mod replay;

use nalgebra::{Matrix3, Rotation3, SMatrix, SVector, Vector3};

use std::convert::TryFrom;
use std::fmt::{self, Debug, Display};

pub use crate::error::{FilterError, Result};

/// Number of states: position (3), velocity (3), yaw bias (1)
pub const STATE_SIZE: usize = 7;
/// Number of control inputs: navigation-frame acceleration
pub const INPUT_SIZE: usize = 3;

/// First index of the position block
pub const POSITION_INDEX: usize = 0;
/// First index of the velocity block
pub const VELOCITY_INDEX: usize = 3;
/// Index of the yaw bias
pub const YAW_BIAS_INDEX: usize = 6;

/// Filter state vector
pub type StateVector = SVector<f64, STATE_SIZE>;
/// Filter state covariance
pub type StateCovariance = SMatrix<f64, STATE_SIZE, STATE_SIZE>;

/// State and covariance of the estimator.
///
/// Exposes the semantic blocks of the state (position, velocity, yaw bias) without exposing the
/// storage layout. No validation happens here; keeping the covariance symmetric and positive
/// semi-definite is the job of [`filter::PosYawBiasFilter`].
#[derive(Clone, Copy, PartialEq)]
pub struct PoseState {
    pub(crate) mean: StateVector,
    pub(crate) covariance: StateCovariance,
}

impl Default for PoseState {
    fn default() -> Self {
        PoseState {
            mean: StateVector::zeros(),
            covariance: StateCovariance::zeros(),
        }
    }
}

impl Debug for PoseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoseState")
            .field("position (m)", &self.position().as_slice())
            .field("velocity (m/s)", &self.velocity().as_slice())
            .field("yaw_bias (deg)", &self.yaw_bias().to_degrees())
            .field("covariance_trace", &self.covariance.trace())
            .finish()
    }
}

impl Display for PoseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.position();
        let v = self.velocity();
        write!(
            f,
            "PoseState {{ p: [{:.3}, {:.3}, {:.3}] m, v: [{:.3}, {:.3}, {:.3}] m/s, yaw_bias: {:.3} deg, tr(P): {:.4e} }}",
            p[0],
            p[1],
            p[2],
            v[0],
            v[1],
            v[2],
            self.yaw_bias().to_degrees(),
            self.covariance.trace()
        )
    }
}

impl PoseState {
    /// Build a state from its semantic blocks with a zero covariance.
    pub fn new(position: Vector3<f64>, velocity: Vector3<f64>, yaw_bias: f64) -> PoseState {
        let mut state = PoseState::default();
        state.set_position(&position);
        state.set_velocity(&velocity);
        state.set_yaw_bias(yaw_bias);
        state
    }

    pub fn from_parts(mean: StateVector, covariance: StateCovariance) -> PoseState {
        PoseState { mean, covariance }
    }

    /// Full state vector `[x, y, z, vx, vy, vz, yaw_bias]`
    pub fn vector(&self) -> &StateVector {
        &self.mean
    }

    pub fn vector_mut(&mut self) -> &mut StateVector {
        &mut self.mean
    }

    pub fn covariance(&self) -> &StateCovariance {
        &self.covariance
    }

    pub fn covariance_mut(&mut self) -> &mut StateCovariance {
        &mut self.covariance
    }

    pub fn position(&self) -> Vector3<f64> {
        self.mean.fixed_rows::<3>(POSITION_INDEX).into_owned()
    }

    pub fn set_position(&mut self, position: &Vector3<f64>) {
        self.mean.fixed_rows_mut::<3>(POSITION_INDEX).copy_from(position);
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.mean.fixed_rows::<3>(VELOCITY_INDEX).into_owned()
    }

    pub fn set_velocity(&mut self, velocity: &Vector3<f64>) {
        self.mean.fixed_rows_mut::<3>(VELOCITY_INDEX).copy_from(velocity);
    }

    /// Yaw bias in radians
    pub fn yaw_bias(&self) -> f64 {
        self.mean[YAW_BIAS_INDEX]
    }

    pub fn set_yaw_bias(&mut self, yaw_bias: f64) {
        self.mean[YAW_BIAS_INDEX] = yaw_bias;
    }

    /// Rotation from the reported frame into the bias-corrected navigation frame
    pub fn heading_rotation(&self) -> Rotation3<f64> {
        linearize::yaw_rotation(self.yaw_bias())
    }

    pub fn position_covariance(&self) -> Matrix3<f64> {
        self.covariance
            .fixed_view::<3, 3>(POSITION_INDEX, POSITION_INDEX)
            .into_owned()
    }

    pub fn velocity_covariance(&self) -> Matrix3<f64> {
        self.covariance
            .fixed_view::<3, 3>(VELOCITY_INDEX, VELOCITY_INDEX)
            .into_owned()
    }

    pub fn yaw_bias_variance(&self) -> f64 {
        self.covariance[(YAW_BIAS_INDEX, YAW_BIAS_INDEX)]
    }

    /// Wrap the yaw bias into [-π, π]
    pub(crate) fn normalize_yaw_bias(&mut self) {
        self.mean[YAW_BIAS_INDEX] = wrap_to_pi(self.mean[YAW_BIAS_INDEX]);
    }
}

impl From<PoseState> for Vec<f64> {
    /// State vector in `[x, y, z, vx, vy, vz, yaw_bias]` order
    fn from(state: PoseState) -> Self {
        state.mean.iter().copied().collect()
    }
}

impl From<&PoseState> for Vec<f64> {
    fn from(state: &PoseState) -> Self {
        state.mean.iter().copied().collect()
    }
}

impl TryFrom<&[f64]> for PoseState {
    type Error = FilterError;
    /// Build a state (zero covariance) from a slice of 7 elements.
    fn try_from(slice: &[f64]) -> Result<Self> {
        if slice.len() != STATE_SIZE {
            return Err(FilterError::DimensionMismatch {
                name: "state vector",
                expected: STATE_SIZE.to_string(),
                found: slice.len(),
            });
        }
        Ok(PoseState {
            mean: StateVector::from_column_slice(slice),
            covariance: StateCovariance::zeros(),
        })
    }
}

impl TryFrom<Vec<f64>> for PoseState {
    type Error = FilterError;
    fn try_from(vec: Vec<f64>) -> Result<Self> {
        Self::try_from(vec.as_slice())
    }
}

/// Wrap an angle to the range -π to π radians
///
/// # Example
/// ```rust
/// use pose_estimator::wrap_to_pi;
/// use std::f64::consts::PI;
/// assert!((wrap_to_pi(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    if (-PI..=PI).contains(&angle) {
        return angle;
    }
    let wrapped = angle.rem_euclid(TAU);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_wrap_to_pi() {
        // odd multiples of π may land on either end of the interval
        assert_approx_eq!(wrap_to_pi(3.0 * PI).abs(), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI).abs(), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(2.5 * PI), 0.5 * PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-2.5 * PI), -0.5 * PI, 1e-12);
        assert_eq!(wrap_to_pi(0.0), 0.0);
        assert_eq!(wrap_to_pi(PI), PI);
        assert_eq!(wrap_to_pi(-PI), -PI);
    }

    #[test]
    fn test_wrap_to_pi_huge_angles() {
        for angle in [1e18, -1e18, 9.8e16, 1e300, -1e300, f64::MAX] {
            let wrapped = wrap_to_pi(angle);
            assert!(wrapped.is_finite(), "{angle} wrapped to {wrapped}");
            assert!((-PI..=PI).contains(&wrapped), "{angle} wrapped to {wrapped}");
        }
        assert!(wrap_to_pi(f64::INFINITY).is_nan());
    }

    #[test]
    fn state_blocks() {
        let mut state = PoseState::new(
            Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(4.0, 5.0, 6.0),
            0.25,
        );
        assert_eq!(state.vector().as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.25]);
        assert_eq!(state.position(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(state.velocity(), Vector3::new(4.0, 5.0, 6.0));
        assert_approx_eq!(state.yaw_bias(), 0.25, 1e-15);

        state.set_velocity(&Vector3::new(-1.0, 0.0, 1.0));
        assert_eq!(state.vector()[VELOCITY_INDEX], -1.0);
        assert_eq!(state.position(), Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn covariance_blocks() {
        let covariance = StateCovariance::from_diagonal(&StateVector::from_column_slice(&[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0,
        ]));
        let state = PoseState::from_parts(StateVector::zeros(), covariance);
        assert_eq!(state.position_covariance()[(2, 2)], 3.0);
        assert_eq!(state.velocity_covariance()[(0, 0)], 4.0);
        assert_eq!(state.yaw_bias_variance(), 7.0);
    }

    #[test]
    fn vec_conversions() {
        let state = PoseState::try_from(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 0.1]).unwrap();
        let back: Vec<f64> = state.into();
        assert_eq!(back, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 0.1]);
        assert!(PoseState::try_from(vec![0.0; 6]).is_err());
    }

    #[test]
    fn normalize_keeps_rotation() {
        let mut state = PoseState::new(Vector3::zeros(), Vector3::zeros(), 2.5 * PI);
        let before = state.heading_rotation();
        state.normalize_yaw_bias();
        assert_approx_eq!(state.yaw_bias(), 0.5 * PI, 1e-12);
        assert!((before.matrix() - state.heading_rotation().matrix()).amax() < 1e-12);
    }
}
