//! Transition and observation models with their Jacobians
//!
//! This module provides the nonlinear models of the position / velocity / yaw-bias filter and
//! their analytic linearizations. All functions are pure: they take the current state estimate
//! and return matrices, the orchestrator decides when to evaluate them.
//!
//! # State Ordering
//!
//! ```text
//! x = [x, y, z, v_x, v_y, v_z, yaw_bias]
//! ```
//!
//! # Heading correction
//!
//! The yaw bias enters every model through the rotation about the navigation z axis
//!
//! $$
//! R_z(\psi) = \begin{bmatrix} \cos\psi & -\sin\psi & 0 \\\\ \sin\psi & \cos\psi & 0 \\\\ 0 & 0 & 1 \end{bmatrix},
//! \quad
//! \frac{\partial R_z}{\partial \psi} = \begin{bmatrix} -\sin\psi & -\cos\psi & 0 \\\\ \cos\psi & -\sin\psi & 0 \\\\ 0 & 0 & 0 \end{bmatrix}
//! $$
//!
//! # Usage Example
//!
//! ```rust
//! use pose_estimator::linearize::{transition, transition_jacobian};
//! use pose_estimator::StateVector;
//! use nalgebra::Vector3;
//!
//! let x = StateVector::zeros();
//! let accel = Vector3::new(0.0, 0.0, 9.81);
//! let f = transition(&x, &accel, 0.1);
//! let j_f = transition_jacobian(&x, &accel, 0.1);
//! assert!((f[5] - 0.981).abs() < 1e-12);
//! assert_eq!(j_f[(0, 3)], 0.1);
//! ```

use nalgebra::{
    Isometry3, Matrix3, Point3, Rotation3, SMatrix, SVector, Translation3, UnitQuaternion,
    Vector3,
};

use crate::{
    POSITION_INDEX, STATE_SIZE, StateCovariance, StateVector, VELOCITY_INDEX, YAW_BIAS_INDEX,
};

/// Rotation about the navigation z axis by the yaw bias
pub fn yaw_rotation(yaw: f64) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::z_axis(), yaw)
}

/// Derivative of [`yaw_rotation`] with respect to the yaw angle
pub fn yaw_rotation_derivative(yaw: f64) -> Matrix3<f64> {
    let (s, c) = yaw.sin_cos();
    Matrix3::new(
        -s, -c, 0.0, //
        c, -s, 0.0, //
        0.0, 0.0, 0.0,
    )
}

/// Nonlinear state transition.
///
/// Position is advanced with the pre-step velocity, velocity with the acceleration resolved
/// through the current heading correction, and the yaw bias is held constant.
///
/// # Arguments
/// * `state` - current state estimate
/// * `acceleration_nav` - acceleration as reported in the navigation frame without bias correction (m/s²)
/// * `dt` - elapsed time in seconds
pub fn transition(state: &StateVector, acceleration_nav: &Vector3<f64>, dt: f64) -> StateVector {
    let rotation = yaw_rotation(state[YAW_BIAS_INDEX]);
    let position = state.fixed_rows::<3>(POSITION_INDEX);
    let velocity = state.fixed_rows::<3>(VELOCITY_INDEX);

    let mut f = *state;
    f.fixed_rows_mut::<3>(POSITION_INDEX)
        .copy_from(&(position + velocity * dt));
    f.fixed_rows_mut::<3>(VELOCITY_INDEX)
        .copy_from(&(velocity + rotation * acceleration_nav * dt));
    f
}

/// Compute the state transition Jacobian (F)
///
/// ```text
/// | I   I·dt  0              |
/// | 0   I     dR_z·a·dt      |
/// | 0   0     1              |
/// ```
///
/// The velocity/yaw-bias coupling captures that an error in the estimated bias produces an error
/// in how the acceleration is resolved into the navigation frame.
pub fn transition_jacobian(
    state: &StateVector,
    acceleration_nav: &Vector3<f64>,
    dt: f64,
) -> StateCovariance {
    let mut j_f = StateCovariance::identity();
    j_f.fixed_view_mut::<3, 3>(POSITION_INDEX, VELOCITY_INDEX)
        .copy_from(&(Matrix3::identity() * dt));
    let bias_coupling = yaw_rotation_derivative(state[YAW_BIAS_INDEX]) * acceleration_nav * dt;
    j_f.fixed_view_mut::<3, 1>(VELOCITY_INDEX, YAW_BIAS_INDEX)
        .copy_from(&bias_coupling);
    j_f
}

/// Rotate a base process noise into the bias-corrected frame.
///
/// The noise is specified in the world frame without bias correction; the position and velocity
/// blocks (including their cross terms and their coupling to the bias) are rotated with
/// `G = diag(R_z, R_z, 1)`, giving `Q_frame = G Q_base Gᵀ`.
pub fn rotate_process_noise(q_base: &StateCovariance, yaw: f64) -> StateCovariance {
    let rotation = yaw_rotation(yaw);
    let mut g = StateCovariance::identity();
    g.fixed_view_mut::<3, 3>(POSITION_INDEX, POSITION_INDEX)
        .copy_from(rotation.matrix());
    g.fixed_view_mut::<3, 3>(VELOCITY_INDEX, VELOCITY_INDEX)
        .copy_from(rotation.matrix());
    g * q_base * g.transpose()
}

/// Observation model of one measurement stream: `z = h(x) + v`, `v ~ N(0, R)`.
///
/// Implementations are evaluated at the current state estimate every time they are used, so
/// nonlinear models are relinearized each cycle.
pub trait ObservationModel<const M: usize> {
    /// Predicted observation `h(x)`
    fn expected_measurement(&self, state: &StateVector) -> SVector<f64, M>;
    /// Observation Jacobian `∂h/∂x` evaluated at `state`
    fn jacobian(&self, state: &StateVector) -> SMatrix<f64, M, STATE_SIZE>;
}

/// Jacobian selecting a 3-element block of the state
fn block_selector(first_index: usize) -> SMatrix<f64, 3, STATE_SIZE> {
    let mut h = SMatrix::<f64, 3, STATE_SIZE>::zeros();
    h.fixed_view_mut::<3, 3>(0, first_index)
        .copy_from(&Matrix3::identity());
    h
}

/// Absolute position fix in the navigation frame
#[derive(Clone, Copy, Debug, Default)]
pub struct PositionObservation;

impl ObservationModel<3> for PositionObservation {
    fn expected_measurement(&self, state: &StateVector) -> Vector3<f64> {
        self.jacobian(state) * state
    }
    fn jacobian(&self, _state: &StateVector) -> SMatrix<f64, 3, STATE_SIZE> {
        block_selector(POSITION_INDEX)
    }
}

/// Velocity fix in the navigation frame
#[derive(Clone, Copy, Debug, Default)]
pub struct VelocityObservation;

impl ObservationModel<3> for VelocityObservation {
    fn expected_measurement(&self, state: &StateVector) -> Vector3<f64> {
        self.jacobian(state) * state
    }
    fn jacobian(&self, _state: &StateVector) -> SMatrix<f64, 3, STATE_SIZE> {
        block_selector(VELOCITY_INDEX)
    }
}

/// Scan-matching result.
///
/// Currently observes the position block exactly like [`PositionObservation`]; kept as its own
/// model so the two can diverge without touching the orchestrator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanMatchObservation;

impl ObservationModel<3> for ScanMatchObservation {
    fn expected_measurement(&self, state: &StateVector) -> Vector3<f64> {
        self.jacobian(state) * state
    }
    fn jacobian(&self, _state: &StateVector) -> SMatrix<f64, 3, STATE_SIZE> {
        block_selector(POSITION_INDEX)
    }
}

/// GPS position observed in the GPS world frame.
///
/// `world_to_gps` is the fixed transform from the world frame (without bias correction) to the
/// GPS world frame, known a priori. The bias-corrected transform is
///
/// $$
/// T_{w \to gw}(\psi) = R_z(\psi) \, C \, R_z(\psi)^{-1}
/// $$
///
/// and the observation is $h(x) = T_{w \to gw}(\psi) \, p$.
#[derive(Clone, Copy, Debug)]
pub struct GpsObservation {
    pub world_to_gps: Isometry3<f64>,
}

impl Default for GpsObservation {
    fn default() -> Self {
        GpsObservation {
            world_to_gps: Isometry3::identity(),
        }
    }
}

impl GpsObservation {
    pub fn new(world_to_gps: Isometry3<f64>) -> Self {
        GpsObservation { world_to_gps }
    }

    /// Build the fixed transform from a translation and roll/pitch/yaw angles (radians)
    pub fn from_translation_euler(translation: Vector3<f64>, roll: f64, pitch: f64, yaw: f64) -> Self {
        GpsObservation {
            world_to_gps: Isometry3::from_parts(
                Translation3::from(translation),
                UnitQuaternion::from_euler_angles(roll, pitch, yaw),
            ),
        }
    }

    /// Bias-corrected world → GPS-world transform for the given yaw bias
    pub fn corrected_transform(&self, yaw: f64) -> Isometry3<f64> {
        let heading = Isometry3::from_parts(
            Translation3::identity(),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw),
        );
        heading * self.world_to_gps * heading.inverse()
    }
}

impl ObservationModel<3> for GpsObservation {
    fn expected_measurement(&self, state: &StateVector) -> Vector3<f64> {
        let position = Point3::from(state.fixed_rows::<3>(POSITION_INDEX).into_owned());
        self.corrected_transform(state[YAW_BIAS_INDEX])
            .transform_point(&position)
            .coords
    }

    /// With `h = R C_r Rᵀ p + R C_t`:
    /// - position columns: `R C_r Rᵀ`
    /// - yaw-bias column: `dR C_r Rᵀ p + R C_r dRᵀ p + dR C_t`
    fn jacobian(&self, state: &StateVector) -> SMatrix<f64, 3, STATE_SIZE> {
        let yaw = state[YAW_BIAS_INDEX];
        let position: Vector3<f64> = state.fixed_rows::<3>(POSITION_INDEX).into_owned();
        let r = yaw_rotation(yaw).into_inner();
        let d_r = yaw_rotation_derivative(yaw);
        let c_r = self.world_to_gps.rotation.to_rotation_matrix().into_inner();
        let c_t = self.world_to_gps.translation.vector;

        let mut h = SMatrix::<f64, 3, STATE_SIZE>::zeros();
        h.fixed_view_mut::<3, 3>(0, POSITION_INDEX)
            .copy_from(&(r * c_r * r.transpose()));
        let d_yaw = d_r * c_r * r.transpose() * position
            + r * c_r * d_r.transpose() * position
            + d_r * c_t;
        h.fixed_view_mut::<3, 1>(0, YAW_BIAS_INDEX)
            .copy_from(&d_yaw);
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::FRAC_PI_2;

    const EPS: f64 = 1e-6;

    fn numerical_jacobian<const M: usize, O: ObservationModel<M>>(
        model: &O,
        state: &StateVector,
    ) -> SMatrix<f64, M, STATE_SIZE> {
        let mut j = SMatrix::<f64, M, STATE_SIZE>::zeros();
        for i in 0..STATE_SIZE {
            let mut plus = *state;
            let mut minus = *state;
            plus[i] += EPS;
            minus[i] -= EPS;
            let column =
                (model.expected_measurement(&plus) - model.expected_measurement(&minus)) / (2.0 * EPS);
            j.set_column(i, &column);
        }
        j
    }

    fn numerical_transition_jacobian(state: &StateVector, a: &Vector3<f64>, dt: f64) -> StateCovariance {
        let mut j = StateCovariance::zeros();
        for i in 0..STATE_SIZE {
            let mut plus = *state;
            let mut minus = *state;
            plus[i] += EPS;
            minus[i] -= EPS;
            let column = (transition(&plus, a, dt) - transition(&minus, a, dt)) / (2.0 * EPS);
            j.set_column(i, &column);
        }
        j
    }

    fn sample_state() -> StateVector {
        StateVector::from_column_slice(&[12.0, -4.0, 1.5, 0.8, -0.3, 0.05, 0.3])
    }

    #[test]
    fn yaw_rotation_derivative_matches_finite_difference() {
        let yaw = 0.7;
        let numeric =
            (yaw_rotation(yaw + EPS).into_inner() - yaw_rotation(yaw - EPS).into_inner()) / (2.0 * EPS);
        assert!((numeric - yaw_rotation_derivative(yaw)).amax() < 1e-8);
    }

    #[test]
    fn transition_uses_pre_step_velocity() {
        let x = StateVector::from_column_slice(&[1.0, 2.0, 3.0, 1.0, 0.0, 0.0, 0.0]);
        let f = transition(&x, &Vector3::new(2.0, 0.0, 0.0), 0.5);
        assert_approx_eq!(f[0], 1.5, 1e-12);
        assert_approx_eq!(f[3], 2.0, 1e-12);
        assert_approx_eq!(f[6], 0.0, 1e-12);
    }

    #[test]
    fn transition_resolves_acceleration_through_bias() {
        let x = StateVector::from_column_slice(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, FRAC_PI_2]);
        let f = transition(&x, &Vector3::new(1.0, 0.0, 0.0), 1.0);
        assert_approx_eq!(f[3], 0.0, 1e-12);
        assert_approx_eq!(f[4], 1.0, 1e-12);
        assert_approx_eq!(f[6], FRAC_PI_2, 1e-12);
    }

    #[test]
    fn transition_with_zero_dt_is_identity() {
        let x = sample_state();
        let a = Vector3::new(3.0, -2.0, 9.81);
        assert_eq!(transition(&x, &a, 0.0), x);
        assert_eq!(transition_jacobian(&x, &a, 0.0), StateCovariance::identity());
    }

    #[test]
    fn transition_jacobian_matches_numerical() {
        let x = sample_state();
        let a = Vector3::new(0.4, -1.2, 9.81);
        let analytic = transition_jacobian(&x, &a, 0.05);
        let numeric = numerical_transition_jacobian(&x, &a, 0.05);
        assert!((analytic - numeric).amax() < 1e-8);
    }

    #[test]
    fn linear_observation_jacobians_select_blocks() {
        let x = sample_state();
        assert_eq!(PositionObservation.expected_measurement(&x), Vector3::new(12.0, -4.0, 1.5));
        assert_eq!(VelocityObservation.expected_measurement(&x), Vector3::new(0.8, -0.3, 0.05));
        assert_eq!(
            ScanMatchObservation.jacobian(&x),
            PositionObservation.jacobian(&x)
        );
        let h_vel = VelocityObservation.jacobian(&x);
        assert_eq!(h_vel[(0, 3)], 1.0);
        assert_eq!(h_vel[(0, 0)], 0.0);
        assert_eq!(h_vel.column(YAW_BIAS_INDEX).amax(), 0.0);
    }

    #[test]
    fn gps_identity_transform_observes_position() {
        let gps = GpsObservation::default();
        let x = sample_state();
        let z = gps.expected_measurement(&x);
        assert!((z - Vector3::new(12.0, -4.0, 1.5)).amax() < 1e-12);
        let h = gps.jacobian(&x);
        assert!((h.fixed_view::<3, 3>(0, 0) - Matrix3::identity()).amax() < 1e-12);
        assert!(h.column(YAW_BIAS_INDEX).amax() < 1e-12);
    }

    #[test]
    fn gps_jacobian_matches_numerical() {
        let gps = GpsObservation::from_translation_euler(Vector3::new(5.0, -3.0, 0.5), 0.02, -0.01, 0.4);
        let x = sample_state();
        let analytic = gps.jacobian(&x);
        let numeric = numerical_jacobian(&gps, &x);
        assert!(
            (analytic - numeric).amax() < 1e-6,
            "analytic:\n{}\nnumeric:\n{}",
            analytic,
            numeric
        );
        // velocity does not enter the GPS observation
        assert!(analytic.fixed_view::<3, 3>(0, VELOCITY_INDEX).amax() < 1e-12);
    }

    #[test]
    fn process_noise_rotation() {
        let mut q = StateCovariance::zeros();
        q[(0, 0)] = 1.0;
        q[(3, 3)] = 2.0;
        q[(6, 6)] = 1e-4;
        let rotated = rotate_process_noise(&q, FRAC_PI_2);
        assert_approx_eq!(rotated[(0, 0)], 0.0, 1e-12);
        assert_approx_eq!(rotated[(1, 1)], 1.0, 1e-12);
        assert_approx_eq!(rotated[(4, 4)], 2.0, 1e-12);
        assert_approx_eq!(rotated[(6, 6)], 1e-4, 1e-16);
        // isotropic noise is unaffected by the heading
        let iso = StateCovariance::identity() * 0.01;
        assert!((rotate_process_noise(&iso, 0.9) - iso).amax() < 1e-15);
    }
}
