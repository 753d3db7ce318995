//! Generic fixed-size Extended Kalman Filter engine
//!
//! The engine knows nothing about the platform model. The caller supplies the nonlinear
//! propagation result `f`, the transition Jacobian, the predicted observation `h` and the
//! observation Jacobian; the engine only performs the Kalman algebra:
//!
//! $$
//! \begin{aligned}
//! \bar{P} &= F P F^T + Q \\\\
//! y &= z - h(\bar{x}) \\\\
//! S &= H \bar{P} H^T + R \\\\
//! K &= \bar{P} H^T S^{-1} \\\\
//! x &= \bar{x} + K y \\\\
//! P &= (I - K H) \bar{P}
//! \end{aligned}
//! $$
//!
//! One engine is instantiated per measurement stream so that each stream carries its own
//! measurement dimension `M` at the type level. The state and covariance are not owned by the
//! engine: they are borrowed from the orchestrator for each call, so there is exactly one
//! canonical copy of the belief.
//!
//! The correction is split into [`ExtendedKalmanFilter::innovation`],
//! [`ExtendedKalmanFilter::gain`] and [`ExtendedKalmanFilter::update`] so that a gate can sit
//! between the innovation and the gain. The engine tracks which step ran last and refuses to
//! update without a fresh innovation and gain.

use std::fmt::{self, Debug};

use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::linalg::{spd_inverse, symmetrize};

/// Form of the covariance measurement update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceUpdate {
    /// `P = (I - K H) P`
    #[default]
    Standard,
    /// `P = (I - K H) P (I - K H)^T + K R K^T`, robust to a suboptimal gain
    Joseph,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    Innovated,
    Gained,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Innovated => "innovation",
            Stage::Gained => "gain",
        }
    }
}

/// EKF engine parameterized by state size `N`, input size `U` and measurement size `M`.
#[derive(Clone)]
pub struct ExtendedKalmanFilter<const N: usize, const U: usize, const M: usize> {
    /// Innovation `y = z - h`
    innovation: SVector<f64, M>,
    /// Innovation covariance `S = H P H^T + R`
    innovation_covariance: SMatrix<f64, M, M>,
    /// Measurement noise of the pending correction
    measurement_noise: SMatrix<f64, M, M>,
    /// Kalman gain `K = P H^T S^-1`
    gain: SMatrix<f64, N, M>,
    covariance_update: CovarianceUpdate,
    stage: Stage,
}

impl<const N: usize, const U: usize, const M: usize> Debug for ExtendedKalmanFilter<N, U, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EKF")
            .field("state_size", &N)
            .field("input_size", &U)
            .field("measurement_size", &M)
            .field("innovation", &self.innovation)
            .field("innovation_covariance", &self.innovation_covariance)
            .field("covariance_update", &self.covariance_update)
            .field("stage", &self.stage)
            .finish()
    }
}

impl<const N: usize, const U: usize, const M: usize> Default for ExtendedKalmanFilter<N, U, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const U: usize, const M: usize> ExtendedKalmanFilter<N, U, M> {
    pub const STATE_SIZE: usize = N;
    pub const INPUT_SIZE: usize = U;
    pub const MEASUREMENT_SIZE: usize = M;

    pub fn new() -> Self {
        ExtendedKalmanFilter {
            innovation: SVector::zeros(),
            innovation_covariance: SMatrix::zeros(),
            measurement_noise: SMatrix::zeros(),
            gain: SMatrix::zeros(),
            covariance_update: CovarianceUpdate::default(),
            stage: Stage::Idle,
        }
    }

    pub fn with_covariance_update(mut self, form: CovarianceUpdate) -> Self {
        self.covariance_update = form;
        self
    }

    pub fn set_covariance_update(&mut self, form: CovarianceUpdate) {
        self.covariance_update = form;
    }

    pub fn covariance_update(&self) -> CovarianceUpdate {
        self.covariance_update
    }

    /// Prediction step.
    ///
    /// Sets `state ← f` and `covariance ← J_F P J_Fᵀ + Q`. Any pending correction is abandoned.
    ///
    /// # Arguments
    /// * `state` - state estimate, overwritten with `f`
    /// * `covariance` - state covariance, propagated in place
    /// * `f` - result of the nonlinear propagation, computed by the caller
    /// * `j_f` - transition Jacobian evaluated at the pre-step state
    /// * `q` - process noise, already expressed in the filter frame
    pub fn prediction(
        &mut self,
        state: &mut SVector<f64, N>,
        covariance: &mut SMatrix<f64, N, N>,
        f: &SVector<f64, N>,
        j_f: &SMatrix<f64, N, N>,
        q: &SMatrix<f64, N, N>,
    ) {
        *state = *f;
        *covariance = symmetrize(&(j_f * *covariance * j_f.transpose() + q));
        self.stage = Stage::Idle;
    }

    /// Innovation step: `y = z - h`, `S = J_H P J_Hᵀ + R`.
    ///
    /// Must run before any gating decision.
    pub fn innovation(
        &mut self,
        covariance: &SMatrix<f64, N, N>,
        z: &SVector<f64, M>,
        h: &SVector<f64, M>,
        j_h: &SMatrix<f64, M, N>,
        r: &SMatrix<f64, M, M>,
    ) {
        self.innovation = z - h;
        self.innovation_covariance = symmetrize(&(j_h * covariance * j_h.transpose() + r));
        self.measurement_noise = *r;
        self.stage = Stage::Innovated;
    }

    /// Gain step: `K = P J_Hᵀ S⁻¹`.
    ///
    /// Fails with [`FilterError::SingularMatrix`] if `S` is singular, with
    /// [`FilterError::InvalidCovariance`] if it is indefinite, and with
    /// [`FilterError::OutOfOrder`] if no innovation is pending.
    pub fn gain(
        &mut self,
        covariance: &SMatrix<f64, N, N>,
        j_h: &SMatrix<f64, M, N>,
    ) -> Result<()> {
        self.expect_stage(Stage::Innovated)?;
        let s_inv = spd_inverse(&self.innovation_covariance, "innovation covariance (gain)")?;
        self.gain = covariance * j_h.transpose() * s_inv;
        self.stage = Stage::Gained;
        Ok(())
    }

    /// Update step: `x ← x + K y`, `P ← (I − K J_H) P` (or the Joseph form).
    ///
    /// Only valid after [`Self::gain`]; the caller is responsible for having gated the
    /// innovation first.
    pub fn update(
        &mut self,
        state: &mut SVector<f64, N>,
        covariance: &mut SMatrix<f64, N, N>,
        j_h: &SMatrix<f64, M, N>,
    ) -> Result<()> {
        self.expect_stage(Stage::Gained)?;
        *state += self.gain * self.innovation;
        let i_kh = SMatrix::<f64, N, N>::identity() - self.gain * j_h;
        let updated = match self.covariance_update {
            CovarianceUpdate::Standard => i_kh * *covariance,
            CovarianceUpdate::Joseph => {
                i_kh * *covariance * i_kh.transpose()
                    + self.gain * self.measurement_noise * self.gain.transpose()
            }
        };
        *covariance = symmetrize(&updated);
        self.stage = Stage::Idle;
        Ok(())
    }

    /// Drop a pending correction (rejected observation or failed gain).
    pub fn discard(&mut self) {
        self.stage = Stage::Idle;
    }

    pub fn last_innovation(&self) -> &SVector<f64, M> {
        &self.innovation
    }

    pub fn last_innovation_covariance(&self) -> &SMatrix<f64, M, M> {
        &self.innovation_covariance
    }

    pub fn last_gain(&self) -> &SMatrix<f64, N, M> {
        &self.gain
    }

    fn expect_stage(&self, expected: Stage) -> Result<()> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(FilterError::OutOfOrder {
                expected: expected.name(),
                found: self.stage.name(),
            })
        }
    }
}
