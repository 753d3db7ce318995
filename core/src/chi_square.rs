//! Chi-square (Mahalanobis) gating of filter innovations
//!
//! An innovation `y` with covariance `S` is normally distributed with zero mean when the filter
//! is consistent, so the normalized squared distance
//!
//! $$
//! d^2 = y^T S^{-1} y
//! $$
//!
//! follows a chi-square distribution with as many degrees of freedom as the measurement has
//! components. Observations whose $d^2$ exceeds the critical value for a chosen confidence level
//! are treated as outliers and discarded.
//!
//! The gate is stateless. Which critical value applies to a measurement stream is chosen with a
//! [`RejectionThreshold`], one per stream.

use std::fmt::{self, Display};

use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::linalg::spd_inverse;

/// Chi-square critical value, 1 degree of freedom, 95% confidence
pub const THRESHOLD_1D_95: f64 = 3.841;
/// Chi-square critical value, 1 degree of freedom, 99% confidence
pub const THRESHOLD_1D_99: f64 = 6.635;
/// Chi-square critical value, 2 degrees of freedom, 95% confidence
pub const THRESHOLD_2D_95: f64 = 5.991;
/// Chi-square critical value, 2 degrees of freedom, 99% confidence
pub const THRESHOLD_2D_99: f64 = 9.210;
/// Chi-square critical value, 3 degrees of freedom, 95% confidence
pub const THRESHOLD_3D_95: f64 = 7.815;
/// Chi-square critical value, 3 degrees of freedom, 99% confidence
pub const THRESHOLD_3D_99: f64 = 11.345;

/// 95% critical values indexed by `degrees_of_freedom - 1`
const CRITICAL_95: [f64; 6] = [
    THRESHOLD_1D_95,
    THRESHOLD_2D_95,
    THRESHOLD_3D_95,
    9.488,
    11.070,
    12.592,
];
/// 99% critical values indexed by `degrees_of_freedom - 1`
const CRITICAL_99: [f64; 6] = [
    THRESHOLD_1D_99,
    THRESHOLD_2D_99,
    THRESHOLD_3D_99,
    13.277,
    15.086,
    16.812,
];

/// Largest measurement dimension the critical value table covers
pub const MAX_DEGREES_OF_FREEDOM: usize = CRITICAL_95.len();

/// Per-stream outlier rejection setting.
///
/// `None` skips gating entirely: the observation is always accepted. This is an explicit escape
/// hatch for streams that are trusted (or not yet tuned), not a numerical fallback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionThreshold {
    #[default]
    None,
    Confidence95,
    Confidence99,
}

impl Display for RejectionThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionThreshold::None => write!(f, "no gating"),
            RejectionThreshold::Confidence95 => write!(f, "95% confidence"),
            RejectionThreshold::Confidence99 => write!(f, "99% confidence"),
        }
    }
}

impl RejectionThreshold {
    /// Critical value for a measurement with `degrees_of_freedom` components.
    ///
    /// # Returns
    /// * `Ok(None)` when gating is disabled
    /// * `Ok(Some(value))` with the chi-square critical value
    /// * `Err` when the table has no entry for the requested degrees of freedom
    pub fn critical_value(&self, degrees_of_freedom: usize) -> Result<Option<f64>> {
        let table = match self {
            RejectionThreshold::None => return Ok(None),
            RejectionThreshold::Confidence95 => &CRITICAL_95,
            RejectionThreshold::Confidence99 => &CRITICAL_99,
        };
        if degrees_of_freedom == 0 || degrees_of_freedom > MAX_DEGREES_OF_FREEDOM {
            return Err(FilterError::DimensionMismatch {
                name: "chi-square degrees of freedom",
                expected: format!("1..={}", MAX_DEGREES_OF_FREEDOM),
                found: degrees_of_freedom,
            });
        }
        Ok(Some(table[degrees_of_freedom - 1]))
    }
}

/// Outcome of evaluating one innovation against the gate
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateDecision {
    /// Squared Mahalanobis distance of the innovation
    pub statistic: f64,
    /// Critical value applied, `None` when gating was skipped
    pub threshold: Option<f64>,
    /// Whether the observation must be discarded
    pub rejected: bool,
}

/// Squared Mahalanobis distance `yᵀ S⁻¹ y`.
///
/// Fails with [`FilterError::SingularMatrix`] when `S` is singular and with
/// [`FilterError::InvalidCovariance`] when it is indefinite.
pub fn mahalanobis_squared<const M: usize>(
    innovation: &SVector<f64, M>,
    innovation_covariance: &SMatrix<f64, M, M>,
) -> Result<f64> {
    let s_inv = spd_inverse(innovation_covariance, "innovation covariance (gate)")?;
    Ok((innovation.transpose() * s_inv * innovation)[(0, 0)])
}

/// Returns true (reject) iff `yᵀ S⁻¹ y > threshold`.
pub fn rejects<const M: usize>(
    innovation: &SVector<f64, M>,
    innovation_covariance: &SMatrix<f64, M, M>,
    threshold: f64,
) -> Result<bool> {
    Ok(mahalanobis_squared(innovation, innovation_covariance)? > threshold)
}

/// Run the full gate for a stream configured with `setting`.
///
/// When the setting disables gating the statistic is not computed (reported as NaN) and the
/// observation is accepted without touching `S`; singularity then surfaces later in the gain.
pub fn evaluate<const M: usize>(
    innovation: &SVector<f64, M>,
    innovation_covariance: &SMatrix<f64, M, M>,
    setting: RejectionThreshold,
) -> Result<GateDecision> {
    match setting.critical_value(M)? {
        None => Ok(GateDecision {
            statistic: f64::NAN,
            threshold: None,
            rejected: false,
        }),
        Some(threshold) => {
            let statistic = mahalanobis_squared(innovation, innovation_covariance)?;
            Ok(GateDecision {
                statistic,
                threshold: Some(threshold),
                rejected: statistic > threshold,
            })
        }
    }
}
