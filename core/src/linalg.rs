//! Linear algebra helpers for fixed-size covariance handling.
//!
//! Public API:
//!     pub fn symmetrize(m) -> SMatrix
//!     pub fn spd_inverse(a, context) -> Result<SMatrix>
//!     pub fn min_eigenvalue(m) -> f64
//!     pub fn validate_covariance(m, name) -> Result<()>
//!     pub fn ensure_finite(v, name) -> Result<()>
//!
//! Strategy for inversion:
//! 1) Symmetrize A ← 0.5 (A + Aᵀ)
//! 2) Cholesky; A must be positive definite
//! 3) Indefinite A is reported as [`FilterError::InvalidCovariance`]
//! 4) Positive semi-definite but singular A is reported as [`FilterError::SingularMatrix`]
//!
//! There is no jitter ramp: a singular innovation covariance is surfaced to the caller.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, SMatrix, SVector};

use crate::error::{FilterError, Result};

/// Relative tolerance used when checking a covariance for symmetry.
pub const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Reduces the round-off asymmetry that accumulates in covariance propagation.
#[inline]
pub fn symmetrize<const D: usize>(m: &SMatrix<f64, D, D>) -> SMatrix<f64, D, D> {
    0.5 * (m + m.transpose())
}

/// Invert a symmetric (ideally positive definite) matrix.
///
/// # Arguments
/// * `a` - the matrix to invert, typically an innovation covariance `S = H P Hᵀ + R`
/// * `context` - what is being inverted, carried in the error for diagnostics
///
/// # Returns
/// The inverse of the symmetrized matrix. When the Cholesky factorization fails, the error is
/// [`FilterError::InvalidCovariance`] if the matrix has a negative eigenvalue and
/// [`FilterError::SingularMatrix`] otherwise.
pub fn spd_inverse<const D: usize>(
    a: &SMatrix<f64, D, D>,
    context: &'static str,
) -> Result<SMatrix<f64, D, D>> {
    if a.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::NonFinite { name: context });
    }
    let a_sym = symmetrize(a);

    if let Some(ch) = Cholesky::new(a_sym) {
        let inv = ch.inverse();
        if inv.iter().all(|v| v.is_finite()) {
            return Ok(inv);
        }
    }

    let smallest = min_eigenvalue(&a_sym);
    if smallest < -SYMMETRY_TOLERANCE * a_sym.amax().max(1.0) {
        return Err(FilterError::InvalidCovariance {
            name: context,
            reason: format!("not positive definite, min eigenvalue {:e}", smallest),
        });
    }
    Err(FilterError::SingularMatrix { context })
}

/// Smallest eigenvalue of a symmetric matrix.
pub fn min_eigenvalue<const D: usize>(m: &SMatrix<f64, D, D>) -> f64 {
    DMatrix::from_column_slice(D, D, m.as_slice())
        .symmetric_eigenvalues()
        .min()
}

/// Check that a covariance-like matrix is finite, symmetric and positive semi-definite.
pub fn validate_covariance<const D: usize>(
    m: &SMatrix<f64, D, D>,
    name: &'static str,
) -> Result<()> {
    if m.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::NonFinite { name });
    }
    let scale = m.amax().max(1.0);
    for i in 0..D {
        if m[(i, i)] < 0.0 {
            return Err(FilterError::InvalidCovariance {
                name,
                reason: format!("negative variance {} at index {}", m[(i, i)], i),
            });
        }
        for j in (i + 1)..D {
            if (m[(i, j)] - m[(j, i)]).abs() > SYMMETRY_TOLERANCE * scale {
                return Err(FilterError::InvalidCovariance {
                    name,
                    reason: format!("not symmetric at ({}, {})", i, j),
                });
            }
        }
    }
    let smallest = min_eigenvalue(&symmetrize(m));
    if smallest < -SYMMETRY_TOLERANCE * scale {
        return Err(FilterError::InvalidCovariance {
            name,
            reason: format!("not positive semi-definite, min eigenvalue {:e}", smallest),
        });
    }
    Ok(())
}

/// Reject vectors containing NaN or infinite entries.
#[inline]
pub fn ensure_finite<const D: usize>(v: &SVector<f64, D>, name: &'static str) -> Result<()> {
    if v.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(FilterError::NonFinite { name })
    }
}

/* =============================== Tests ==================================== */
