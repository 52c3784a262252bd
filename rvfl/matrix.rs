//! Dense matrix helpers shared by the feature pipeline and the estimators.

use ndarray::{Array1, Array2, ArrayView2, Axis, ShapeError, concatenate};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, EigValsh, Norm, SVD, UPLO};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Linear algebra backend failed: {0}")]
    Linalg(#[from] LinalgError),

    #[error("SVD did not return the right singular vectors.")]
    MissingSingularVectors,

    #[error("Nearest positive-definite projection did not converge after {iterations} diagonal shifts.")]
    ProjectionDidNotConverge { iterations: usize },
}

/// Horizontal concatenation `[a | b]`.
pub fn cbind(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, ShapeError> {
    concatenate(Axis(1), &[a.view(), b.view()])
}

/// Vertical concatenation of `a` above `b`.
pub fn rbind(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, ShapeError> {
    concatenate(Axis(0), &[a.view(), b.view()])
}

/// `Xᵗ X`
pub fn crossprod(x: ArrayView2<f64>) -> Array2<f64> {
    x.t().dot(&x)
}

/// `X Xᵗ`
pub fn tcrossprod(x: ArrayView2<f64>) -> Array2<f64> {
    x.dot(&x.t())
}

/// Indicator encoding of cluster labels. Each row has exactly one 1.0, in the
/// column of its label. Labels outside `0..n_classes` produce an all-zero row.
pub fn one_hot(labels: &[usize], n_classes: usize) -> Array2<f64> {
    let mut encoded = Array2::zeros((labels.len(), n_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label < n_classes {
            encoded[[row, label]] = 1.0;
        }
    }
    encoded
}

/// `(A + Aᵗ) / 2`
pub fn symmetrize(a: ArrayView2<f64>) -> Array2<f64> {
    (&a + &a.t()) * 0.5
}

/// Positive-definiteness test via an attempted Cholesky factorization.
pub fn is_positive_definite(a: ArrayView2<f64>) -> bool {
    a.cholesky(UPLO::Lower).is_ok()
}

/// Singular values below this are treated as exact zeros.
const SINGULAR_VALUE_FLOOR: f64 = 1e-12;

/// Condition number of a matrix from its singular values.
///
/// # Returns
/// * `Ok(max_sv / min_sv)` for a well-posed matrix.
/// * `Ok(f64::INFINITY)` if the matrix is empty or effectively singular
///   (smallest singular value below 1e-12).
pub fn condition_number(a: ArrayView2<f64>) -> Result<f64, MatrixError> {
    let (_, s, _) = a.svd(false, false)?;
    let max_sv = s.iter().fold(0.0_f64, |max, &val| max.max(val));
    let min_sv = s.iter().fold(f64::INFINITY, |min, &val| min.min(val));
    if !min_sv.is_finite() || min_sv < SINGULAR_VALUE_FLOOR {
        return Ok(f64::INFINITY);
    }
    Ok(max_sv / min_sv)
}

/// Maximum number of diagonal shifts attempted by [`nearest_spd`].
const MAX_SPD_SHIFTS: usize = 100;

/// Projects a square matrix onto the nearest symmetric positive-definite matrix.
///
/// This follows Higham's construction: the symmetric part `B` is replaced by
/// `(B + H) / 2` where `H` is the symmetric polar factor of `B`. Floating-point
/// error can leave the result marginally indefinite, in which case the diagonal
/// is shifted by a growing multiple of the most negative eigenvalue until a
/// Cholesky factorization succeeds.
///
/// Matrices that are already positive definite are returned symmetrized but
/// otherwise unchanged.
pub fn nearest_spd(a: ArrayView2<f64>) -> Result<Array2<f64>, MatrixError> {
    let b = symmetrize(a);
    if is_positive_definite(b.view()) {
        return Ok(b);
    }

    let (_, singular_values, vt) = b.svd(false, true)?;
    let vt = vt.ok_or(MatrixError::MissingSingularVectors)?;
    // H = V Σ Vᵗ
    let scaled_vt = &vt * &singular_values.view().insert_axis(Axis(1));
    let h = vt.t().dot(&scaled_vt);
    let mut candidate = symmetrize(((&b + &h) * 0.5).view());

    if is_positive_definite(candidate.view()) {
        return Ok(candidate);
    }

    let spacing = f64::EPSILON * a.norm_l2().max(f64::MIN_POSITIVE);
    let identity = Array2::<f64>::eye(candidate.nrows());
    for k in 1..=MAX_SPD_SHIFTS {
        let eigenvalues: Array1<f64> = candidate.eigvalsh(UPLO::Lower)?;
        let min_eig = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
        let shift = -min_eig * (k * k) as f64 + spacing;
        candidate = &candidate + &(&identity * shift);
        if is_positive_definite(candidate.view()) {
            return Ok(candidate);
        }
    }

    Err(MatrixError::ProjectionDidNotConverge {
        iterations: MAX_SPD_SHIFTS,
    })
}

/// Smallest eigenvalue of a symmetric matrix.
pub fn min_eigenvalue(a: ArrayView2<f64>) -> Result<f64, MatrixError> {
    let eigenvalues = a.eigvalsh(UPLO::Lower)?;
    Ok(eigenvalues.iter().copied().fold(f64::INFINITY, f64::min))
}
