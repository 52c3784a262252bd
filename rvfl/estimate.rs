//! # Output-Layer Estimation
//!
//! Fits the linear output layer on a cooked design matrix `Z` and a centered
//! target `y`. Three estimators are provided:
//!
//! - **Least squares**: SVD-based, tolerant of rank deficiency.
//! - **Bayesian ridge**: isotropic Gaussian prior `β ~ N(0, s² I)` with noise
//!   variance `σ²`. The ridge penalty is `λ = σ² / s²`.
//! - **Generalized Bayesian ridge**: block-diagonal prior with variance `s1²`
//!   on the direct-link and cluster columns and `s2²` on the hidden columns.
//!
//! The Bayesian estimators also return the posterior covariance of `β`, which
//! drives the predictive standard deviation `sqrt(diag(Z* Σ Z*ᵗ) + σ²)`.

use crate::config::{ConfigError, require_positive};
use crate::matrix::{
    MatrixError, condition_number, crossprod, is_positive_definite, nearest_spd, symmetrize,
};
use crate::pipeline::DesignLayout;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Inverse, InverseC, LeastSquaresSvd};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Systems whose condition number exceeds this are rejected as numerically singular.
const MAX_CONDITION_NUMBER: f64 = 1.0 / f64::EPSILON;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorConfig {
    LeastSquares,
    BayesianRidge {
        /// Prior standard deviation of every coefficient.
        s: f64,
        /// Noise standard deviation.
        sigma: f64,
    },
    GeneralizedBayesianRidge {
        /// Prior standard deviation of the direct-link and cluster coefficients.
        s1: f64,
        /// Prior standard deviation of the hidden-layer coefficients.
        s2: f64,
        sigma: f64,
        /// Compute the posterior covariance and predictive standard deviations.
        return_std: bool,
    },
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig::GeneralizedBayesianRidge {
            s1: 0.1,
            s2: 0.1,
            sigma: 0.05,
            return_std: true,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            EstimatorConfig::LeastSquares => Ok(()),
            EstimatorConfig::BayesianRidge { s, sigma } => {
                require_positive("s", s)?;
                require_non_negative("sigma", sigma)
            }
            EstimatorConfig::GeneralizedBayesianRidge { s1, s2, sigma, .. } => {
                require_positive("s1", s1)?;
                require_positive("s2", s2)?;
                require_non_negative("sigma", sigma)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EstimatorConfig::LeastSquares => "least squares",
            EstimatorConfig::BayesianRidge { .. } => "Bayesian ridge",
            EstimatorConfig::GeneralizedBayesianRidge { .. } => "generalized Bayesian ridge",
        }
    }
}

fn require_non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidParameter {
            name,
            value,
            reason: "must be finite and non-negative",
        });
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("A linear system solve failed. The regularized Gram matrix may be singular. Error: {0}")]
    LinearSystemSolveFailed(LinalgError),

    #[error(
        "The output-layer system is ill-conditioned (condition number {condition_number:.3e}). Increase the prior noise or reduce collinear features."
    )]
    ModelIsIllConditioned { condition_number: f64 },

    #[error("The fitted {0} contains NaN or infinite values.")]
    NonFiniteSolution(&'static str),

    #[error("Design matrix has {n_rows} rows but the target has {n_targets} entries.")]
    TargetLengthMismatch { n_rows: usize, n_targets: usize },

    #[error("Design matrix has {found} columns, but the layout describes {expected}.")]
    LayoutMismatch { found: usize, expected: usize },

    #[error("Design matrix has {found} columns, but the coefficients were fitted on {expected}.")]
    DimensionMismatch { found: usize, expected: usize },

    #[error("Posterior covariance repair failed: {0}")]
    CovarianceRepairFailed(#[from] MatrixError),
}

/// A fitted output layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub beta: Array1<f64>,
    /// Posterior covariance of `beta`, held by the Bayesian estimators.
    pub posterior_covariance: Option<Array2<f64>>,
    /// Noise standard deviation added to the predictive variance.
    pub sigma: f64,
    /// Trace of the hat matrix: the effective number of parameters.
    pub effective_dof: f64,
    /// Generalized cross-validation score, `(RSS/n) / (1 - tr(H)/n)²`.
    pub gcv: f64,
}

/// Output-layer predictions on the centered target scale.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearPrediction {
    pub mean: Array1<f64>,
    pub std: Option<Array1<f64>>,
}

impl LinearFit {
    /// Predicts from a design matrix built with the same pipeline state.
    pub fn predict(&self, z: ArrayView2<f64>) -> Result<LinearPrediction, EstimationError> {
        if z.ncols() != self.beta.len() {
            return Err(EstimationError::DimensionMismatch {
                found: z.ncols(),
                expected: self.beta.len(),
            });
        }
        let mean = z.dot(&self.beta);
        let std = self
            .posterior_covariance
            .as_ref()
            .map(|cov| internal::predictive_std(z, cov.view(), self.sigma));
        Ok(LinearPrediction { mean, std })
    }
}

/// Fits the configured estimator.
///
/// # Arguments
///
/// * `config`: The estimator and its hyperparameters.
/// * `z`: Scaled design matrix, shape `[n_samples, layout.n_columns()]`.
/// * `y`: Centered target.
/// * `layout`: Column blocks of `z`, used to assemble the block prior.
pub fn fit_output_layer(
    config: &EstimatorConfig,
    z: ArrayView2<f64>,
    y: ArrayView1<f64>,
    layout: &DesignLayout,
) -> Result<LinearFit, EstimationError> {
    if z.nrows() != y.len() {
        return Err(EstimationError::TargetLengthMismatch {
            n_rows: z.nrows(),
            n_targets: y.len(),
        });
    }
    if z.ncols() != layout.n_columns() {
        return Err(EstimationError::LayoutMismatch {
            found: z.ncols(),
            expected: layout.n_columns(),
        });
    }

    let fit = match *config {
        EstimatorConfig::LeastSquares => fit_least_squares(z, y)?,
        EstimatorConfig::BayesianRidge { s, sigma } => fit_bayesian_ridge(z, y, s, sigma)?,
        EstimatorConfig::GeneralizedBayesianRidge {
            s1,
            s2,
            sigma,
            return_std,
        } => {
            let prior = block_prior_variances(layout, s1, s2);
            fit_generalized_bayesian_ridge(z, y, prior.view(), sigma, return_std)?
        }
    };

    log::debug!(
        "{} fit: {} coefficients, effective dof {:.4}, GCV {:.6e}",
        config.name(),
        fit.beta.len(),
        fit.effective_dof,
        fit.gcv
    );
    Ok(fit)
}

/// Diagonal of the block prior covariance: `s1²` on the direct block,
/// `s2²` on the hidden block.
pub fn block_prior_variances(layout: &DesignLayout, s1: f64, s2: f64) -> Array1<f64> {
    let mut prior = Array1::from_elem(layout.n_columns(), s2 * s2);
    prior
        .slice_mut(ndarray::s![..layout.n_direct])
        .fill(s1 * s1);
    prior
}

/// Ordinary least squares through the SVD. Rank-deficient designs are solved
/// in the minimum-norm sense and their numerical rank is used as `tr(H)`.
pub fn fit_least_squares(
    z: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<LinearFit, EstimationError> {
    let result = z
        .least_squares(&y)
        .map_err(EstimationError::LinearSystemSolveFailed)?;
    let beta = result.solution;
    internal::ensure_finite_vector(beta.view(), "least-squares coefficients")?;

    let effective_dof = result.rank as f64;
    let gcv = internal::gcv(z, y, beta.view(), effective_dof);
    log::debug!("Least squares: numerical rank {} of {}", result.rank, z.ncols());

    Ok(LinearFit {
        beta,
        posterior_covariance: None,
        sigma: 0.0,
        effective_dof,
        gcv,
    })
}

/// Bayesian ridge regression with an isotropic prior.
///
/// `Cₙ = (ZᵗZ + λI)⁻¹` with `λ = σ²/s²`, `β = Cₙ Zᵗ y`, and posterior
/// covariance `Σ = s² (I − Cₙ ZᵗZ)`.
pub fn fit_bayesian_ridge(
    z: ArrayView2<f64>,
    y: ArrayView1<f64>,
    s: f64,
    sigma: f64,
) -> Result<LinearFit, EstimationError> {
    let p = z.ncols();
    let lambda = (sigma * sigma) / (s * s);
    let gram = crossprod(z);
    let identity = Array2::<f64>::eye(p);
    let system = &gram + &(&identity * lambda);

    internal::check_conditioning(system.view())?;
    let cn = system
        .invc()
        .map_err(EstimationError::LinearSystemSolveFailed)?;

    let beta = cn.dot(&z.t().dot(&y));
    internal::ensure_finite_vector(beta.view(), "Bayesian ridge coefficients")?;

    let cn_gram = cn.dot(&gram);
    let covariance = (&identity - &cn_gram) * (s * s);
    let covariance = internal::ensure_spd(covariance)?;

    let effective_dof = cn_gram.diag().sum();
    let gcv = internal::gcv(z, y, beta.view(), effective_dof);

    Ok(LinearFit {
        beta,
        posterior_covariance: Some(covariance),
        sigma,
        effective_dof,
        gcv,
    })
}

/// Bayesian ridge regression with a diagonal (block) prior covariance.
///
/// With `Σ₀ = diag(prior_variances)`:
/// `Cₙ = (Σ₀ ZᵗZ + σ² I)⁻¹`, `β = Cₙ Σ₀ Zᵗ y`, and
/// `Σ = Σ₀ − Cₙ Σ₀ ZᵗZ Σ₀`.
///
/// The system is not symmetric, so it is inverted through an LU factorization.
pub fn fit_generalized_bayesian_ridge(
    z: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior_variances: ArrayView1<f64>,
    sigma: f64,
    return_std: bool,
) -> Result<LinearFit, EstimationError> {
    let p = z.ncols();
    let gram = crossprod(z);
    let prior_col = prior_variances.insert_axis(Axis(1));
    // Σ₀ ZᵗZ scales row i of the Gram matrix by the i-th prior variance.
    let prior_gram = &gram * &prior_col;
    let system = &prior_gram + &(Array2::<f64>::eye(p) * (sigma * sigma));

    internal::check_conditioning(system.view())?;
    let cn = system
        .inv()
        .map_err(EstimationError::LinearSystemSolveFailed)?;

    // temp = Cₙ Σ₀ Zᵗ, shape [p, n]
    let prior_zt = &z.t() * &prior_col;
    let temp = cn.dot(&prior_zt);
    let beta = temp.dot(&y);
    internal::ensure_finite_vector(beta.view(), "generalized Bayesian ridge coefficients")?;

    // tr(H) = tr(Z temp) = sum of temp ∘ Zᵗ
    let effective_dof = (&temp * &z.t()).sum();
    let gcv = internal::gcv(z, y, beta.view(), effective_dof);

    let posterior_covariance = if return_std {
        // Σ₀ ZᵗZ Σ₀ scales columns of prior_gram by the prior variances.
        let prior_gram_prior = &prior_gram * &prior_variances;
        let mut covariance = -cn.dot(&prior_gram_prior);
        for (i, &v) in prior_variances.iter().enumerate() {
            covariance[[i, i]] += v;
        }
        Some(internal::ensure_spd(covariance)?)
    } else {
        None
    };

    Ok(LinearFit {
        beta,
        posterior_covariance,
        sigma,
        effective_dof,
        gcv,
    })
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    pub(super) fn check_conditioning(system: ArrayView2<f64>) -> Result<(), EstimationError> {
        let condition = condition_number(system)?;
        log::debug!("Output-layer system condition number: {condition:.3e}");
        if !condition.is_finite() || condition > MAX_CONDITION_NUMBER {
            return Err(EstimationError::ModelIsIllConditioned {
                condition_number: condition,
            });
        }
        Ok(())
    }

    pub(super) fn ensure_finite_vector(
        v: ArrayView1<f64>,
        what: &'static str,
    ) -> Result<(), EstimationError> {
        if v.iter().all(|x| x.is_finite()) {
            Ok(())
        } else {
            Err(EstimationError::NonFiniteSolution(what))
        }
    }

    /// Symmetrizes a posterior covariance and, when round-off has left it
    /// indefinite, replaces it by its nearest SPD matrix.
    pub(super) fn ensure_spd(covariance: Array2<f64>) -> Result<Array2<f64>, EstimationError> {
        if !covariance.iter().all(|x| x.is_finite()) {
            return Err(EstimationError::NonFiniteSolution("posterior covariance"));
        }
        let symmetric = symmetrize(covariance.view());
        if is_positive_definite(symmetric.view()) {
            return Ok(symmetric);
        }
        log::warn!(
            "Posterior covariance ({}x{}) failed the Cholesky check; projecting onto the nearest SPD matrix.",
            symmetric.nrows(),
            symmetric.ncols()
        );
        Ok(nearest_spd(symmetric.view())?)
    }

    pub(super) fn gcv(
        z: ArrayView2<f64>,
        y: ArrayView1<f64>,
        beta: ArrayView1<f64>,
        effective_dof: f64,
    ) -> f64 {
        let n = y.len() as f64;
        let residuals = &y - &z.dot(&beta);
        let rss = residuals.dot(&residuals);
        let denominator = 1.0 - effective_dof / n;
        if denominator <= 0.0 {
            return f64::INFINITY;
        }
        (rss / n) / (denominator * denominator)
    }

    /// `sqrt(diag(Z Σ Zᵗ) + σ²)` without forming the `n x n` product.
    pub(super) fn predictive_std(
        z: ArrayView2<f64>,
        covariance: ArrayView2<f64>,
        sigma: f64,
    ) -> Array1<f64> {
        let z_cov = z.dot(&covariance);
        (&z_cov * &z)
            .sum_axis(Axis(1))
            .mapv(|v| (v.max(0.0) + sigma * sigma).sqrt())
    }
}
