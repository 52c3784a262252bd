use crate::config::ConfigError;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Regression scores. The `Neg*` variants return the negated error so that
/// larger is always better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ExplainedVariance,
    NegMeanAbsoluteError,
    NegMeanSquaredError,
    NegMeanSquaredLogError,
    NegMedianAbsoluteError,
    R2,
}

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("Cannot score {n_pred} predictions against {n_true} observed values.")]
    LengthMismatch { n_true: usize, n_pred: usize },

    #[error("Cannot score an empty set of predictions.")]
    Empty,

    #[error("Mean squared logarithmic error cannot be used when targets or predictions are negative.")]
    NegativeValues,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::ExplainedVariance,
        Metric::NegMeanAbsoluteError,
        Metric::NegMeanSquaredError,
        Metric::NegMeanSquaredLogError,
        Metric::NegMedianAbsoluteError,
        Metric::R2,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::ExplainedVariance => "explained_variance",
            Metric::NegMeanAbsoluteError => "neg_mean_absolute_error",
            Metric::NegMeanSquaredError => "neg_mean_squared_error",
            Metric::NegMeanSquaredLogError => "neg_mean_squared_log_error",
            Metric::NegMedianAbsoluteError => "neg_median_absolute_error",
            Metric::R2 => "r2",
        }
    }

    /// Scores `y_pred` against `y_true`.
    pub fn evaluate(
        &self,
        y_true: ArrayView1<f64>,
        y_pred: ArrayView1<f64>,
    ) -> Result<f64, MetricError> {
        if y_true.len() != y_pred.len() {
            return Err(MetricError::LengthMismatch {
                n_true: y_true.len(),
                n_pred: y_pred.len(),
            });
        }
        if y_true.is_empty() {
            return Err(MetricError::Empty);
        }

        let residuals = &y_true - &y_pred;
        let n = y_true.len() as f64;

        let score = match self {
            Metric::ExplainedVariance => {
                let residual_mean = residuals.sum() / n;
                let numerator = residuals.mapv(|r| (r - residual_mean).powi(2)).sum() / n;
                let denominator = y_true.var(0.0);
                internal::one_minus_ratio(numerator, denominator)
            }
            Metric::NegMeanAbsoluteError => -residuals.mapv(f64::abs).sum() / n,
            Metric::NegMeanSquaredError => -residuals.mapv(|r| r * r).sum() / n,
            Metric::NegMeanSquaredLogError => {
                if y_true.iter().chain(y_pred.iter()).any(|&v| v < 0.0) {
                    return Err(MetricError::NegativeValues);
                }
                let sum: f64 = y_true
                    .iter()
                    .zip(y_pred.iter())
                    .map(|(t, p)| (t.ln_1p() - p.ln_1p()).powi(2))
                    .sum();
                -sum / n
            }
            Metric::NegMedianAbsoluteError => {
                let mut abs: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
                -internal::median(&mut abs)
            }
            Metric::R2 => {
                let ss_res = residuals.mapv(|r| r * r).sum();
                let mean = y_true.sum() / n;
                let ss_tot = y_true.mapv(|v| (v - mean).powi(2)).sum();
                internal::one_minus_ratio(ss_res, ss_tot)
            }
        };
        Ok(score)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Metric::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or(ConfigError::UnknownMetric(wanted))
    }
}

mod internal {
    /// `1 - numerator / denominator`, with a constant target scoring 1.0 when
    /// the fit is perfect and 0.0 otherwise.
    pub(super) fn one_minus_ratio(numerator: f64, denominator: f64) -> f64 {
        if denominator == 0.0 {
            if numerator == 0.0 { 1.0 } else { 0.0 }
        } else {
            1.0 - numerator / denominator
        }
    }

    pub(super) fn median(values: &mut [f64]) -> f64 {
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            0.5 * (values[mid - 1] + values[mid])
        } else {
            values[mid]
        }
    }
}
