use crate::config::ConfigError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Columns whose spread falls below this threshold are treated as constant and
/// left unscaled.
const CONSTANT_COLUMN_TOLERANCE: f64 = 10.0 * f64::EPSILON;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMethod {
    /// Zero mean, unit (population) standard deviation per column.
    Standard,
    /// Per-column affine map onto `[0, 1]` over the training range.
    MinMax,
}

impl fmt::Display for ScalingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingMethod::Standard => f.write_str("standard"),
            ScalingMethod::MinMax => f.write_str("minmax"),
        }
    }
}

impl FromStr for ScalingMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "std" | "standard" => Ok(ScalingMethod::Standard),
            "minmax" | "min-max" => Ok(ScalingMethod::MinMax),
            other => Err(ConfigError::UnknownScalingMethod(other.to_string())),
        }
    }
}

/// The three independent scalers of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Applied to the design block entering the output layer.
    pub output: ScalingMethod,
    /// Applied to the (possibly cluster-augmented) inputs before the hidden projection.
    pub hidden: ScalingMethod,
    /// Applied to the raw inputs before clustering.
    pub clustering: ScalingMethod,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            output: ScalingMethod::Standard,
            hidden: ScalingMethod::Standard,
            clustering: ScalingMethod::Standard,
        }
    }
}

#[derive(Error, Debug)]
pub enum ScalingError {
    #[error("Cannot fit a scaler on an empty matrix.")]
    EmptyInput,

    #[error("Scaler was fitted on {expected} columns, but the input has {found}.")]
    FeatureCountMismatch { found: usize, expected: usize },
}

/// A fitted column-wise affine transform `(x - offset) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedScaler {
    pub method: ScalingMethod,
    pub offset: Array1<f64>,
    pub scale: Array1<f64>,
}

impl FittedScaler {
    /// Learns per-column offsets and scales from `x`.
    pub fn fit(method: ScalingMethod, x: ArrayView2<f64>) -> Result<Self, ScalingError> {
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(ScalingError::EmptyInput);
        }

        let (offset, spread) = match method {
            ScalingMethod::Standard => {
                let mean = x.mean_axis(Axis(0)).ok_or(ScalingError::EmptyInput)?;
                // Population standard deviation (ddof = 0).
                (mean, x.std_axis(Axis(0), 0.0))
            }
            ScalingMethod::MinMax => {
                let min = x.fold_axis(Axis(0), f64::INFINITY, |acc, &v| acc.min(v));
                let max = x.fold_axis(Axis(0), f64::NEG_INFINITY, |acc, &v| acc.max(v));
                let range = &max - &min;
                (min, range)
            }
        };

        let scale = spread.mapv(|s| if s < CONSTANT_COLUMN_TOLERANCE { 1.0 } else { s });

        Ok(Self {
            method,
            offset,
            scale,
        })
    }

    pub fn n_features(&self) -> usize {
        self.offset.len()
    }

    fn check_width(&self, found: usize) -> Result<(), ScalingError> {
        if found != self.n_features() {
            return Err(ScalingError::FeatureCountMismatch {
                found,
                expected: self.n_features(),
            });
        }
        Ok(())
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ScalingError> {
        self.check_width(x.ncols())?;
        Ok((&x - &self.offset) / &self.scale)
    }

    pub fn transform_row(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, ScalingError> {
        self.check_width(x.len())?;
        Ok((&x - &self.offset) / &self.scale)
    }

    pub fn inverse_transform(&self, z: ArrayView2<f64>) -> Result<Array2<f64>, ScalingError> {
        self.check_width(z.ncols())?;
        Ok(&z * &self.scale + &self.offset)
    }
}
