use crate::config::ConfigError;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element-wise nonlinearity applied to the hidden-layer pre-activations.
///
/// `Prelu` and `Elu` read the configured activation parameter `a`; the other
/// variants ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
    Prelu,
    Elu,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Prelu => "prelu",
            Activation::Elu => "elu",
        }
    }

    /// Evaluates the activation at a single point.
    pub fn eval(&self, x: f64, a: f64) -> f64 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => {
                // Split on the sign so exp never overflows.
                if x >= 0.0 {
                    1.0 / (1.0 + (-x).exp())
                } else {
                    let e = x.exp();
                    e / (1.0 + e)
                }
            }
            Activation::Prelu => {
                if x >= 0.0 {
                    x
                } else {
                    a * x
                }
            }
            Activation::Elu => {
                if x >= 0.0 {
                    x
                } else {
                    a * x.exp_m1()
                }
            }
        }
    }

    /// Applies the activation to every element of a matrix.
    pub fn apply(&self, x: ArrayView2<f64>, a: f64) -> Array2<f64> {
        x.mapv(|v| self.eval(v, a))
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "prelu" => Ok(Activation::Prelu),
            "elu" => Ok(Activation::Elu),
            other => Err(ConfigError::UnknownActivation(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_relu_clamps_negatives() {
        let x = array![[-2.0, 0.0, 3.5]];
        let out = Activation::Relu.apply(x.view(), 0.01);
        assert_eq!(out, array![[0.0, 0.0, 3.5]]);
    }

    #[test]
    fn test_parametric_variants_use_a() {
        assert_abs_diff_eq!(Activation::Prelu.eval(-2.0, 0.25), -0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(Activation::Prelu.eval(2.0, 0.25), 2.0, epsilon = 1e-15);
        assert_abs_diff_eq!(
            Activation::Elu.eval(-1.0, 2.0),
            2.0 * ((-1.0f64).exp() - 1.0),
            epsilon = 1e-15
        );
        assert_abs_diff_eq!(Activation::Elu.eval(0.7, 2.0), 0.7, epsilon = 1e-15);
    }

    #[test]
    fn test_sigmoid_is_stable_at_extremes() {
        assert_abs_diff_eq!(Activation::Sigmoid.eval(0.0, 0.0), 0.5, epsilon = 1e-15);
        let high = Activation::Sigmoid.eval(800.0, 0.0);
        let low = Activation::Sigmoid.eval(-800.0, 0.0);
        assert!(high.is_finite() && low.is_finite());
        assert_abs_diff_eq!(high, 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(low, 0.0, epsilon = 1e-15);
        // Symmetry: s(-x) = 1 - s(x)
        assert_abs_diff_eq!(
            Activation::Sigmoid.eval(-1.3, 0.0),
            1.0 - Activation::Sigmoid.eval(1.3, 0.0),
            epsilon = 1e-14
        );
    }

    #[test]
    fn test_tanh_matches_std() {
        assert_abs_diff_eq!(Activation::Tanh.eval(0.4, 0.0), 0.4f64.tanh(), epsilon = 1e-15);
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        match "softplus".parse::<Activation>() {
            Err(ConfigError::UnknownActivation(name)) => assert_eq!(name, "softplus"),
            other => panic!("Expected UnknownActivation, got {other:?}"),
        }
    }
}
