//! Model configuration: the immutable set of hyperparameters a network is
//! built from. A configuration is validated once, when a [`crate::model::Rvfl`]
//! is created, and is stored verbatim inside every fitted model.

use crate::activation::Activation;
use crate::cluster::ClusterConfig;
use crate::estimate::EstimatorConfig;
use crate::nodes::NodeMethod;
use crate::scaling::ScalingConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown activation function '{0}'. Expected one of: relu, tanh, sigmoid, prelu, elu.")]
    UnknownActivation(String),

    #[error("Unknown node generation method '{0}'. Expected one of: sobol, hammersley, halton, uniform.")]
    UnknownNodeMethod(String),

    #[error("Unknown clustering method '{0}'. Expected one of: kmeans, gmm.")]
    UnknownClusterMethod(String),

    #[error("Unknown scaling method '{0}'. Expected one of: std, minmax.")]
    UnknownScalingMethod(String),

    #[error("Unknown metric '{0}'.")]
    UnknownMetric(String),

    #[error("Invalid value {value} for '{name}': {reason}.")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Hyperparameters of an RVFL regressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RvflConfig {
    /// Width of the hidden layer. Zero disables it and the output layer sees
    /// only the (cluster-augmented) inputs.
    pub n_hidden_features: usize,
    pub activation: Activation,
    /// Slope for `prelu`, scale for `elu`.
    pub activation_param: f64,
    pub node_method: NodeMethod,
    /// Prepend a column of ones before the hidden projection.
    pub bias: bool,
    /// Feed the inputs to the output layer alongside the hidden features.
    pub direct_link: bool,
    /// Fraction of hidden activations zeroed during training, in `[0, 1)`.
    pub dropout: f64,
    pub clustering: ClusterConfig,
    pub scaling: ScalingConfig,
    /// Seeds the uniform node generator and dropout. Clustering has its own seed.
    pub seed: u64,
    pub estimator: EstimatorConfig,
}

impl Default for RvflConfig {
    fn default() -> Self {
        Self {
            n_hidden_features: 5,
            activation: Activation::Relu,
            activation_param: 0.01,
            node_method: NodeMethod::Sobol,
            bias: true,
            direct_link: true,
            dropout: 0.0,
            clustering: ClusterConfig::default(),
            scaling: ScalingConfig::default(),
            seed: 123,
            estimator: EstimatorConfig::default(),
        }
    }
}

impl RvflConfig {
    /// Checks every numeric hyperparameter against its admissible range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.activation_param.is_finite() {
            return Err(ConfigError::InvalidParameter {
                name: "activation_param",
                value: self.activation_param,
                reason: "must be finite",
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::InvalidParameter {
                name: "dropout",
                value: self.dropout,
                reason: "must lie in [0, 1)",
            });
        }
        require_storable_seed("seed", self.seed)?;
        self.clustering.validate()?;
        self.estimator.validate()?;
        Ok(())
    }

    /// Whether the output layer sees the direct-link block.
    ///
    /// Without a hidden layer the direct block is the only thing left, so it is
    /// kept regardless of `direct_link`.
    pub fn uses_direct_block(&self) -> bool {
        self.direct_link || self.n_hidden_features == 0
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RvflConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &str) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

/// Rejects non-finite or non-positive values.
pub(crate) fn require_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidParameter {
            name,
            value,
            reason: "must be finite and strictly positive",
        });
    }
    Ok(())
}

/// Rejects seeds that a TOML integer (a signed 64-bit value) cannot hold, so a
/// fitted model can always be saved.
pub(crate) fn require_storable_seed(name: &'static str, seed: u64) -> Result<(), ConfigError> {
    if seed > i64::MAX as u64 {
        return Err(ConfigError::InvalidParameter {
            name,
            value: seed as f64,
            reason: "must not exceed 9223372036854775807",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterMethod;
    use crate::scaling::ScalingMethod;

    #[test]
    fn test_default_config_is_valid() {
        RvflConfig::default().validate().unwrap();
    }

    #[test]
    fn test_dropout_out_of_range_rejected() {
        for dropout in [-0.1, 1.0, 1.5, f64::NAN] {
            let config = RvflConfig {
                dropout,
                ..Default::default()
            };
            match config.validate() {
                Err(ConfigError::InvalidParameter { name, .. }) => assert_eq!(name, "dropout"),
                other => panic!("Expected InvalidParameter for dropout {dropout}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let source = r#"
            n_hidden_features = 12
            activation = "tanh"
            node_method = "halton"

            [clustering]
            n_clusters = 3
            method = "gmm"

            [scaling]
            output = "standard"
            hidden = "minmax"
            clustering = "standard"

            [estimator.bayesian_ridge]
            s = 0.5
            sigma = 0.1
        "#;
        let config = RvflConfig::from_toml_str(source).unwrap();
        assert_eq!(config.n_hidden_features, 12);
        assert_eq!(config.activation, Activation::Tanh);
        assert_eq!(config.node_method, NodeMethod::Halton);
        assert_eq!(config.clustering.n_clusters, 3);
        assert_eq!(config.clustering.method, ClusterMethod::Gmm);
        assert_eq!(config.scaling.hidden, ScalingMethod::MinMax);
        assert_eq!(
            config.estimator,
            EstimatorConfig::BayesianRidge { s: 0.5, sigma: 0.1 }
        );
        assert!(config.bias);
        assert_eq!(config.seed, 123);
    }

    #[test]
    fn test_toml_round_trip_preserves_config() {
        let config = RvflConfig {
            n_hidden_features: 7,
            activation: Activation::Elu,
            activation_param: 0.3,
            dropout: 0.2,
            estimator: EstimatorConfig::LeastSquares,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = RvflConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_estimator_in_toml_is_rejected() {
        let source = r#"
            [estimator.generalized_bayesian_ridge]
            s1 = 0.0
            s2 = 0.1
            sigma = 0.05
            return_std = true
        "#;
        match RvflConfig::from_toml_str(source) {
            Err(ConfigError::InvalidParameter { name, .. }) => assert_eq!(name, "s1"),
            other => panic!("Expected InvalidParameter for s1, got {other:?}"),
        }
    }

    #[test]
    fn test_seed_above_toml_integer_range_rejected() {
        let config = RvflConfig {
            seed: i64::MAX as u64 + 1,
            ..Default::default()
        };
        match config.validate() {
            Err(ConfigError::InvalidParameter { name, .. }) => assert_eq!(name, "seed"),
            other => panic!("Expected InvalidParameter for seed, got {other:?}"),
        }

        let config = RvflConfig {
            clustering: ClusterConfig {
                seed: u64::MAX,
                ..Default::default()
            },
            ..Default::default()
        };
        match config.validate() {
            Err(ConfigError::InvalidParameter { name, .. }) => {
                assert_eq!(name, "clustering.seed")
            }
            other => panic!("Expected InvalidParameter for clustering.seed, got {other:?}"),
        }
    }

    #[test]
    fn test_largest_storable_seed_round_trips() {
        let config = RvflConfig {
            seed: i64::MAX as u64,
            clustering: ClusterConfig {
                seed: i64::MAX as u64,
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = RvflConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.seed, i64::MAX as u64);
        assert_eq!(parsed.clustering.seed, i64::MAX as u64);
    }

    #[test]
    fn test_direct_block_kept_without_hidden_layer() {
        let config = RvflConfig {
            n_hidden_features: 0,
            direct_link: false,
            ..Default::default()
        };
        assert!(config.uses_direct_block());
        let config = RvflConfig {
            direct_link: false,
            ..Default::default()
        };
        assert!(!config.uses_direct_block());
    }
}
