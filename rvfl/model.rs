use crate::cluster::{ClusterAugmenter, ClusterModel};
use crate::config::{ConfigError, RvflConfig};
use crate::estimate::{self, EstimationError, LinearFit};
use crate::metrics::{Metric, MetricError};
use crate::pipeline::{self, DesignLayout, PipelineError, PipelineState};
use crate::scaling::FittedScaler;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid model configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Feature pipeline failed: {0}")]
    PipelineError(#[from] PipelineError),
    #[error("Output-layer estimation failed: {0}")]
    EstimationError(#[from] EstimationError),
    #[error("Scoring failed: {0}")]
    MetricError(#[from] MetricError),
    #[error("Model has {found} feature names, but was trained on {expected} features.")]
    MismatchedFeatureNames { found: usize, expected: usize },
    #[error("Model file is inconsistent: {0}.")]
    InconsistentState(String),
}

/// An unfitted RVFL regressor: a validated configuration.
#[derive(Debug, Clone)]
pub struct Rvfl {
    config: RvflConfig,
}

/// Predictions for a batch of observations, on the original target scale.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mean: Array1<f64>,
    /// Predictive standard deviations, when the estimator tracks a posterior covariance.
    pub std: Option<Array1<f64>>,
}

/// Prediction for a single observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointPrediction {
    pub mean: f64,
    pub std: Option<f64>,
}

/// A fitted model. Immutable: prediction never changes it, and refitting
/// produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedRvfl {
    pub config: RvflConfig,
    /// Column names of the training inputs, in order. Empty when the model was
    /// fitted directly from arrays.
    #[serde(default)]
    pub feature_names: Vec<String>,
    pub pipeline: PipelineState,
    pub output_layer: LinearFit,
}

impl Rvfl {
    pub fn new(config: RvflConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RvflConfig {
        &self.config
    }

    /// Fits the network on `x` (`[n_samples, n_features]`) and `y`.
    pub fn fit(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<FittedRvfl, ModelError> {
        self.fit_with_weights(x, y, None)
    }

    /// Fits the network with an externally supplied hidden projection.
    ///
    /// `hidden_weights` must have shape
    /// `[n_features + n_clusters (+1 with bias), n_hidden_features]`, so a
    /// configuration without a hidden layer accepts only an empty projection.
    pub fn fit_with_weights(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        hidden_weights: Option<ArrayView2<f64>>,
    ) -> Result<FittedRvfl, ModelError> {
        log::info!(
            "Fitting RVFL on {} observations x {} features ({} hidden nodes, {} nodes, {} estimator).",
            x.nrows(),
            x.ncols(),
            self.config.n_hidden_features,
            self.config.node_method,
            self.config.estimator.name()
        );

        // --- 1. Build the design matrix ---
        let cooked = pipeline::cook_training_set(&self.config, x, y, hidden_weights)?;

        // --- 2. Fit the output layer ---
        let output_layer = estimate::fit_output_layer(
            &self.config.estimator,
            cooked.design.view(),
            cooked.centered_target.view(),
            &cooked.state.layout,
        )?;

        log::info!(
            "Fit complete: {} coefficients, GCV {:.6e}.",
            output_layer.beta.len(),
            output_layer.gcv
        );

        Ok(FittedRvfl {
            config: self.config.clone(),
            feature_names: Vec::new(),
            pipeline: cooked.state,
            output_layer,
        })
    }
}

impl FittedRvfl {
    /// Attaches input column names, checked against the fitted feature count.
    pub fn with_feature_names(mut self, names: Vec<String>) -> Result<Self, ModelError> {
        let expected = self.pipeline.layout.n_input_features;
        if names.len() != expected {
            return Err(ModelError::MismatchedFeatureNames {
                found: names.len(),
                expected,
            });
        }
        self.feature_names = names;
        Ok(self)
    }

    /// Predicts for new observations.
    ///
    /// # Arguments
    /// * `x`: A 2D array view with shape `[n_samples, n_features]`, columns in
    ///   the training order.
    ///
    /// # Returns
    /// The predictive mean on the original target scale and, for the Bayesian
    /// estimators with a posterior covariance, the predictive standard deviation.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Prediction, ModelError> {
        let design = self.pipeline.cook_test_set(&self.config, x)?;
        Ok(self.predict_design(design)?)
    }

    /// Predicts for a single observation of length `n_features`.
    pub fn predict_one(&self, x: ArrayView1<f64>) -> Result<PointPrediction, ModelError> {
        let row = self.pipeline.cook_test_row(&self.config, x)?;
        let design = row.insert_axis(Axis(0));
        let prediction = self.predict_design(design)?;
        Ok(PointPrediction {
            mean: prediction.mean[0],
            std: prediction.std.map(|s| s[0]),
        })
    }

    fn predict_design(&self, design: Array2<f64>) -> Result<Prediction, EstimationError> {
        let linear = self.output_layer.predict(design.view())?;
        Ok(Prediction {
            mean: linear.mean + self.pipeline.target_mean,
            std: linear.std,
        })
    }

    /// Predicts on `x` and scores the predictive mean against `y`.
    pub fn score(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        metric: Metric,
    ) -> Result<f64, ModelError> {
        let prediction = self.predict(x)?;
        Ok(metric.evaluate(y, prediction.mean.view())?)
    }

    pub fn target_mean(&self) -> f64 {
        self.pipeline.target_mean
    }

    pub fn beta(&self) -> ArrayView1<'_, f64> {
        self.output_layer.beta.view()
    }

    pub fn posterior_covariance(&self) -> Option<ArrayView2<'_, f64>> {
        self.output_layer
            .posterior_covariance
            .as_ref()
            .map(|c| c.view())
    }

    pub fn hidden_weights(&self) -> Option<ArrayView2<'_, f64>> {
        self.pipeline.hidden.as_ref().map(|h| h.weights.view())
    }

    pub fn gcv(&self) -> f64 {
        self.output_layer.gcv
    }

    /// Saves the fitted model to a TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file. The stored configuration is
    /// re-validated and every stored array is checked against the layout it
    /// implies.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: FittedRvfl = toml::from_str(&toml_string)?;
        model.config.validate()?;
        internal::check_state(&model)?;
        Ok(model)
    }
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    fn inconsistent(message: String) -> ModelError {
        ModelError::InconsistentState(message)
    }

    fn check_scaler(name: &str, scaler: &FittedScaler, width: usize) -> Result<(), ModelError> {
        if scaler.offset.len() != width || scaler.scale.len() != width {
            return Err(inconsistent(format!(
                "{name} has {} offsets and {} scales, expected {width}",
                scaler.offset.len(),
                scaler.scale.len()
            )));
        }
        Ok(())
    }

    fn check_clusters(
        augmenter: &ClusterAugmenter,
        layout: &DesignLayout,
    ) -> Result<(), ModelError> {
        let (k, d) = (layout.n_clusters, layout.n_input_features);
        check_scaler("clustering scaler", &augmenter.scaler, d)?;
        let consistent = match &augmenter.model {
            ClusterModel::KMeans { centroids } => centroids.dim() == (k, d),
            ClusterModel::Gmm {
                weights,
                means,
                variances,
            } => weights.len() == k && means.dim() == (k, d) && variances.dim() == (k, d),
        };
        if !consistent {
            return Err(inconsistent(format!(
                "cluster model does not describe {k} clusters over {d} features"
            )));
        }
        Ok(())
    }

    /// Checks every stored array against the design layout of `model.config`.
    pub(super) fn check_state(model: &FittedRvfl) -> Result<(), ModelError> {
        let state = &model.pipeline;
        let layout = state.layout;

        // --- 1. Layout ---
        if layout != DesignLayout::new(&model.config, layout.n_input_features) {
            return Err(inconsistent(format!(
                "design layout {layout:?} does not match the stored configuration"
            )));
        }

        // --- 2. Cluster block ---
        match &state.clusters {
            Some(augmenter) if layout.n_clusters > 0 => check_clusters(augmenter, &layout)?,
            None if layout.n_clusters == 0 => {}
            _ => {
                return Err(inconsistent(format!(
                    "cluster state does not match {} configured clusters",
                    layout.n_clusters
                )));
            }
        }

        // --- 3. Hidden layer ---
        match &state.hidden {
            Some(layer) if layout.n_hidden > 0 => {
                check_scaler("hidden scaler", &layer.scaler, layout.n_augmented())?;
                let expected = (
                    layout.n_augmented() + usize::from(model.config.bias),
                    layout.n_hidden,
                );
                if layer.weights.dim() != expected {
                    return Err(inconsistent(format!(
                        "hidden weights have shape {:?}, expected {expected:?}",
                        layer.weights.dim()
                    )));
                }
            }
            None if layout.n_hidden == 0 => {}
            _ => {
                return Err(inconsistent(format!(
                    "hidden layer state does not match {} configured hidden features",
                    layout.n_hidden
                )));
            }
        }

        // --- 4. Output layer ---
        let p = layout.n_columns();
        check_scaler("output scaler", &state.output_scaler, p)?;
        let fit = &model.output_layer;
        if fit.beta.len() != p {
            return Err(inconsistent(format!(
                "{} coefficients stored for {p} design columns",
                fit.beta.len()
            )));
        }
        if let Some(covariance) = &fit.posterior_covariance {
            if covariance.dim() != (p, p) {
                return Err(inconsistent(format!(
                    "posterior covariance has shape {:?}, expected {:?}",
                    covariance.dim(),
                    (p, p)
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterConfig;
    use crate::estimate::EstimatorConfig;
    use crate::nodes::NodeMethod;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::NamedTempFile;

    fn wavy_data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, 3), |_| rng.gen_range(-1.0..1.0));
        let y = x
            .rows()
            .into_iter()
            .map(|r| (2.0_f64 * r[0]).sin() + r[1] * r[2] + 0.5 * r[2])
            .collect();
        (x, y)
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let config = RvflConfig {
            estimator: EstimatorConfig::BayesianRidge { s: 0.0, sigma: 0.1 },
            ..Default::default()
        };
        assert!(matches!(
            Rvfl::new(config),
            Err(ConfigError::InvalidParameter { name: "s", .. })
        ));
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (x, y) = wavy_data(60, 1);
        for node_method in [NodeMethod::Sobol, NodeMethod::Uniform] {
            let model = Rvfl::new(RvflConfig {
                n_hidden_features: 10,
                node_method,
                ..Default::default()
            })
            .unwrap();
            let a = model.fit(x.view(), y.view()).unwrap();
            let b = model.fit(x.view(), y.view()).unwrap();
            assert_eq!(a, b, "{node_method} fit is not reproducible");
            assert_eq!(
                a.predict(x.view()).unwrap(),
                b.predict(x.view()).unwrap()
            );
        }
    }

    #[test]
    fn test_predictions_are_uncentered_with_target_mean() {
        let (x, y) = wavy_data(50, 2);
        let shifted = &y + 100.0;
        let model = Rvfl::new(RvflConfig::default()).unwrap();
        let base = model.fit(x.view(), y.view()).unwrap();
        let moved = model.fit(x.view(), shifted.view()).unwrap();
        assert_abs_diff_eq!(moved.target_mean() - base.target_mean(), 100.0, epsilon = 1e-10);
        let delta = moved.predict(x.view()).unwrap().mean - base.predict(x.view()).unwrap().mean;
        assert!(delta.iter().all(|d| (d - 100.0).abs() < 1e-8));
    }

    #[test]
    fn test_predict_one_matches_batch() {
        let (x, y) = wavy_data(40, 3);
        let model = Rvfl::new(RvflConfig {
            n_hidden_features: 8,
            clustering: ClusterConfig {
                n_clusters: 2,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let fitted = model.fit(x.view(), y.view()).unwrap();
        let (test, _) = wavy_data(5, 30);
        let batch = fitted.predict(test.view()).unwrap();
        let batch_std = batch.std.as_ref().unwrap();
        for i in 0..test.nrows() {
            let single = fitted.predict_one(test.row(i)).unwrap();
            assert_abs_diff_eq!(single.mean, batch.mean[i], epsilon = 1e-12);
            assert_abs_diff_eq!(single.std.unwrap(), batch_std[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_least_squares_has_no_std() {
        let (x, y) = wavy_data(30, 4);
        let model = Rvfl::new(RvflConfig {
            estimator: EstimatorConfig::LeastSquares,
            ..Default::default()
        })
        .unwrap();
        let fitted = model.fit(x.view(), y.view()).unwrap();
        assert!(fitted.posterior_covariance().is_none());
        assert!(fitted.predict(x.view()).unwrap().std.is_none());
        assert!(fitted.predict_one(x.row(0)).unwrap().std.is_none());
    }

    #[test]
    fn test_score_with_every_metric_on_training_data() {
        let (x, y) = wavy_data(80, 5);
        let fitted = Rvfl::new(RvflConfig {
            n_hidden_features: 20,
            ..Default::default()
        })
        .unwrap()
        .fit(x.view(), y.view())
        .unwrap();
        let r2 = fitted.score(x.view(), y.view(), Metric::R2).unwrap();
        assert!(r2 > 0.5, "training r2 {r2}");
        let mse = fitted
            .score(x.view(), y.view(), Metric::NegMeanSquaredError)
            .unwrap();
        assert!(mse <= 0.0);
    }

    #[test]
    fn test_dimension_mismatch_on_predict() {
        let (x, y) = wavy_data(20, 6);
        let fitted = Rvfl::new(RvflConfig::default())
            .unwrap()
            .fit(x.view(), y.view())
            .unwrap();
        match fitted.predict(Array2::zeros((3, 2)).view()) {
            Err(ModelError::PipelineError(PipelineError::DimensionMismatch { found, expected })) => {
                assert_eq!(found, 2);
                assert_eq!(expected, 3);
            }
            other => panic!("Expected DimensionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_save_and_load_reproduce_predictions() -> Result<(), Box<dyn std::error::Error>> {
        let (x, y) = wavy_data(35, 7);
        let fitted = Rvfl::new(RvflConfig {
            n_hidden_features: 6,
            clustering: ClusterConfig {
                n_clusters: 3,
                method: crate::cluster::ClusterMethod::Gmm,
                ..Default::default()
            },
            ..Default::default()
        })?
        .fit(x.view(), y.view())?
        .with_feature_names(vec!["a".into(), "b".into(), "c".into()])?;

        let file = NamedTempFile::new()?;
        let path = file.path().to_str().ok_or("temp path is not UTF-8")?;
        fitted.save(path)?;
        let loaded = FittedRvfl::load(path)?;

        assert_eq!(loaded.feature_names, fitted.feature_names);
        assert_eq!(loaded.predict(x.view())?, fitted.predict(x.view())?);
        Ok(())
    }

    fn saved_then_loaded(model: &FittedRvfl) -> Result<FittedRvfl, ModelError> {
        let file = NamedTempFile::new()?;
        let path = file.path().to_str().unwrap_or_default().to_string();
        model.save(&path)?;
        FittedRvfl::load(&path)
    }

    #[test]
    fn test_load_rejects_hidden_weights_of_wrong_shape() {
        let (x, y) = wavy_data(30, 10);
        let mut fitted = Rvfl::new(RvflConfig {
            n_hidden_features: 4,
            ..Default::default()
        })
        .unwrap()
        .fit(x.view(), y.view())
        .unwrap();
        saved_then_loaded(&fitted).unwrap();

        if let Some(layer) = fitted.pipeline.hidden.as_mut() {
            layer.weights = Array2::zeros((3, 4));
        }
        match saved_then_loaded(&fitted) {
            Err(ModelError::InconsistentState(message)) => {
                assert!(message.contains("hidden weights"), "{message}")
            }
            other => panic!("Expected InconsistentState, got {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_covariance_of_wrong_shape() {
        let (x, y) = wavy_data(30, 11);
        let mut fitted = Rvfl::new(RvflConfig::default())
            .unwrap()
            .fit(x.view(), y.view())
            .unwrap();
        let p = fitted.beta().len();
        fitted.output_layer.posterior_covariance = Some(Array2::eye(p - 1));
        match saved_then_loaded(&fitted) {
            Err(ModelError::InconsistentState(message)) => {
                assert!(message.contains("posterior covariance"), "{message}")
            }
            other => panic!("Expected InconsistentState, got {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_missing_cluster_state() {
        let (x, y) = wavy_data(30, 12);
        let mut fitted = Rvfl::new(RvflConfig {
            clustering: ClusterConfig {
                n_clusters: 2,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
        .fit(x.view(), y.view())
        .unwrap();
        fitted.pipeline.clusters = None;
        assert!(matches!(
            saved_then_loaded(&fitted),
            Err(ModelError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_largest_storable_seed_survives_save_and_load() {
        let (x, y) = wavy_data(20, 13);
        let fitted = Rvfl::new(RvflConfig {
            node_method: NodeMethod::Uniform,
            seed: i64::MAX as u64,
            ..Default::default()
        })
        .unwrap()
        .fit(x.view(), y.view())
        .unwrap();
        let loaded = saved_then_loaded(&fitted).unwrap();
        assert_eq!(loaded.config.seed, i64::MAX as u64);
        assert_eq!(loaded, fitted);
    }

    #[test]
    fn test_seed_beyond_toml_range_rejected_before_fitting() {
        let config = RvflConfig {
            seed: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            Rvfl::new(config),
            Err(ConfigError::InvalidParameter { name: "seed", .. })
        ));
    }

    #[test]
    fn test_feature_name_count_is_checked() {
        let (x, y) = wavy_data(10, 8);
        let fitted = Rvfl::new(RvflConfig::default())
            .unwrap()
            .fit(x.view(), y.view())
            .unwrap();
        assert!(matches!(
            fitted.with_feature_names(vec!["only".into()]),
            Err(ModelError::MismatchedFeatureNames { found: 1, expected: 3 })
        ));
    }

    #[test]
    fn test_supplied_weights_round_trip() {
        let (x, y) = wavy_data(25, 9);
        let weights = array![[0.5, -0.5], [1.0, 0.0], [0.0, 1.0], [0.3, 0.3]];
        let model = Rvfl::new(RvflConfig {
            n_hidden_features: 2,
            ..Default::default()
        })
        .unwrap();
        let fitted = model
            .fit_with_weights(x.view(), y.view(), Some(weights.view()))
            .unwrap();
        assert_eq!(fitted.hidden_weights().unwrap(), weights.view());
    }
}
