//! # Feature Pipeline
//!
//! Turns raw inputs into the design matrix seen by the output layer. The
//! column order is a fixed contract between training and prediction:
//!
//! ```text
//! [ direct block | hidden block ]
//!   direct block = raw inputs followed by the one-hot cluster columns
//!   hidden block = activation((1 | scaled direct block) · W)
//! ```
//!
//! Every column is then standardized by the output scaler. All state needed to
//! repeat the transformation on new data is captured in [`PipelineState`].

use crate::cluster::{ClusterAugmenter, ClusterError};
use crate::config::RvflConfig;
use crate::matrix::{cbind, rbind};
use crate::nodes::{self, NodeError};
use crate::scaling::{FittedScaler, ScalingError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, ShapeError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Input has {found} feature columns, but the model was trained on {expected}.")]
    DimensionMismatch { found: usize, expected: usize },

    #[error("Input has {n_rows} rows but the target has {n_targets} entries.")]
    LengthMismatch { n_rows: usize, n_targets: usize },

    #[error("Training requires at least {required} observations, but only {found} were provided.")]
    TooFewObservations { found: usize, required: usize },

    #[error("Input has no feature columns.")]
    NoFeatures,

    #[error("The {0} contains NaN or infinite values.")]
    NonFiniteInput(&'static str),

    #[error(
        "Supplied hidden weights have shape {found:?}, but the hidden layer expects {expected:?}."
    )]
    HiddenWeightsShape {
        found: (usize, usize),
        expected: (usize, usize),
    },

    #[error("Hidden node generation failed: {0}")]
    NodeError(#[from] NodeError),

    #[error("Clustering augmentation failed: {0}")]
    ClusterError(#[from] ClusterError),

    #[error("Scaling failed: {0}")]
    ScalingError(#[from] ScalingError),

    #[error("Internal error: failed to stack design matrix blocks: {0}")]
    InternalStackingError(#[from] ShapeError),
}

/// Column bookkeeping for the design matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignLayout {
    /// Raw feature columns seen at fit time.
    pub n_input_features: usize,
    /// One-hot cluster columns appended to the inputs.
    pub n_clusters: usize,
    /// Width of the direct block in the design matrix (zero when it is dropped).
    pub n_direct: usize,
    /// Width of the hidden block in the design matrix.
    pub n_hidden: usize,
}

impl DesignLayout {
    pub fn new(config: &RvflConfig, n_input_features: usize) -> Self {
        let n_clusters = config.clustering.n_clusters;
        let n_direct = if config.uses_direct_block() {
            n_input_features + n_clusters
        } else {
            0
        };
        Self {
            n_input_features,
            n_clusters,
            n_direct,
            n_hidden: config.n_hidden_features,
        }
    }

    /// Width of the cluster-augmented input.
    pub fn n_augmented(&self) -> usize {
        self.n_input_features + self.n_clusters
    }

    pub fn n_columns(&self) -> usize {
        self.n_direct + self.n_hidden
    }
}

/// The fixed hidden projection and the scaler applied before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenLayer {
    pub scaler: FittedScaler,
    /// Shape `[n_augmented (+1 with bias), n_hidden_features]`.
    pub weights: Array2<f64>,
}

/// Everything captured by a training pass that prediction must reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub layout: DesignLayout,
    pub target_mean: f64,
    pub clusters: Option<ClusterAugmenter>,
    pub hidden: Option<HiddenLayer>,
    pub output_scaler: FittedScaler,
}

/// Output of a training pass.
#[derive(Debug, Clone)]
pub struct CookedTrainingSet {
    /// Scaled design matrix, shape `[n_samples, layout.n_columns()]`.
    pub design: Array2<f64>,
    /// Target with `state.target_mean` subtracted.
    pub centered_target: Array1<f64>,
    pub state: PipelineState,
}

/// Builds the training design matrix and captures the pipeline state.
///
/// # Arguments
///
/// * `config`: Validated model configuration.
/// * `x`: Raw inputs, shape `[n_samples, n_features]`.
/// * `y`: Target, length `n_samples`.
/// * `hidden_weights`: Externally supplied projection matrix. When `None`,
///   weights are generated with `config.node_method`. Supplied weights must
///   have shape `[n_augmented (+1 with bias), n_hidden_features]`, which is
///   empty when the hidden layer is disabled.
pub fn cook_training_set(
    config: &RvflConfig,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    hidden_weights: Option<ArrayView2<f64>>,
) -> Result<CookedTrainingSet, PipelineError> {
    // --- 1. Input validation ---
    let (n_samples, n_features) = x.dim();
    if n_samples != y.len() {
        return Err(PipelineError::LengthMismatch {
            n_rows: n_samples,
            n_targets: y.len(),
        });
    }
    if n_samples < 2 {
        return Err(PipelineError::TooFewObservations {
            found: n_samples,
            required: 2,
        });
    }
    if n_features == 0 {
        return Err(PipelineError::NoFeatures);
    }
    internal::ensure_finite(x, "input matrix")?;
    if !y.iter().all(|v| v.is_finite()) {
        return Err(PipelineError::NonFiniteInput("target vector"));
    }

    let layout = DesignLayout::new(config, n_features);

    // --- 2. Target centering ---
    let target_mean = y.sum() / n_samples as f64;
    let centered_target = y.mapv(|v| v - target_mean);

    // --- 3. Cluster augmentation ---
    let (clusters, augmented) = if config.clustering.is_enabled() {
        let (augmenter, encoded) =
            ClusterAugmenter::fit(x, &config.clustering, config.scaling.clustering)?;
        (Some(augmenter), cbind(x, encoded.view())?)
    } else {
        (None, x.to_owned())
    };

    // --- 4. Hidden layer ---
    let n_dims = layout.n_augmented() + usize::from(config.bias);
    let expected = (n_dims, layout.n_hidden);
    if let Some(w) = hidden_weights {
        if w.dim() != expected {
            return Err(PipelineError::HiddenWeightsShape {
                found: w.dim(),
                expected,
            });
        }
    }

    let (hidden, features) = if layout.n_hidden > 0 {
        let scaler = FittedScaler::fit(config.scaling.hidden, augmented.view())?;

        let weights = match hidden_weights {
            Some(w) => {
                internal::ensure_finite(w, "hidden weight matrix")?;
                w.to_owned()
            }
            None => {
                nodes::generate(config.node_method, n_dims, layout.n_hidden, config.seed)?
                    .reversed_axes()
            }
        };

        let layer = HiddenLayer { scaler, weights };
        let mut activated = internal::hidden_features(config, &layer, augmented.view())?;
        if config.dropout > 0.0 {
            internal::apply_dropout(&mut activated, config.dropout, config.seed);
        }

        let features = if config.direct_link {
            cbind(augmented.view(), activated.view())?
        } else {
            activated
        };
        (Some(layer), features)
    } else {
        (None, augmented)
    };

    // --- 5. Output scaling ---
    let output_scaler = FittedScaler::fit(config.scaling.output, features.view())?;
    let design = output_scaler.transform(features.view())?;

    log::info!(
        "Built training design matrix: {} rows x {} columns ({} direct, {} hidden, {} cluster indicators).",
        design.nrows(),
        design.ncols(),
        layout.n_direct,
        layout.n_hidden,
        layout.n_clusters
    );

    Ok(CookedTrainingSet {
        design,
        centered_target,
        state: PipelineState {
            layout,
            target_mean,
            clusters,
            hidden,
            output_scaler,
        },
    })
}

impl PipelineState {
    /// Applies the captured transformation to new inputs. Nothing is refitted
    /// and dropout is never applied.
    pub fn cook_test_set(
        &self,
        config: &RvflConfig,
        x: ArrayView2<f64>,
    ) -> Result<Array2<f64>, PipelineError> {
        if x.ncols() != self.layout.n_input_features {
            return Err(PipelineError::DimensionMismatch {
                found: x.ncols(),
                expected: self.layout.n_input_features,
            });
        }
        internal::ensure_finite(x, "input matrix")?;

        let augmented = match &self.clusters {
            Some(augmenter) => cbind(x, augmenter.encode(x)?.view())?,
            None => x.to_owned(),
        };

        let features = match &self.hidden {
            Some(layer) => {
                let activated = internal::hidden_features(config, layer, augmented.view())?;
                if config.direct_link {
                    cbind(augmented.view(), activated.view())?
                } else {
                    activated
                }
            }
            None => augmented,
        };

        Ok(self.output_scaler.transform(features.view())?)
    }

    /// Transforms a single observation.
    ///
    /// The row is padded with a row of ones into a two-row matrix, pushed
    /// through [`PipelineState::cook_test_set`], and the first row of the result
    /// is returned. Every stage is row-wise, so the padding row never affects
    /// the observation's own features.
    pub fn cook_test_row(
        &self,
        config: &RvflConfig,
        x: ArrayView1<f64>,
    ) -> Result<Array1<f64>, PipelineError> {
        let row = x.insert_axis(Axis(0));
        let padding = Array2::<f64>::ones((1, x.len()));
        let padded = rbind(row, padding.view())?;
        let cooked = self.cook_test_set(config, padded.view())?;
        Ok(cooked.row(0).to_owned())
    }
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    pub(super) fn ensure_finite(
        x: ArrayView2<f64>,
        what: &'static str,
    ) -> Result<(), PipelineError> {
        if x.iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(PipelineError::NonFiniteInput(what))
        }
    }

    /// `activation([1 |] scale(augmented) · W)`
    pub(super) fn hidden_features(
        config: &RvflConfig,
        layer: &HiddenLayer,
        augmented: ArrayView2<f64>,
    ) -> Result<Array2<f64>, PipelineError> {
        let scaled = layer.scaler.transform(augmented)?;
        let input = if config.bias {
            let ones = Array2::<f64>::ones((scaled.nrows(), 1));
            cbind(ones.view(), scaled.view())?
        } else {
            scaled
        };
        let pre_activation = input.dot(&layer.weights);
        Ok(config
            .activation
            .apply(pre_activation.view(), config.activation_param))
    }

    /// Inverted dropout: each activation is zeroed with probability `rate` and
    /// survivors are rescaled by `1 / (1 - rate)`.
    pub(super) fn apply_dropout(h: &mut Array2<f64>, rate: f64, seed: u64) {
        let keep = 1.0 - rate;
        let mut rng = StdRng::seed_from_u64(seed);
        h.mapv_inplace(|v| if rng.gen_bool(keep) { v / keep } else { 0.0 });
    }
}
