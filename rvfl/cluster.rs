//! # Clustering Augmentation
//!
//! Optionally appends a one-hot cluster-membership block to the raw inputs.
//! The clustering model and its input scaler are fitted once, at training time,
//! and reused unchanged for every later prediction.
//!
//! Two clusterers are available:
//! - k-means with k-means++ seeding and Lloyd iterations, restarted `n_init`
//!   times and keeping the run with the lowest inertia.
//! - A Gaussian mixture with diagonal covariances fitted by EM, initialised
//!   from the best k-means solution. Labels are the most responsible component.

use crate::config::{ConfigError, require_positive, require_storable_seed};
use crate::matrix::one_hot;
use crate::scaling::{FittedScaler, ScalingError, ScalingMethod};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Added to every mixture variance so a component can never collapse onto a point.
const VARIANCE_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMethod {
    KMeans,
    Gmm,
}

impl fmt::Display for ClusterMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMethod::KMeans => f.write_str("kmeans"),
            ClusterMethod::Gmm => f.write_str("gmm"),
        }
    }
}

impl FromStr for ClusterMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kmeans" | "k-means" => Ok(ClusterMethod::KMeans),
            "gmm" => Ok(ClusterMethod::Gmm),
            other => Err(ConfigError::UnknownClusterMethod(other.to_string())),
        }
    }
}

/// Parameters of the clustering augmenter. `n_clusters == 0` disables it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub n_clusters: usize,
    pub method: ClusterMethod,
    pub max_iterations: usize,
    pub n_init: usize,
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            n_clusters: 0,
            method: ClusterMethod::KMeans,
            max_iterations: 300,
            n_init: 10,
            tolerance: 1e-4,
            seed: 123,
        }
    }
}

impl ClusterConfig {
    pub fn is_enabled(&self) -> bool {
        self.n_clusters > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // The seed is saved with the model even when clustering is off.
        require_storable_seed("clustering.seed", self.seed)?;
        if !self.is_enabled() {
            return Ok(());
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "clustering.max_iterations",
                value: 0.0,
                reason: "must be at least 1",
            });
        }
        if self.n_init == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "clustering.n_init",
                value: 0.0,
                reason: "must be at least 1",
            });
        }
        require_positive("clustering.tolerance", self.tolerance)
    }
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cannot form {n_clusters} clusters from {n_samples} observations.")]
    TooFewSamples { n_samples: usize, n_clusters: usize },

    #[error("Clustering input scaling failed: {0}")]
    ScalingError(#[from] ScalingError),

    #[error("Clustering produced non-finite parameters.")]
    NonFiniteParameters,
}

/// A fitted clusterer. Both variants assign hard labels in `0..n_clusters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterModel {
    KMeans {
        centroids: Array2<f64>,
    },
    Gmm {
        weights: Array1<f64>,
        means: Array2<f64>,
        variances: Array2<f64>,
    },
}

impl ClusterModel {
    pub fn n_clusters(&self) -> usize {
        match self {
            ClusterModel::KMeans { centroids } => centroids.nrows(),
            ClusterModel::Gmm { means, .. } => means.nrows(),
        }
    }

    /// Hard label of every row of `x` (already scaled).
    pub fn predict(&self, x: ArrayView2<f64>) -> Vec<usize> {
        match self {
            ClusterModel::KMeans { centroids } => x
                .rows()
                .into_iter()
                .map(|row| internal::nearest_centroid(row, centroids.view()).0)
                .collect(),
            ClusterModel::Gmm {
                weights,
                means,
                variances,
            } => {
                let log_prob = internal::weighted_log_density(
                    x,
                    weights.view(),
                    means.view(),
                    variances.view(),
                );
                log_prob
                    .rows()
                    .into_iter()
                    .map(|row| internal::argmax(row))
                    .collect()
            }
        }
    }
}

/// Persisted clustering state: the scaler applied before clustering and the
/// fitted clusterer itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAugmenter {
    pub scaler: FittedScaler,
    pub model: ClusterModel,
}

impl ClusterAugmenter {
    /// Fits the scaler and clusterer on the training inputs.
    ///
    /// # Returns
    ///
    /// The fitted augmenter and the one-hot membership matrix of the training
    /// rows, shape `[n_samples, n_clusters]`.
    pub fn fit(
        x: ArrayView2<f64>,
        config: &ClusterConfig,
        scaling: ScalingMethod,
    ) -> Result<(Self, Array2<f64>), ClusterError> {
        let n_samples = x.nrows();
        if n_samples < config.n_clusters {
            return Err(ClusterError::TooFewSamples {
                n_samples,
                n_clusters: config.n_clusters,
            });
        }

        let scaler = FittedScaler::fit(scaling, x)?;
        let scaled = scaler.transform(x)?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let kmeans = internal::kmeans(scaled.view(), config, &mut rng);
        log::debug!(
            "k-means with {} clusters: inertia {:.6} after {} iterations",
            config.n_clusters,
            kmeans.inertia,
            kmeans.iterations
        );

        let (model, labels) = match config.method {
            ClusterMethod::KMeans => (
                ClusterModel::KMeans {
                    centroids: kmeans.centroids,
                },
                kmeans.labels,
            ),
            ClusterMethod::Gmm => {
                let model = internal::gaussian_mixture(scaled.view(), &kmeans, config);
                let labels = model.predict(scaled.view());
                (model, labels)
            }
        };

        if !internal::parameters_are_finite(&model) {
            return Err(ClusterError::NonFiniteParameters);
        }

        let encoded = one_hot(&labels, config.n_clusters);
        Ok((Self { scaler, model }, encoded))
    }

    pub fn n_clusters(&self) -> usize {
        self.model.n_clusters()
    }

    /// One-hot membership of new rows, using the state captured at fit time.
    pub fn encode(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ClusterError> {
        let scaled = self.scaler.transform(x)?;
        let labels = self.model.predict(scaled.view());
        Ok(one_hot(&labels, self.n_clusters()))
    }
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    pub(super) struct KMeansRun {
        pub centroids: Array2<f64>,
        pub labels: Vec<usize>,
        pub inertia: f64,
        pub iterations: usize,
    }

    fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
    }

    /// Index of the closest centroid and the squared distance to it.
    pub(super) fn nearest_centroid(row: ArrayView1<f64>, centroids: ArrayView2<f64>) -> (usize, f64) {
        let mut best = (0, f64::INFINITY);
        for (k, centroid) in centroids.rows().into_iter().enumerate() {
            let d = squared_distance(row, centroid);
            if d < best.1 {
                best = (k, d);
            }
        }
        best
    }

    pub(super) fn argmax(row: ArrayView1<f64>) -> usize {
        let mut best = (0, f64::NEG_INFINITY);
        for (k, &v) in row.iter().enumerate() {
            if v > best.1 {
                best = (k, v);
            }
        }
        best.0
    }

    /// Draws an index with probability proportional to `weights`, uniformly
    /// when every weight is zero.
    fn sample_proportional(weights: &[f64], rng: &mut StdRng) -> usize {
        let total: f64 = weights.iter().sum();
        if !(total > 0.0) {
            return rng.gen_range(0..weights.len());
        }
        let target = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (i, &w) in weights.iter().enumerate() {
            cumulative += w;
            if target < cumulative {
                return i;
            }
        }
        weights.len() - 1
    }

    /// k-means++ seeding.
    fn kmeans_plus_plus(x: ArrayView2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
        let n = x.nrows();
        let mut centroids = Array2::zeros((k, x.ncols()));
        let first = rng.gen_range(0..n);
        centroids.row_mut(0).assign(&x.row(first));

        let mut closest: Vec<f64> = x
            .rows()
            .into_iter()
            .map(|row| squared_distance(row, centroids.row(0)))
            .collect();

        for c in 1..k {
            let chosen = sample_proportional(&closest, rng);
            centroids.row_mut(c).assign(&x.row(chosen));
            for (i, row) in x.rows().into_iter().enumerate() {
                let d = squared_distance(row, centroids.row(c));
                if d < closest[i] {
                    closest[i] = d;
                }
            }
        }
        centroids
    }

    fn lloyd(
        x: ArrayView2<f64>,
        mut centroids: Array2<f64>,
        max_iterations: usize,
        shift_tolerance: f64,
    ) -> KMeansRun {
        let (n, p) = x.dim();
        let k = centroids.nrows();
        let mut labels = vec![0usize; n];
        let mut iterations = 0;

        for iteration in 1..=max_iterations {
            iterations = iteration;

            // --- 1. Assignment step ---
            let mut distances = vec![0.0; n];
            for (i, row) in x.rows().into_iter().enumerate() {
                let (label, d) = nearest_centroid(row, centroids.view());
                labels[i] = label;
                distances[i] = d;
            }

            // --- 2. Update step ---
            let mut sums = Array2::<f64>::zeros((k, p));
            let mut counts = vec![0usize; k];
            for (i, row) in x.rows().into_iter().enumerate() {
                let mut target = sums.row_mut(labels[i]);
                target += &row;
                counts[labels[i]] += 1;
            }

            let mut updated = centroids.clone();
            for c in 0..k {
                if counts[c] > 0 {
                    let mean = &sums.row(c) / counts[c] as f64;
                    updated.row_mut(c).assign(&mean);
                } else {
                    // Reseed an empty cluster at the point worst served by its centroid.
                    let far = distances
                        .iter()
                        .enumerate()
                        .fold((0, f64::NEG_INFINITY), |best, (i, &d)| {
                            if d > best.1 { (i, d) } else { best }
                        })
                        .0;
                    log::warn!("k-means cluster {c} became empty; reseeding at row {far}");
                    updated.row_mut(c).assign(&x.row(far));
                    distances[far] = 0.0;
                }
            }

            // --- 3. Convergence check ---
            let shift: f64 = (&updated - &centroids).mapv(|v| v * v).sum();
            centroids = updated;
            if shift <= shift_tolerance {
                break;
            }
        }

        // Final assignment against the converged centroids.
        let mut inertia = 0.0;
        for (i, row) in x.rows().into_iter().enumerate() {
            let (label, d) = nearest_centroid(row, centroids.view());
            labels[i] = label;
            inertia += d;
        }

        KMeansRun {
            centroids,
            labels,
            inertia,
            iterations,
        }
    }

    pub(super) fn kmeans(x: ArrayView2<f64>, config: &ClusterConfig, rng: &mut StdRng) -> KMeansRun {
        // The tolerance is relative to the average per-column variance of the data.
        let mean_variance = x.var_axis(Axis(0), 0.0).mean().unwrap_or(0.0);
        let shift_tolerance = config.tolerance * mean_variance;

        let mut best: Option<KMeansRun> = None;
        for _ in 0..config.n_init {
            let seeds = kmeans_plus_plus(x, config.n_clusters, rng);
            let run = lloyd(x, seeds, config.max_iterations, shift_tolerance);
            let better = match &best {
                Some(current) => run.inertia < current.inertia,
                None => true,
            };
            if better {
                best = Some(run);
            }
        }

        // n_init >= 1 is enforced by config validation.
        best.unwrap_or_else(|| {
            let seeds = kmeans_plus_plus(x, config.n_clusters, rng);
            lloyd(x, seeds, config.max_iterations, shift_tolerance)
        })
    }

    /// `log(w_k) + log N(x_i | mu_k, diag(var_k))` for every row and component.
    pub(super) fn weighted_log_density(
        x: ArrayView2<f64>,
        weights: ArrayView1<f64>,
        means: ArrayView2<f64>,
        variances: ArrayView2<f64>,
    ) -> Array2<f64> {
        let n = x.nrows();
        let k = means.nrows();
        let log_two_pi = (2.0 * std::f64::consts::PI).ln();
        let mut out = Array2::zeros((n, k));
        for c in 0..k {
            let mean = means.row(c);
            let var = variances.row(c);
            let log_norm: f64 = var.iter().map(|v| log_two_pi + v.ln()).sum::<f64>();
            let log_weight = weights[c].ln();
            for (i, row) in x.rows().into_iter().enumerate() {
                let quad: f64 = row
                    .iter()
                    .zip(mean.iter())
                    .zip(var.iter())
                    .map(|((xi, mi), vi)| (xi - mi) * (xi - mi) / vi)
                    .sum();
                out[[i, c]] = log_weight - 0.5 * (log_norm + quad);
            }
        }
        out
    }

    fn log_sum_exp(row: ArrayView1<f64>) -> f64 {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return max;
        }
        max + row.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
    }

    /// M-step: weights, means and floored variances from the responsibilities.
    fn maximize(x: ArrayView2<f64>, resp: &Array2<f64>) -> (Array1<f64>, Array2<f64>, Array2<f64>) {
        let n = x.nrows() as f64;
        let nk = resp.sum_axis(Axis(0)) + 10.0 * f64::EPSILON;
        let weights = &nk / n;
        let nk_col = nk.view().insert_axis(Axis(1));
        let means = resp.t().dot(&x) / &nk_col;
        let second_moment = resp.t().dot(&x.mapv(|v| v * v)) / &nk_col;
        let variances = (second_moment - &means.mapv(|v| v * v)).mapv(|v| v.max(0.0) + VARIANCE_FLOOR);
        (weights, means, variances)
    }

    pub(super) fn gaussian_mixture(
        x: ArrayView2<f64>,
        init: &KMeansRun,
        config: &ClusterConfig,
    ) -> ClusterModel {
        let n = x.nrows();
        let k = config.n_clusters;

        // Initial responsibilities are the hard k-means assignments.
        let mut resp = one_hot(&init.labels, k);
        let (mut weights, mut means, mut variances) = maximize(x, &resp);

        let mut previous_bound = f64::NEG_INFINITY;
        for iteration in 1..=config.max_iterations {
            // --- E-step ---
            let log_prob = weighted_log_density(x, weights.view(), means.view(), variances.view());
            let mut bound = 0.0;
            for (i, row) in log_prob.rows().into_iter().enumerate() {
                let lse = log_sum_exp(row);
                bound += lse;
                for c in 0..k {
                    resp[[i, c]] = (log_prob[[i, c]] - lse).exp();
                }
            }
            bound /= n as f64;

            // --- M-step ---
            (weights, means, variances) = maximize(x, &resp);

            if (bound - previous_bound).abs() < config.tolerance {
                log::debug!("Gaussian mixture converged after {iteration} EM iterations (lower bound {bound:.6})");
                break;
            }
            previous_bound = bound;
        }

        ClusterModel::Gmm {
            weights,
            means,
            variances,
        }
    }

    pub(super) fn parameters_are_finite(model: &ClusterModel) -> bool {
        match model {
            ClusterModel::KMeans { centroids } => centroids.iter().all(|v| v.is_finite()),
            ClusterModel::Gmm {
                weights,
                means,
                variances,
            } => weights
                .iter()
                .chain(means.iter())
                .chain(variances.iter())
                .all(|v| v.is_finite()),
        }
    }
}
