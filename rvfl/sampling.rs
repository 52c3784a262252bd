//! Row subsampling and class rebalancing helpers.
//!
//! Both functions return row indices into the original data, so callers can
//! select matching rows of `X` and `y` with `select(Axis(0), &indices)`.

use ndarray::ArrayView1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Row sampling fraction must lie in (0, 1], got {0}.")]
    InvalidFraction(f64),

    #[error("Cannot sample from an empty target vector.")]
    Empty,

    #[error("Rebalancing requires a categorical (integer-valued) target.")]
    NotCategorical,

    #[error("The target vector contains NaN or infinite values.")]
    NonFiniteTarget,
}

/// Direction of class rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rebalance {
    /// Every class is resampled to the size of the smallest class.
    Down,
    /// Every class is resampled to the size of the largest class.
    Up,
}

/// True when every value is a finite integer, i.e. `y` can be read as class labels.
pub fn is_categorical(y: ArrayView1<f64>) -> bool {
    y.iter().all(|v| v.is_finite() && v.fract() == 0.0)
}

/// Stratified row subsampling with replacement.
///
/// Observations are grouped into strata: the distinct labels for a categorical
/// target, histogram bins otherwise. Each stratum of size `m > 1` contributes
/// `floor(ceil(n * row_sample) * m / n)` draws with replacement from its
/// members. A stratum with a single member contributes that one index.
pub fn subsample(
    y: ArrayView1<f64>,
    row_sample: f64,
    seed: u64,
) -> Result<Vec<usize>, SamplingError> {
    if !(row_sample > 0.0 && row_sample <= 1.0) {
        return Err(SamplingError::InvalidFraction(row_sample));
    }
    if y.is_empty() {
        return Err(SamplingError::Empty);
    }
    if !y.iter().all(|v| v.is_finite()) {
        return Err(SamplingError::NonFiniteTarget);
    }

    let n = y.len();
    let n_target = (n as f64 * row_sample).ceil() as usize;
    let strata = if is_categorical(y) {
        internal::group_by_label(y)
    } else {
        internal::group_by_histogram(y)
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices = Vec::with_capacity(n_target);
    for members in strata.iter().filter(|m| !m.is_empty()) {
        if members.len() == 1 {
            indices.push(members[0]);
            continue;
        }
        let draws = n_target * members.len() / n;
        indices.extend((0..draws).map(|_| members[rng.gen_range(0..members.len())]));
    }

    log::debug!(
        "Subsampled {} of {} rows across {} strata",
        indices.len(),
        n,
        strata.len()
    );
    Ok(indices)
}

/// Resamples every class of a categorical target to a common size.
pub fn rebalance(
    y: ArrayView1<f64>,
    strategy: Rebalance,
    seed: u64,
) -> Result<Vec<usize>, SamplingError> {
    if y.is_empty() {
        return Err(SamplingError::Empty);
    }
    if !is_categorical(y) {
        return Err(SamplingError::NotCategorical);
    }

    let classes = internal::group_by_label(y);
    let sizes = classes.iter().map(Vec::len);
    let target = match strategy {
        Rebalance::Down => sizes.min(),
        Rebalance::Up => sizes.max(),
    }
    .unwrap_or(0);

    let mut indices = Vec::with_capacity(target * classes.len());
    for members in &classes {
        // Each class draws from a freshly seeded generator.
        let mut rng = StdRng::seed_from_u64(seed);
        indices.extend((0..target).map(|_| members[rng.gen_range(0..members.len())]));
    }
    Ok(indices)
}

mod internal {
    use super::*;

    /// Row indices grouped by distinct label, in ascending label order.
    pub(super) fn group_by_label(y: ArrayView1<f64>) -> Vec<Vec<usize>> {
        let mut labels: Vec<f64> = y.to_vec();
        labels.sort_by(|a, b| a.total_cmp(b));
        labels.dedup();
        let mut groups = vec![Vec::new(); labels.len()];
        for (i, v) in y.iter().enumerate() {
            if let Ok(g) = labels.binary_search_by(|probe| probe.total_cmp(v)) {
                groups[g].push(i);
            }
        }
        groups
    }

    /// Linear-interpolation quantile of sorted data.
    fn quantile(sorted: &[f64], q: f64) -> f64 {
        let h = (sorted.len() - 1) as f64 * q;
        let lo = h.floor() as usize;
        let hi = h.ceil() as usize;
        sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
    }

    /// Number of histogram bins: the smaller bin width of the Sturges and
    /// Freedman-Diaconis rules. Sturges alone is used when the IQR is zero or
    /// when Freedman-Diaconis asks for more bins than there are observations.
    pub(super) fn histogram_bin_count(sorted: &[f64]) -> usize {
        let n = sorted.len() as f64;
        let range = sorted[sorted.len() - 1] - sorted[0];
        if range <= 0.0 {
            return 1;
        }
        let sturges_bins = (n.log2() + 1.0).ceil();
        let iqr = quantile(sorted, 0.75) - quantile(sorted, 0.25);
        let fd_width = 2.0 * iqr * n.powf(-1.0 / 3.0);
        let fd_bins = if fd_width > 0.0 {
            (range / fd_width).ceil()
        } else {
            0.0
        };
        let bins = if fd_bins > n {
            sturges_bins
        } else {
            fd_bins.max(sturges_bins)
        };
        (bins.min(n) as usize).max(1)
    }

    /// Row indices grouped into equal-width bins over the range of `y`.
    /// Bins are left-open except the first, which also holds the minimum.
    pub(super) fn group_by_histogram(y: ArrayView1<f64>) -> Vec<Vec<usize>> {
        let mut sorted = y.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n_bins = histogram_bin_count(&sorted);
        let min = sorted[0];
        let width = (sorted[sorted.len() - 1] - min) / n_bins as f64;

        let mut groups = vec![Vec::new(); n_bins];
        for (i, &v) in y.iter().enumerate() {
            let bin = if width > 0.0 {
                // (v - min) / width lands exactly on an integer at a bin edge;
                // such values belong to the lower bin.
                let position = (v - min) / width;
                (position.ceil() as usize).saturating_sub(1).min(n_bins - 1)
            } else {
                0
            };
            groups[bin].push(i);
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};

    #[test]
    fn test_categorical_detection() {
        assert!(is_categorical(array![0.0, 1.0, 2.0, 1.0].view()));
        assert!(!is_categorical(array![0.0, 1.5].view()));
        assert!(!is_categorical(array![0.0, f64::NAN].view()));
    }

    #[test]
    fn test_categorical_subsample_is_stratified() {
        // 60 zeros, 40 ones.
        let y = Array1::from_shape_fn(100, |i| if i < 60 { 0.0 } else { 1.0 });
        let indices = subsample(y.view(), 0.5, 42).unwrap();
        assert_eq!(indices.len(), 50);
        let zeros = indices.iter().filter(|&&i| i < 60).count();
        assert_eq!(zeros, 30);
    }

    #[test]
    fn test_singleton_class_contributes_its_index() {
        let y = array![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];
        let indices = subsample(y.view(), 0.5, 1).unwrap();
        assert_eq!(indices.iter().filter(|&&i| i == 4).count(), 1);
        // Class 0: floor(4 * 7/8) = 3 draws.
        assert_eq!(indices.len(), 4);
    }

    #[test]
    fn test_continuous_subsample_size_and_range() {
        let y = Array1::from_shape_fn(200, |i| (i as f64 * 0.37).sin() * 3.0 + 0.1);
        let indices = subsample(y.view(), 0.3, 7).unwrap();
        // Each bin contributes its proportional share give or take one draw.
        let sorted: Vec<f64> = {
            let mut v = y.to_vec();
            v.sort_by(|a, b| a.total_cmp(b));
            v
        };
        let bins = internal::histogram_bin_count(&sorted);
        assert!(indices.len() + bins >= 60);
        assert!(indices.len() <= 60 + bins);
        assert!(indices.iter().all(|&i| i < 200));
    }

    #[test]
    fn test_subsample_is_deterministic() {
        let y = Array1::from_shape_fn(50, |i| i as f64 * 1.1);
        assert_eq!(
            subsample(y.view(), 0.4, 3).unwrap(),
            subsample(y.view(), 0.4, 3).unwrap()
        );
    }

    #[test]
    fn test_invalid_fraction() {
        let y = array![1.0, 2.0];
        for fraction in [0.0, -0.5, 1.5, f64::NAN] {
            assert!(matches!(
                subsample(y.view(), fraction, 0),
                Err(SamplingError::InvalidFraction(_))
            ));
        }
    }

    #[test]
    fn test_histogram_bins_cover_every_row() {
        let y = array![0.0, 0.25, 0.5, 0.75, 1.0, 10.0];
        let groups = internal::group_by_histogram(y.view());
        let total: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(total, 6);
        assert!(groups[0].contains(&0));
        assert!(groups.last().unwrap().contains(&5));
    }

    #[test]
    fn test_far_outlier_does_not_explode_bin_count() {
        // Tiny IQR with one distant value: Freedman-Diaconis alone would ask
        // for about 5e18 bins.
        let y = Array1::from_shape_fn(100, |i| {
            if i < 99 { 0.5 + i as f64 * 1e-10 } else { 1e10 }
        });
        let sorted = y.to_vec();
        assert_eq!(internal::histogram_bin_count(&sorted), 8);

        let indices = subsample(y.view(), 0.5, 1).unwrap();
        // 49 draws from the dense bin plus the outlier on its own.
        assert_eq!(indices.len(), 50);
        assert_eq!(indices.iter().filter(|&&i| i == 99).count(), 1);
    }

    #[test]
    fn test_bin_count_never_exceeds_observations() {
        let y = array![0.0, 1.0, 1.0 + 1e-12, 1.0 + 2e-12, 1e6];
        let mut sorted: Vec<f64> = y.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        assert!(internal::histogram_bin_count(&sorted) <= y.len());
        let total: usize = internal::group_by_histogram(y.view()).iter().map(Vec::len).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_rebalance_down_and_up() {
        let y = array![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 2.0];
        let down = rebalance(y.view(), Rebalance::Down, 5).unwrap();
        assert_eq!(down.len(), 6);
        for class in [0.0, 1.0, 2.0] {
            assert_eq!(down.iter().filter(|&&i| y[i] == class).count(), 2);
        }

        let up = rebalance(y.view(), Rebalance::Up, 5).unwrap();
        assert_eq!(up.len(), 12);
        for class in [0.0, 1.0, 2.0] {
            assert_eq!(up.iter().filter(|&&i| y[i] == class).count(), 4);
        }
    }

    #[test]
    fn test_rebalance_rejects_continuous_target() {
        let y = array![0.5, 1.25, 3.0];
        assert!(matches!(
            rebalance(y.view(), Rebalance::Down, 0),
            Err(SamplingError::NotCategorical)
        ));
    }
}
