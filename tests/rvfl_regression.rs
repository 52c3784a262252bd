use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rvfl::cluster::{ClusterAugmenter, ClusterConfig, ClusterMethod};
use rvfl::config::RvflConfig;
use rvfl::estimate::EstimatorConfig;
use rvfl::matrix::min_eigenvalue;
use rvfl::metrics::Metric;
use rvfl::model::{FittedRvfl, Rvfl};
use rvfl::pipeline::cook_training_set;
use rvfl::scaling::ScalingMethod;

fn linear_data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.1).unwrap();
    let x = Array2::from_shape_fn((n, 2), |_| rng.gen_range(-1.0..1.0));
    let y = x
        .rows()
        .into_iter()
        .map(|r| 1.5 * r[0] - 0.7 * r[1] + 0.3 + noise.sample(&mut rng))
        .collect();
    (x, y)
}

#[test]
fn four_point_plane_is_recovered_exactly_by_least_squares() {
    let x = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
    let y = array![0.0, 1.0, 1.0, 2.0];
    let config = RvflConfig {
        n_hidden_features: 0,
        direct_link: true,
        estimator: EstimatorConfig::LeastSquares,
        ..Default::default()
    };

    let cooked = cook_training_set(&config, x.view(), y.view(), None).unwrap();
    let standardized = array![[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]];
    assert_abs_diff_eq!(cooked.design, standardized, epsilon = 1e-12);

    let fitted = Rvfl::new(config).unwrap().fit(x.view(), y.view()).unwrap();
    assert_abs_diff_eq!(fitted.beta().to_owned(), array![0.5, 0.5], epsilon = 1e-10);
    let prediction = fitted.predict(x.view()).unwrap();
    assert_abs_diff_eq!(prediction.mean, y, epsilon = 1e-6);
    assert!(prediction.std.is_none());
}

#[test]
fn posterior_covariance_stays_positive_semidefinite() {
    for seed in 0..100 {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((25, 3), |_| rng.gen_range(-2.0..2.0));
        let y = Array1::from_shape_fn(25, |_| rng.gen_range(-1.0..1.0));
        let estimator = if seed % 2 == 0 {
            EstimatorConfig::default()
        } else {
            EstimatorConfig::BayesianRidge { s: 0.5, sigma: 0.1 }
        };
        let fitted = Rvfl::new(RvflConfig {
            n_hidden_features: 10,
            estimator,
            ..Default::default()
        })
        .unwrap()
        .fit(x.view(), y.view())
        .unwrap();

        let covariance = fitted.posterior_covariance().unwrap();
        assert_eq!(covariance, covariance.t(), "seed {seed}: covariance not symmetric");
        let smallest = min_eigenvalue(covariance).unwrap();
        assert!(smallest > -1e-10, "seed {seed}: min eigenvalue {smallest}");
    }
}

#[test]
fn predictive_std_widens_away_from_training_centroid() {
    let (x, y) = linear_data(200, 11);
    let centroid = x.mean_axis(ndarray::Axis(0)).unwrap();
    let direction = array![0.6, 0.8];
    let ray = Array2::from_shape_fn((8, 2), |(i, j)| centroid[j] + 0.5 * i as f64 * direction[j]);

    for estimator in [
        EstimatorConfig::BayesianRidge { s: 1.0, sigma: 0.1 },
        EstimatorConfig::GeneralizedBayesianRidge {
            s1: 1.0,
            s2: 0.5,
            sigma: 0.1,
            return_std: true,
        },
    ] {
        let fitted = Rvfl::new(RvflConfig {
            n_hidden_features: 0,
            estimator,
            ..Default::default()
        })
        .unwrap()
        .fit(x.view(), y.view())
        .unwrap();

        let std = fitted.predict(ray.view()).unwrap().std.unwrap();
        assert!(std[0] >= 0.1 - 1e-12);
        for i in 1..std.len() {
            assert!(
                std[i] > std[i - 1],
                "std did not grow at step {i}: {} -> {}",
                std[i - 1],
                std[i]
            );
        }
    }
}

#[test]
fn single_row_prediction_matches_batch_prediction() {
    let (x, y) = linear_data(60, 12);
    let fitted = Rvfl::new(RvflConfig {
        n_hidden_features: 7,
        clustering: ClusterConfig {
            n_clusters: 3,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap()
    .fit(x.view(), y.view())
    .unwrap();

    let batch = fitted.predict(x.view()).unwrap();
    let batch_std = batch.std.unwrap();
    for i in [0, 17, 59] {
        let single = fitted.predict_one(x.row(i)).unwrap();
        assert_abs_diff_eq!(single.mean, batch.mean[i], epsilon = 1e-12);
        assert_abs_diff_eq!(single.std.unwrap(), batch_std[i], epsilon = 1e-12);
    }
}

#[test]
fn refitting_with_the_same_configuration_is_deterministic() {
    let (x, y) = linear_data(40, 13);
    let model = Rvfl::new(RvflConfig {
        n_hidden_features: 12,
        dropout: 0.2,
        clustering: ClusterConfig {
            n_clusters: 2,
            method: ClusterMethod::Gmm,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    let first = model.fit(x.view(), y.view()).unwrap();
    let second = model.fit(x.view(), y.view()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn cluster_membership_is_one_hot() {
    let (x, _) = linear_data(50, 14);
    let config = ClusterConfig {
        n_clusters: 4,
        ..Default::default()
    };
    let (augmenter, encoded) = ClusterAugmenter::fit(x.view(), &config, ScalingMethod::Standard).unwrap();
    assert_eq!(encoded.ncols(), 4);
    for row in encoded.rows() {
        assert_eq!(row.sum(), 1.0);
        assert!(row.iter().all(|&v| v == 0.0 || v == 1.0));
    }
    assert_eq!(augmenter.encode(x.view()).unwrap(), encoded);
}

#[test]
fn disabled_clustering_leaves_no_cluster_state() {
    let (x, y) = linear_data(30, 15);
    let fitted = Rvfl::new(RvflConfig::default())
        .unwrap()
        .fit(x.view(), y.view())
        .unwrap();
    assert!(fitted.pipeline.clusters.is_none());
    assert_eq!(fitted.pipeline.layout.n_clusters, 0);
    assert_eq!(fitted.pipeline.layout.n_augmented(), 2);
    let prediction = fitted.predict(x.view()).unwrap();
    assert_eq!(prediction.mean.len(), 30);
}

#[test]
fn tsv_train_save_load_predict_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    use rvfl::data::{load_prediction_data, load_training_data, write_predictions};
    use std::io::Write;
    use tempfile::NamedTempFile;

    let (x, y) = linear_data(40, 16);
    let mut train_file = NamedTempFile::new()?;
    writeln!(train_file, "u\ttarget\tv")?;
    for (row, target) in x.rows().into_iter().zip(y.iter()) {
        writeln!(train_file, "{}\t{}\t{}", row[0], target, row[1])?;
    }
    train_file.flush()?;
    let train_path = train_file.path().to_str().ok_or("temp path is not UTF-8")?;

    let data = load_training_data(train_path, "target")?;
    let fitted = Rvfl::new(RvflConfig::default())?
        .fit(data.x.view(), data.y.as_ref().ok_or("missing target")?.view())?
        .with_feature_names(data.feature_names.clone())?;

    let model_file = NamedTempFile::new()?;
    let model_path = model_file.path().to_str().ok_or("temp path is not UTF-8")?;
    fitted.save(model_path)?;
    let loaded = FittedRvfl::load(model_path)?;
    assert_eq!(loaded.feature_names, vec!["u", "v"]);

    let test = load_prediction_data(train_path, &loaded.feature_names, Some("target"))?;
    let prediction = loaded.predict(test.x.view())?;
    assert_eq!(prediction, fitted.predict(data.x.view())?);

    let r2 = loaded.score(test.x.view(), test.y.as_ref().ok_or("missing target")?.view(), Metric::R2)?;
    assert!(r2 > 0.9, "r2 on a noisy plane was {r2}");

    let out_file = NamedTempFile::new()?;
    let out_path = out_file.path().to_str().ok_or("temp path is not UTF-8")?;
    write_predictions(out_path, &prediction)?;
    let written = std::fs::read_to_string(out_path)?;
    assert!(written.starts_with("mean\tstd\n"));
    assert_eq!(written.lines().count(), 41);
    Ok(())
}
