#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use ndarray::Axis;
use std::process;

use rvfl::activation::Activation;
use rvfl::cluster::ClusterMethod;
use rvfl::config::RvflConfig;
use rvfl::data::{load_prediction_data, load_training_data, write_predictions};
use rvfl::estimate::EstimatorConfig;
use rvfl::metrics::Metric;
use rvfl::model::{FittedRvfl, Rvfl};
use rvfl::nodes::NodeMethod;
use rvfl::sampling::subsample;
use rvfl::scaling::ScalingMethod;

#[derive(Clone, Copy, ValueEnum)]
pub enum EstimatorCli {
    /// Ordinary least squares, no predictive uncertainty
    Ols,
    /// Bayesian ridge with an isotropic prior
    BayesianRidge,
    /// Bayesian ridge with separate prior variances for direct and hidden blocks
    Generalized,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Path to training TSV file with a header row
    pub training_data: String,

    /// Name of the target column; all other columns are features
    #[arg(long, default_value = "y")]
    pub target: String,

    /// Base configuration (TOML). Flags below override individual fields
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Width of the hidden layer (0 disables it)
    #[arg(long, value_name = "N")]
    pub n_hidden: Option<usize>,

    /// Hidden-layer activation: relu, tanh, sigmoid, prelu or elu
    #[arg(long)]
    pub activation: Option<Activation>,

    /// Slope for prelu, scale for elu
    #[arg(long)]
    pub activation_param: Option<f64>,

    /// Hidden weight generator: sobol, hammersley, halton or uniform
    #[arg(long)]
    pub node_method: Option<NodeMethod>,

    /// Do not prepend a bias column before the hidden projection
    #[arg(long)]
    pub no_bias: bool,

    /// Do not feed the inputs directly to the output layer
    #[arg(long)]
    pub no_direct_link: bool,

    /// Fraction of hidden activations dropped during training
    #[arg(long)]
    pub dropout: Option<f64>,

    /// Number of clusters for the membership features (0 disables clustering)
    #[arg(long, value_name = "K")]
    pub n_clusters: Option<usize>,

    /// Clustering algorithm: kmeans or gmm
    #[arg(long)]
    pub cluster_method: Option<ClusterMethod>,

    /// Scaling applied to the final design matrix: std or minmax
    #[arg(long)]
    pub output_scaling: Option<ScalingMethod>,

    /// Seed for the uniform node generator and dropout
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output-layer estimator
    #[arg(long, value_enum)]
    pub estimator: Option<EstimatorCli>,

    /// Prior standard deviation for bayesian-ridge
    #[arg(long)]
    pub s: Option<f64>,

    /// Prior standard deviation of the direct block for generalized
    #[arg(long)]
    pub s1: Option<f64>,

    /// Prior standard deviation of the hidden block for generalized
    #[arg(long)]
    pub s2: Option<f64>,

    /// Observation noise standard deviation for both Bayesian estimators
    #[arg(long)]
    pub sigma: Option<f64>,

    /// Skip the posterior covariance for generalized (no predictive std)
    #[arg(long)]
    pub no_std: bool,

    /// Train on a stratified subsample of this fraction of the rows
    #[arg(long, value_name = "FRACTION")]
    pub row_sample: Option<f64>,

    /// Where to write the trained model
    #[arg(long, default_value = "model.toml")]
    pub output: String,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to TSV file containing the model's feature columns
    pub test_data: String,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Where to write the predictions
    #[arg(long, default_value = "predictions.tsv")]
    pub output: String,
}

#[derive(Args)]
pub struct ScoreArgs {
    /// Path to TSV file containing the model's feature columns and the target
    pub test_data: String,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Name of the target column
    #[arg(long, default_value = "y")]
    pub target: String,

    /// Metric name, e.g. r2 or neg_mean_squared_error
    #[arg(long, default_value = "r2")]
    pub metric: Metric,
}

#[derive(Parser)]
#[command(
    name = "rvfl",
    about = "Random vector functional link regression",
    long_about = "Fits RVFL networks with quasi-random hidden layers and Bayesian ridge \
                 output layers, and serves predictions with uncertainty from saved models."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model on a TSV file and save it as TOML
    Train(TrainArgs),
    /// Predict the mean (and std when available) for every row of a TSV file
    Predict(PredictArgs),
    /// Evaluate a saved model against observed targets
    Score(ScoreArgs),
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    println!(
        "Training RVFL with {} hidden features ({}, {} nodes) and estimator '{}'",
        config.n_hidden_features,
        config.activation,
        config.node_method,
        config.estimator.name()
    );
    if config.node_method.is_seeded() {
        println!("Hidden weights drawn with seed {}", config.seed);
    }

    println!("Loading training data from: {}", args.training_data);
    let data = load_training_data(&args.training_data, &args.target)?;
    let mut x = data.x;
    let mut y = data
        .y
        .ok_or_else(|| format!("Target column '{}' produced no values", args.target))?;
    println!(
        "Loaded {} samples with {} features",
        y.len(),
        data.feature_names.len()
    );

    if let Some(fraction) = args.row_sample {
        let indices = subsample(y.view(), fraction, config.seed)?;
        x = x.select(Axis(0), &indices);
        y = y.select(Axis(0), &indices);
        println!("Training on a stratified subsample of {} rows", y.len());
    }

    let fitted = Rvfl::new(config)?
        .fit(x.view(), y.view())?
        .with_feature_names(data.feature_names)?;
    println!("Generalized cross-validation error: {:.6}", fitted.gcv());

    fitted.save(&args.output)?;
    println!("Model saved to: {}", args.output);
    Ok(())
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model);
    let model = FittedRvfl::load(&args.model)?;
    require_feature_names(&model)?;

    println!("Loading test data from: {}", args.test_data);
    let data = load_prediction_data(&args.test_data, &model.feature_names, None)?;
    println!("Loaded {} samples for prediction", data.x.nrows());

    let prediction = model.predict(data.x.view())?;
    write_predictions(&args.output, &prediction)?;
    println!("Predictions saved to: {}", args.output);
    Ok(())
}

pub fn score(args: ScoreArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = FittedRvfl::load(&args.model)?;
    require_feature_names(&model)?;

    let data = load_prediction_data(&args.test_data, &model.feature_names, Some(&args.target))?;
    let y = data
        .y
        .ok_or_else(|| format!("Target column '{}' produced no values", args.target))?;
    let value = model.score(data.x.view(), y.view(), args.metric)?;
    println!("{}\t{value}", args.metric);
    Ok(())
}

/// Starts from `--config` (or the defaults) and applies every flag that was given.
fn build_config(args: &TrainArgs) -> Result<RvflConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RvflConfig::from_toml_file(path)?,
        None => RvflConfig::default(),
    };

    if let Some(n) = args.n_hidden {
        config.n_hidden_features = n;
    }
    if let Some(activation) = args.activation {
        config.activation = activation;
    }
    if let Some(a) = args.activation_param {
        config.activation_param = a;
    }
    if let Some(method) = args.node_method {
        config.node_method = method;
    }
    if args.no_bias {
        config.bias = false;
    }
    if args.no_direct_link {
        config.direct_link = false;
    }
    if let Some(dropout) = args.dropout {
        config.dropout = dropout;
    }
    if let Some(k) = args.n_clusters {
        config.clustering.n_clusters = k;
    }
    if let Some(method) = args.cluster_method {
        config.clustering.method = method;
    }
    if let Some(method) = args.output_scaling {
        config.scaling.output = method;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    config.estimator = estimator_from_args(args, config.estimator);
    config.validate()?;
    Ok(config)
}

fn estimator_from_args(args: &TrainArgs, base: EstimatorConfig) -> EstimatorConfig {
    let base = match (args.estimator, base) {
        (None, base) => base,
        (Some(EstimatorCli::Ols), _) => EstimatorConfig::LeastSquares,
        (Some(EstimatorCli::BayesianRidge), base @ EstimatorConfig::BayesianRidge { .. }) => base,
        (Some(EstimatorCli::BayesianRidge), _) => EstimatorConfig::BayesianRidge {
            s: 0.1,
            sigma: 0.05,
        },
        (Some(EstimatorCli::Generalized), base @ EstimatorConfig::GeneralizedBayesianRidge { .. }) => {
            base
        }
        (Some(EstimatorCli::Generalized), _) => EstimatorConfig::default(),
    };

    match base {
        EstimatorConfig::LeastSquares => EstimatorConfig::LeastSquares,
        EstimatorConfig::BayesianRidge { s, sigma } => EstimatorConfig::BayesianRidge {
            s: args.s.unwrap_or(s),
            sigma: args.sigma.unwrap_or(sigma),
        },
        EstimatorConfig::GeneralizedBayesianRidge {
            s1,
            s2,
            sigma,
            return_std,
        } => EstimatorConfig::GeneralizedBayesianRidge {
            s1: args.s1.unwrap_or(s1),
            s2: args.s2.unwrap_or(s2),
            sigma: args.sigma.unwrap_or(sigma),
            return_std: return_std && !args.no_std,
        },
    }
}

fn require_feature_names(model: &FittedRvfl) -> Result<(), Box<dyn std::error::Error>> {
    if model.feature_names.is_empty() {
        return Err("Model file carries no feature names; it was not trained from a TSV file".into());
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Score(args)) => score(args),
        None => {
            let mut help = Cli::command();
            match help.print_help() {
                Ok(()) => {
                    println!();
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
