#![deny(dead_code)]
#![deny(unused_imports)]

pub mod activation;
pub mod cluster;
pub mod config;
pub mod data;
pub mod estimate;
pub mod matrix;
pub mod metrics;
pub mod model;
pub mod nodes;
pub mod pipeline;
pub mod sampling;
pub mod scaling;

pub use config::RvflConfig;
pub use model::{FittedRvfl, Prediction, Rvfl};
