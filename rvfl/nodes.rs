//! # Hidden-Layer Node Generation
//!
//! The hidden layer of an RVFL network is a fixed projection: its weights are
//! never trained, only generated. This module produces those weights as a
//! point set in the unit hypercube, one point per hidden node and one
//! coordinate per input column.
//!
//! Three of the four methods are deterministic low-discrepancy sequences and
//! ignore the seed entirely, so two models trained with the same inputs share
//! bit-identical hidden layers. Only `Uniform` consumes the seed.

use crate::config::ConfigError;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Strategy used to place the hidden-layer weight vectors.
/// This is part of the public API and is saved in the model configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMethod {
    /// Sobol sequence with Bratley-Fox direction numbers, in Gray-code order.
    Sobol,
    /// Hammersley set: a regular grid on the first axis, radical inverses on the rest.
    Hammersley,
    /// Halton sequence: radical inverses in successive prime bases.
    Halton,
    /// Pseudo-random U[0, 1) draws from a seeded `StdRng`.
    Uniform,
}

impl NodeMethod {
    pub fn name(&self) -> &'static str {
        match self {
            NodeMethod::Sobol => "sobol",
            NodeMethod::Hammersley => "hammersley",
            NodeMethod::Halton => "halton",
            NodeMethod::Uniform => "uniform",
        }
    }

    /// Whether the generated points depend on the seed.
    pub fn is_seeded(&self) -> bool {
        matches!(self, NodeMethod::Uniform)
    }
}

impl fmt::Display for NodeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NodeMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sobol" => Ok(NodeMethod::Sobol),
            "hammersley" => Ok(NodeMethod::Hammersley),
            "halton" => Ok(NodeMethod::Halton),
            "uniform" => Ok(NodeMethod::Uniform),
            other => Err(ConfigError::UnknownNodeMethod(other.to_string())),
        }
    }
}

/// Errors raised while generating a node matrix.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node generation requires at least one dimension.")]
    ZeroDimensions,

    #[error("The Sobol generator supports at most {max} dimensions, but {requested} were requested.")]
    SobolDimensionTooLarge { requested: usize, max: usize },

    #[error("The Sobol generator supports at most {max} points, but {requested} were requested.")]
    SobolTooManyPoints { requested: usize, max: usize },
}

/// Generates the hidden-layer node matrix.
///
/// # Arguments
///
/// * `method`: The point-set construction. Only `NodeMethod::Uniform` reads `seed`.
/// * `n_dims`: Number of coordinates per point. For a hidden layer this is the
///   number of (possibly cluster-augmented) input columns, plus one when a bias
///   column is prepended.
/// * `n_points`: Number of points, i.e. the number of hidden nodes.
/// * `seed`: Seed for the pseudo-random method.
///
/// # Returns
///
/// An `Array2<f64>` of shape `[n_points, n_dims]` with entries in `[0, 1)`.
/// Row `i` is the weight vector of hidden node `i`; the projection matrix used
/// by the feature pipeline is its transpose.
pub fn generate(
    method: NodeMethod,
    n_dims: usize,
    n_points: usize,
    seed: u64,
) -> Result<Array2<f64>, NodeError> {
    if n_dims == 0 {
        return Err(NodeError::ZeroDimensions);
    }

    match method {
        NodeMethod::Sobol => internal::sobol(n_dims, n_points),
        NodeMethod::Halton => Ok(internal::halton(n_dims, n_points)),
        NodeMethod::Hammersley => Ok(internal::hammersley(n_dims, n_points)),
        NodeMethod::Uniform => Ok(internal::uniform(n_dims, n_points, seed)),
    }
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Bit width of the Sobol direction numbers.
    const SOBOL_BITS: usize = 30;

    /// Primitive polynomials, one per dimension, with the leading and trailing
    /// coefficients included in the integer encoding.
    const SOBOL_POLYNOMIALS: [u32; 40] = [
        1, 3, 7, 11, 13, 19, 25, 37, 59, 47, 61, 55, 41, 67, 97, 91, 109, 103, 115, 131, 193, 137,
        145, 143, 241, 157, 185, 167, 229, 171, 213, 191, 253, 203, 211, 239, 247, 285, 369, 299,
    ];

    /// Initial direction numbers. Column `k` lists the values for the dimensions
    /// whose polynomial degree exceeds `k`, starting at `SOBOL_INIT_START[k]`.
    const SOBOL_INIT_START: [usize; 8] = [0, 2, 3, 5, 7, 13, 19, 37];

    const SOBOL_INIT: [&[u32]; 8] = [
        &[1; 40],
        &[
            1, 3, 1, 3, 1, 3, 3, 1, 3, 1, 3, 1, 3, 1, 1, 3, 1, 3, 1, 3, 1, 3, 3, 1, 3, 1, 3, 1, 3,
            1, 1, 3, 1, 3, 1, 3, 1, 3,
        ],
        &[
            7, 5, 1, 3, 3, 7, 5, 5, 7, 7, 1, 3, 3, 7, 5, 1, 1, 5, 3, 3, 1, 7, 5, 1, 3, 3, 7, 5, 1,
            1, 5, 7, 7, 5, 1, 3, 3,
        ],
        &[
            1, 7, 9, 13, 11, 1, 3, 7, 9, 5, 13, 13, 11, 3, 15, 5, 3, 15, 7, 9, 13, 9, 1, 11, 7, 5,
            15, 1, 15, 11, 5, 3, 1, 7, 9,
        ],
        &[
            9, 3, 27, 15, 29, 21, 23, 19, 11, 25, 7, 13, 17, 1, 25, 29, 3, 31, 11, 5, 23, 27, 19,
            21, 5, 1, 17, 13, 7, 15, 9, 31, 9,
        ],
        &[
            37, 33, 7, 5, 11, 39, 63, 27, 17, 15, 23, 29, 3, 21, 13, 31, 25, 9, 49, 33, 19, 29, 11,
            19, 27, 15, 25,
        ],
        &[
            13, 33, 115, 41, 79, 17, 29, 119, 75, 73, 105, 7, 59, 65, 21, 3, 113, 61, 89, 45, 107,
        ],
        &[7, 23, 39],
    ];

    pub(super) const SOBOL_MAX_DIMS: usize = SOBOL_POLYNOMIALS.len();

    /// Degree of a polynomial encoded as an integer with its leading bit set.
    fn polynomial_degree(poly: u32) -> usize {
        (u32::BITS - 1 - poly.leading_zeros()) as usize
    }

    /// Builds the scaled direction numbers `v[dim][bit]` for the first `n_dims` dimensions.
    pub(super) fn sobol_direction_numbers(n_dims: usize) -> Vec<[u64; SOBOL_BITS]> {
        let mut directions = vec![[0u64; SOBOL_BITS]; n_dims];

        for (dim, v) in directions.iter_mut().enumerate() {
            let poly = SOBOL_POLYNOMIALS[dim];
            let degree = polynomial_degree(poly);

            if degree == 0 {
                // The first dimension is the van der Corput sequence in base 2.
                v.iter_mut().for_each(|value| *value = 1);
            } else {
                for (k, column) in SOBOL_INIT.iter().enumerate().take(degree) {
                    v[k] = u64::from(column[dim - SOBOL_INIT_START[k]]);
                }

                // includes[k] is the coefficient of x^(degree - 1 - k).
                let includes: Vec<bool> = (0..degree)
                    .map(|k| (poly >> (degree - 1 - k)) & 1 == 1)
                    .collect();

                for j in degree..SOBOL_BITS {
                    let mut next = v[j - degree];
                    let mut shift = 1u64;
                    for (k, &included) in includes.iter().enumerate() {
                        shift <<= 1;
                        if included {
                            next ^= shift * v[j - k - 1];
                        }
                    }
                    v[j] = next;
                }
            }

            // Scale column j by 2^(SOBOL_BITS - 1 - j) so every value is a binary fraction.
            for (j, value) in v.iter_mut().enumerate() {
                *value <<= SOBOL_BITS - 1 - j;
            }
        }

        directions
    }

    pub(super) fn sobol(n_dims: usize, n_points: usize) -> Result<Array2<f64>, NodeError> {
        if n_dims > SOBOL_MAX_DIMS {
            return Err(NodeError::SobolDimensionTooLarge {
                requested: n_dims,
                max: SOBOL_MAX_DIMS,
            });
        }
        let max_points = (1usize << SOBOL_BITS) - 1;
        if n_points > max_points {
            return Err(NodeError::SobolTooManyPoints {
                requested: n_points,
                max: max_points,
            });
        }

        let directions = sobol_direction_numbers(n_dims);
        let scale = 1.0 / (1u64 << SOBOL_BITS) as f64;
        let mut state = vec![0u64; n_dims];
        let mut points = Array2::zeros((n_points, n_dims));

        // Index 0 is the origin; it is consumed to advance the state but never emitted,
        // otherwise the first hidden node would have an all-zero weight vector.
        for index in 0..=n_points {
            if index > 0 {
                for (dim, &q) in state.iter().enumerate() {
                    points[[index - 1, dim]] = q as f64 * scale;
                }
            }
            let bit = (!index).trailing_zeros() as usize;
            for (dim, q) in state.iter_mut().enumerate() {
                *q ^= directions[dim][bit];
            }
        }

        Ok(points)
    }

    /// Van der Corput radical inverse of `index` in the given base.
    pub(super) fn radical_inverse(mut index: usize, base: usize) -> f64 {
        let inv_base = 1.0 / base as f64;
        let mut factor = inv_base;
        let mut result = 0.0;
        while index > 0 {
            result += (index % base) as f64 * factor;
            index /= base;
            factor *= inv_base;
        }
        result
    }

    /// Returns the first `count` prime numbers.
    pub(super) fn first_primes(count: usize) -> Vec<usize> {
        let mut primes: Vec<usize> = Vec::with_capacity(count);
        let mut candidate = 2usize;
        while primes.len() < count {
            if primes
                .iter()
                .take_while(|&&p| p * p <= candidate)
                .all(|&p| candidate % p != 0)
            {
                primes.push(candidate);
            }
            candidate += 1;
        }
        primes
    }

    pub(super) fn halton(n_dims: usize, n_points: usize) -> Array2<f64> {
        let primes = first_primes(n_dims);
        // The sequence starts at index 1 to skip the origin.
        Array2::from_shape_fn((n_points, n_dims), |(i, j)| radical_inverse(i + 1, primes[j]))
    }

    pub(super) fn hammersley(n_dims: usize, n_points: usize) -> Array2<f64> {
        let primes = first_primes(n_dims.saturating_sub(1));
        let n = n_points as f64;
        Array2::from_shape_fn((n_points, n_dims), |(i, j)| {
            if j == 0 {
                (i as f64 + 0.5) / n
            } else {
                radical_inverse(i + 1, primes[j - 1])
            }
        })
    }

    pub(super) fn uniform(n_dims: usize, n_points: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n_points, n_dims), |_| rng.gen_range(0.0..1.0))
    }
}
