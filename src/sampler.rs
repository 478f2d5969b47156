//! Sampling over index spaces and validator weights.
//!
//! Uniform sampling without replacement is a lazily-materialized
//! Fisher–Yates shuffle: only the first `count` swaps are performed, against
//! a sparse map of displaced slots, so initialization is O(1) and a sample
//! costs O(count) time and space.

use std::collections::HashMap;

use rand::Rng;

/// Errors from sampling.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SamplerError {
    #[error("sample of {count} out of range for population {length}")]
    OutOfRange { count: usize, length: u64 },
}

/// Uniform sampling without replacement over `[0, length)`.
#[derive(Clone, Debug, Default)]
pub struct Uniform {
    length: u64,
}

impl Uniform {
    pub fn new(length: u64) -> Self {
        Uniform { length }
    }

    /// Draw `count` distinct indices, each subset equally likely.
    pub fn sample<R: Rng>(&self, rng: &mut R, count: usize) -> Result<Vec<u64>, SamplerError> {
        if (count as u64) > self.length {
            return Err(SamplerError::OutOfRange {
                count,
                length: self.length,
            });
        }

        // Sparse view of the shuffled array: absent keys hold their own index.
        let mut drawn: HashMap<u64, u64> = HashMap::with_capacity(count);
        let mut results = Vec::with_capacity(count);
        for i in 0..count as u64 {
            let draw = rng.gen_range(i..self.length);
            let picked = *drawn.get(&draw).unwrap_or(&draw);
            let displaced = *drawn.get(&i).unwrap_or(&i);
            drawn.insert(draw, displaced);
            results.push(picked);
        }
        Ok(results)
    }
}

/// Weighted sampling without replacement over cumulative weights.
///
/// Each draw lands on index `i` with probability `weights[i] / remaining`,
/// then removes that index from the population.
#[derive(Clone, Debug, Default)]
pub struct Weighted {
    weights: Vec<u64>,
    total: u64,
}

impl Weighted {
    pub fn new(weights: Vec<u64>) -> Self {
        let total = weights.iter().sum();
        Weighted { weights, total }
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }

    /// Draw up to `count` distinct indices, weight-proportionally.
    pub fn sample<R: Rng>(&self, rng: &mut R, count: usize) -> Result<Vec<usize>, SamplerError> {
        if count > self.weights.len() {
            return Err(SamplerError::OutOfRange {
                count,
                length: self.weights.len() as u64,
            });
        }

        let mut weights = self.weights.clone();
        let mut remaining = self.total;
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            if remaining == 0 {
                break;
            }
            let mut point = rng.gen_range(0..remaining);
            for (i, w) in weights.iter_mut().enumerate() {
                if point < *w {
                    results.push(i);
                    remaining -= *w;
                    *w = 0;
                    break;
                }
                point -= *w;
            }
        }
        Ok(results)
    }
}
