//! Reconstruction-error measurement.

use rayon::prelude::*;
use serde::Serialize;

/// Element count above which reductions switch to rayon.
pub const PARALLEL_THRESHOLD: usize = 1 << 16;

/// Reconstruction error between an original tensor and its quantized copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub mse: f64,
    pub mae: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Clone, Copy, Default)]
struct Acc {
    sq: f64,
    abs: f64,
    max: f64,
    n: usize,
}

impl Acc {
    #[inline]
    fn push(mut self, diff: f64) -> Self {
        self.sq += diff * diff;
        self.abs += diff;
        if diff > self.max {
            self.max = diff;
        }
        self.n += 1;
        self
    }

    fn merge(self, other: Self) -> Self {
        Self {
            sq: self.sq + other.sq,
            abs: self.abs + other.abs,
            max: self.max.max(other.max),
            n: self.n + other.n,
        }
    }
}

/// MSE/MAE/max-abs error over the common prefix of `a` and `b`.
pub fn error_stats(a: &[f32], b: &[f32]) -> ErrorStats {
    let diff = |(x, y): (&f32, &f32)| (*x as f64 - *y as f64).abs();
    let acc = if a.len() > PARALLEL_THRESHOLD {
        a.par_iter()
            .zip(b.par_iter())
            .map(diff)
            .fold(Acc::default, Acc::push)
            .reduce(Acc::default, Acc::merge)
    } else {
        a.iter().zip(b.iter()).map(diff).fold(Acc::default(), Acc::push)
    };

    if acc.n == 0 {
        return ErrorStats::default();
    }
    ErrorStats {
        mse: acc.sq / acc.n as f64,
        mae: acc.abs / acc.n as f64,
        max: acc.max,
        count: acc.n,
    }
}

/// Mean squared error between `a` and `b`.
#[inline]
pub fn mean_squared_error(a: &[f32], b: &[f32]) -> f64 {
    error_stats(a, b).mse
}
