//! Clip-range search for round-to-nearest quantization.

use log::{debug, info};
use serde::Serialize;

use crate::error::Result;
use crate::quantize::{quant_weight, QuantParams};
use crate::tensor::Matrix;
use crate::utils::mean_squared_error;

const N_GRID: usize = 200;
const MAX_SHRINK: f64 = 0.2;

/// Outcome of [`search_clip`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub best_quantile: f32,
    pub best_mse: f64,
    /// `(quantile, mse)` for every candidate, in evaluation order.
    pub history: Vec<(f32, f64)>,
}

/// Candidate quantiles `1 - i/200` for `i` in `0..40`.
pub fn clip_candidates() -> impl Iterator<Item = f32> {
    let steps = (MAX_SHRINK * N_GRID as f64) as usize;
    (0..steps).map(|i| (1.0 - i as f64 / N_GRID as f64) as f32)
}

/// Grid-search the quantile that minimises the mean squared error between
/// `w` and its fake-quantized copy. `params.quantile` is ignored.
///
/// Only strictly smaller errors replace the incumbent, so ties keep the
/// larger quantile.
pub fn search_clip(w: &Matrix<f32>, params: &QuantParams) -> Result<SearchResult> {
    let mut best_quantile = 1.0f32;
    let mut best_mse = f64::INFINITY;
    let mut history = Vec::new();

    info!("searching the best clip range with RTN");
    for ratio in clip_candidates() {
        let q = quant_weight(w, &params.with_quantile(ratio))?;
        let loss = mean_squared_error(w.as_slice(), q.as_slice());
        history.push((ratio, loss));
        if loss < best_mse {
            best_mse = loss;
            best_quantile = ratio;
        }
    }

    debug!("clip search loss history: {:?}", history);
    debug!("best clip ratio: {}", best_quantile);

    Ok(SearchResult {
        best_quantile,
        best_mse,
        history,
    })
}
