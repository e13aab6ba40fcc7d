//! Dense linear transform `y = x·Wᵀ + b`.

use rayon::prelude::*;

use crate::error::{QuantError, Result};
use crate::tensor::Matrix;
use crate::utils::PARALLEL_THRESHOLD;

/// Apply `weight` (shape `(out, in)`) to every row of `input` (shape `(batch, in)`).
pub fn linear(
    input: &Matrix<f32>,
    weight: &Matrix<f32>,
    bias: Option<&[f32]>,
) -> Result<Matrix<f32>> {
    if input.cols() != weight.cols() {
        return Err(QuantError::ShapeMismatch {
            what: "linear input",
            expected: vec![input.rows(), weight.cols()],
            got: input.shape().to_vec(),
        });
    }
    if let Some(b) = bias {
        if b.len() != weight.rows() {
            return Err(QuantError::ShapeMismatch {
                what: "linear bias",
                expected: vec![weight.rows()],
                got: vec![b.len()],
            });
        }
    }

    let out_features = weight.rows();
    let mut out = Matrix::zeros(input.rows(), out_features);
    if out_features == 0 {
        return Ok(out);
    }

    let fill = |(b, dst): (usize, &mut [f32])| {
        let x = input.row(b);
        for (o, y) in dst.iter_mut().enumerate() {
            let dot: f32 = weight.row(o).iter().zip(x).map(|(w, v)| w * v).sum();
            *y = dot + bias.map_or(0.0, |b| b[o]);
        }
    };

    let work = input.rows() * out_features * input.cols();
    if work > PARALLEL_THRESHOLD {
        out.as_mut_slice()
            .par_chunks_mut(out_features)
            .enumerate()
            .for_each(fill);
    } else {
        out.as_mut_slice()
            .chunks_mut(out_features)
            .enumerate()
            .for_each(fill);
    }
    Ok(out)
}
