//! Group-wise weight quantization.
//!
//! A weight matrix of shape `(rows, cols)` is cut along `cols` into groups of
//! `group_size` columns; each `(row, group)` pair gets its own scale and zero
//! point. When `cols` is not a multiple of the group size the trailing columns
//! form one smaller remainder group per row, stored in the last parameter
//! column.

use serde::{Deserialize, Serialize};

use crate::codec::{self, Codec, DataType, Scheme};
use crate::error::{QuantError, Result};
use crate::tensor::Matrix;

/// Parameters of one quantization call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub num_bits: u32,
    /// Columns per group; `-1` quantizes each row as a single group.
    pub group_size: i64,
    pub scheme: Scheme,
    /// Fraction of the observed range kept before computing scales.
    pub quantile: f32,
    pub data_type: DataType,
    pub full_range: bool,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            num_bits: 4,
            group_size: 32,
            scheme: Scheme::Asym,
            quantile: 1.0,
            data_type: DataType::Int,
            full_range: false,
        }
    }
}

impl QuantParams {
    /// Validate the parameters and resolve the codec they select.
    pub fn codec(&self) -> Result<Codec> {
        if self.group_size == 0 || self.group_size < -1 {
            return Err(QuantError::InvalidGroupSize(self.group_size));
        }
        if !self.quantile.is_finite() || self.quantile <= 0.0 || self.quantile > 1.0 {
            return Err(QuantError::InvalidQuantile(self.quantile));
        }
        Codec::resolve(self.data_type, self.scheme, self.num_bits, self.full_range)
    }

    pub fn with_quantile(self, quantile: f32) -> Self {
        Self { quantile, ..self }
    }
}

/// Integer output of [`quant_weight_int`].
#[derive(Debug, Clone, PartialEq)]
pub struct IntWeight {
    pub q: Matrix<i32>,
    /// `(rows, num_groups)`
    pub scale: Matrix<f32>,
    /// Present only for the asymmetric uniform scheme.
    pub zero_point: Option<Matrix<i32>>,
    pub codec: Codec,
    /// Effective columns per full group.
    pub group_size: usize,
}

impl IntWeight {
    /// Reconstruct floating-point weights from codes and group parameters.
    pub fn dequantize(&self) -> Matrix<f32> {
        let book = self.codec.code_book();
        let n_groups = self.scale.cols();
        Matrix::from_fn(self.q.rows(), self.q.cols(), |r, c| {
            let g = group_index(c, self.group_size, n_groups);
            let zp = self.zero_point.as_ref().map(|z| z.get(r, g));
            codec::dequantize_value(self.q.get(r, c), self.scale.get(r, g), zp, book)
        })
    }
}

/// Number of scale columns for `cols` inputs: `ceil(cols / group_size)`.
pub fn num_groups(cols: usize, group_size: usize) -> usize {
    if group_size == 0 {
        return 1;
    }
    cols.div_ceil(group_size).max(1)
}

/// Scale column holding input column `col`; the remainder group shares the
/// last column.
#[inline]
pub fn group_index(col: usize, group_size: usize, n_groups: usize) -> usize {
    if group_size == 0 {
        return 0;
    }
    (col / group_size).min(n_groups.saturating_sub(1))
}

enum Partition {
    Whole,
    Even(usize),
    Split { group_size: usize, at: usize },
}

fn partition(cols: usize, group_size: i64) -> Partition {
    if group_size == -1 || (cols as i64) < group_size {
        return Partition::Whole;
    }
    let g = group_size as usize;
    if cols % g == 0 {
        Partition::Even(g)
    } else {
        Partition::Split {
            group_size: g,
            at: cols / g * g,
        }
    }
}

struct Parts {
    q: Matrix<i32>,
    scale: Matrix<f32>,
    zero_point: Option<Matrix<i32>>,
}

/// Quantize `w` with groups of exactly `g` columns; `g` must divide `cols`.
fn quantize_groups(w: &Matrix<f32>, g: usize, codec: Codec, params: &QuantParams) -> Result<Parts> {
    let (rows, cols) = (w.rows(), w.cols());
    let n = if g == cols { 1 } else { cols / g };
    let groups = if n == 1 {
        w.clone()
    } else {
        w.clone().reshape(rows * n, g)?
    };
    let rq = codec::quantize_rows(&groups, codec, params.num_bits, params.quantile);
    Ok(Parts {
        q: rq.q.reshape(rows, cols)?,
        scale: Matrix::from_vec(rows, n, rq.scale)?,
        zero_point: rq
            .zero_point
            .map(|zp| Matrix::from_vec(rows, n, zp))
            .transpose()?,
    })
}

/// Quantize `w` group-wise, returning integer codes and group parameters.
pub fn quant_weight_int(w: &Matrix<f32>, params: &QuantParams) -> Result<IntWeight> {
    let codec = params.codec()?;
    let cols = w.cols();

    let (parts, group_size) = match partition(cols, params.group_size) {
        Partition::Whole => (quantize_groups(w, cols, codec, params)?, cols),
        Partition::Even(g) => (quantize_groups(w, g, codec, params)?, g),
        Partition::Split { group_size: g, at } => {
            let (left, right) = w.split_cols(at);
            let l = quantize_groups(&left, g, codec, params)?;
            let r = quantize_groups(&right, right.cols(), codec, params)?;
            let zero_point = match (l.zero_point, r.zero_point) {
                (Some(a), Some(b)) => Some(a.hcat(&b)?),
                _ => None,
            };
            let parts = Parts {
                q: l.q.hcat(&r.q)?,
                scale: l.scale.hcat(&r.scale)?,
                zero_point,
            };
            (parts, g)
        }
    };

    Ok(IntWeight {
        q: parts.q,
        scale: parts.scale,
        zero_point: parts.zero_point,
        codec,
        group_size,
    })
}

/// Quantize and dequantize `w` group-wise ("fake quantization").
pub fn quant_weight(w: &Matrix<f32>, params: &QuantParams) -> Result<Matrix<f32>> {
    Ok(quant_weight_int(w, params)?.dequantize())
}
