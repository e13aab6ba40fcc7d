//! Round-to-nearest codecs.
//!
//! Every function here treats each row of its input as one quantization group
//! with its own scale (and zero point, for the asymmetric scheme). Grouping a
//! weight matrix into such rows is the job of [`crate::quantize`].

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};
use crate::tensor::Matrix;
use crate::utils::PARALLEL_THRESHOLD;

/// Widest uniform bit width accepted by the codecs.
pub const MAX_BITS: u32 = 16;

/// Weight data type requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "nf4")]
    Nf4,
    #[serde(rename = "fp4_e2m1_bnb", alias = "fp4")]
    Fp4Bnb,
    #[serde(rename = "fp4_e2m1")]
    Fp4E2m1,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Nf4 => "nf4",
            DataType::Fp4Bnb => "fp4_e2m1_bnb",
            DataType::Fp4E2m1 => "fp4_e2m1",
        }
    }

    /// The 4-bit lookup family of this data type, if it has one.
    pub fn four_bit(&self) -> Option<FourBit> {
        match self {
            DataType::Int => None,
            DataType::Nf4 => Some(FourBit::Nf4),
            DataType::Fp4Bnb => Some(FourBit::Fp4Bnb),
            DataType::Fp4E2m1 => Some(FourBit::Fp4E2m1),
        }
    }
}

impl FromStr for DataType {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "int" => Ok(DataType::Int),
            "nf4" => Ok(DataType::Nf4),
            "fp4" | "fp4_e2m1_bnb" => Ok(DataType::Fp4Bnb),
            "fp4_e2m1" => Ok(DataType::Fp4E2m1),
            other => Err(QuantError::UnsupportedDataType(other.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform quantization scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Sym,
    #[default]
    Asym,
}

impl FromStr for Scheme {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sym" => Ok(Scheme::Sym),
            "asym" => Ok(Scheme::Asym),
            other => Err(QuantError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Sym => "sym",
            Scheme::Asym => "asym",
        })
    }
}

/// A fixed table of non-uniform levels and the signed 4-bit code stored for
/// each. `levels` is ascending and `codes[i]` encodes `levels[i]`.
#[derive(Debug)]
pub struct CodeBook {
    pub name: &'static str,
    pub levels: &'static [f32],
    pub codes: &'static [i8],
}

pub static NF4: CodeBook = CodeBook {
    name: "nf4",
    levels: &[
        -1.0,
        -0.696_192_800_998_687_7,
        -0.525_073_051_452_636_7,
        -0.394_917_488_098_144_53,
        -0.284_441_381_692_886_35,
        -0.184_773_430_228_233_34,
        -0.091_050_036_251_544_95,
        0.0,
        0.079_580_299_556_255_34,
        0.160_930_201_411_247_25,
        0.246_112_301_945_686_34,
        0.337_915_241_718_292_24,
        0.440_709_829_330_444_34,
        0.562_617_003_917_694_1,
        0.722_956_836_223_602_3,
        1.0,
    ],
    // 1111 = -1, 1110 = -2, ...
    codes: &[7, 1, 2, 3, 4, 5, 6, 0, -8, -7, -6, -5, -4, -3, -2, -1],
};

pub static FP4_BNB: CodeBook = CodeBook {
    name: "fp4_e2m1_bnb",
    levels: &[
        -12.0, -8.0, -6.0, -4.0, -3.0, -2.0, -0.0625, 0.0, 0.0625, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0,
    ],
    codes: &[-5, -6, -3, -4, -1, -2, -7, 0, 1, 6, 7, 4, 5, 2, 3],
};

pub static FP4_E2M1: CodeBook = CodeBook {
    name: "fp4_e2m1",
    levels: &[
        -6.0, -4.0, -3.0, -2.0, -1.5, -1.0, -0.0625, 0.0, 0.0625, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0,
    ],
    codes: &[-1, -2, -3, -4, -5, -6, -7, 0, 1, 2, 3, 4, 5, 6, 7],
};

impl CodeBook {
    pub fn max_level(&self) -> f32 {
        self.levels.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    #[inline]
    fn midpoint(&self, i: usize) -> f32 {
        ((self.levels[i] as f64 + self.levels[i + 1] as f64) / 2.0) as f32
    }

    /// Index of the level whose midpoint bucket contains `t`.
    ///
    /// The outermost buckets are open-ended; inner buckets are `(mid[i-1], mid[i]]`.
    /// NaN falls in no bucket.
    pub fn bucket(&self, t: f32) -> Option<usize> {
        let n = self.levels.len();
        for i in 0..n - 1 {
            if t <= self.midpoint(i) {
                return Some(i);
            }
        }
        if t > self.midpoint(n - 2) {
            Some(n - 1)
        } else {
            None
        }
    }

    /// Level encoded by `code`; codes absent from the book decode to zero.
    pub fn level_of_code(&self, code: i32) -> f32 {
        self.codes
            .iter()
            .position(|&c| c as i32 == code)
            .map(|i| self.levels[i])
            .unwrap_or(0.0)
    }
}

/// Non-uniform 4-bit families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FourBit {
    Nf4,
    Fp4Bnb,
    Fp4E2m1,
}

impl FourBit {
    pub fn code_book(&self) -> &'static CodeBook {
        match self {
            FourBit::Nf4 => &NF4,
            FourBit::Fp4Bnb => &FP4_BNB,
            FourBit::Fp4E2m1 => &FP4_E2M1,
        }
    }
}

/// The codec a quantization call resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    Uniform { scheme: Scheme, full_range: bool },
    Lookup(FourBit),
}

impl Codec {
    /// Non-int data types select their lookup codec only at 4 bits; every
    /// other combination falls back to the uniform codec.
    pub fn resolve(
        data_type: DataType,
        scheme: Scheme,
        num_bits: u32,
        full_range: bool,
    ) -> Result<Self> {
        if num_bits == 0 || num_bits > MAX_BITS {
            return Err(QuantError::InvalidBits {
                got: num_bits,
                max: MAX_BITS,
            });
        }
        Ok(match data_type.four_bit() {
            Some(kind) if num_bits == 4 => Codec::Lookup(kind),
            _ => Codec::Uniform { scheme, full_range },
        })
    }

    pub fn has_zero_point(&self) -> bool {
        matches!(
            self,
            Codec::Uniform {
                scheme: Scheme::Asym,
                ..
            }
        )
    }

    pub fn code_book(&self) -> Option<&'static CodeBook> {
        match self {
            Codec::Lookup(kind) => Some(kind.code_book()),
            Codec::Uniform { .. } => None,
        }
    }
}

/// Quantized rows: one scale (and optional zero point) per row of `q`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuant {
    pub q: Matrix<i32>,
    pub scale: Vec<f32>,
    pub zero_point: Option<Vec<i32>>,
}

/// `(minq, maxq)` of the symmetric scheme.
pub fn sym_bounds(num_bits: u32) -> (i32, i32) {
    if num_bits == 1 {
        return (0, 1);
    }
    (-(1i32 << (num_bits - 1)), (1i32 << (num_bits - 1)) - 1)
}

fn row_min_max(row: &[f32]) -> (f32, f32) {
    if row.is_empty() {
        return (0.0, 0.0);
    }
    row.iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

struct Row {
    q: Vec<i32>,
    scale: f32,
    zero_point: Option<i32>,
}

fn quantize_asym(row: &[f32], num_bits: u32, quantile: f32) -> Row {
    let maxq = ((1u32 << num_bits) - 1) as f32;
    let (lo, hi) = row_min_max(row);
    let mut wmin = lo.min(0.0) * quantile;
    let mut wmax = hi.max(0.0) * quantile;
    if wmin == 0.0 && wmax == 0.0 {
        wmin = -1.0;
        wmax = 1.0;
    }
    let scale = (wmax - wmin) / maxq;
    let zp = (-wmin / scale).round_ties_even();
    let q = row
        .iter()
        .map(|&w| ((w / scale).round_ties_even() + zp).clamp(0.0, maxq) as i32)
        .collect();
    Row {
        q,
        scale,
        zero_point: Some(zp as i32),
    }
}

fn quantize_sym(row: &[f32], num_bits: u32, quantile: f32, full_range: bool) -> Row {
    let (minq, maxq) = sym_bounds(num_bits);
    let (lo, hi) = row_min_max(row);
    let flip = hi.abs() > lo.abs();
    let mut wmax = hi.abs().max(lo.abs()) * quantile;
    if wmax == 0.0 {
        wmax = 1.0;
    }
    // A 1-bit symmetric range has minq == 0, which cannot serve as a divisor.
    let scale = if full_range && minq != 0 {
        // The larger-magnitude extreme lands exactly on minq.
        let s = wmax / (-minq) as f32;
        if flip {
            -s
        } else {
            s
        }
    } else {
        wmax / maxq as f32
    };
    let q = row
        .iter()
        .map(|&w| (w / scale).round_ties_even().clamp(minq as f32, maxq as f32) as i32)
        .collect();
    Row {
        q,
        scale,
        zero_point: None,
    }
}

fn quantize_lookup(row: &[f32], book: &CodeBook, quantile: f32) -> Row {
    let mut amax = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if amax == 0.0 {
        amax = 1.0;
    }
    let scale = amax * quantile / book.max_level();
    let q = row
        .iter()
        .map(|&w| {
            book.bucket(w / scale)
                .map(|i| book.codes[i] as i32)
                .unwrap_or(0)
        })
        .collect();
    Row {
        q,
        scale,
        zero_point: None,
    }
}

/// Quantize each row of `w` as an independent group.
///
/// Uniform codecs return integers in `[minq, maxq]` (or `[0, 2^bits - 1]` with
/// a zero point per row); lookup codecs return the signed 4-bit code of the
/// chosen level.
pub fn quantize_rows(w: &Matrix<f32>, codec: Codec, num_bits: u32, quantile: f32) -> RowQuant {
    let one = |r: usize| {
        let row = w.row(r);
        match codec {
            Codec::Uniform {
                scheme: Scheme::Asym,
                ..
            } => quantize_asym(row, num_bits, quantile),
            Codec::Uniform {
                scheme: Scheme::Sym,
                full_range,
            } => quantize_sym(row, num_bits, quantile, full_range),
            Codec::Lookup(kind) => quantize_lookup(row, kind.code_book(), quantile),
        }
    };
    let rows: Vec<Row> = if w.as_slice().len() > PARALLEL_THRESHOLD {
        (0..w.rows()).into_par_iter().map(one).collect()
    } else {
        (0..w.rows()).map(one).collect()
    };

    let mut data = Vec::with_capacity(w.rows() * w.cols());
    let mut scale = Vec::with_capacity(w.rows());
    let mut zero_point = codec.has_zero_point().then(|| Vec::with_capacity(w.rows()));
    for row in rows {
        data.extend(row.q);
        scale.push(row.scale);
        if let (Some(zps), Some(zp)) = (zero_point.as_mut(), row.zero_point) {
            zps.push(zp);
        }
    }

    RowQuant {
        q: Matrix::from_fn(w.rows(), w.cols(), |r, c| data[r * w.cols() + c]),
        scale,
        zero_point,
    }
}

/// Reconstruct a single value.
#[inline]
pub fn dequantize_value(
    q: i32,
    scale: f32,
    zero_point: Option<i32>,
    book: Option<&CodeBook>,
) -> f32 {
    match (book, zero_point) {
        (Some(book), _) => book.level_of_code(q) * scale,
        (None, Some(zp)) => scale * (q - zp) as f32,
        (None, None) => scale * q as f32,
    }
}

/// Inverse of [`quantize_rows`].
pub fn dequantize_rows(quant: &RowQuant, codec: Codec) -> Matrix<f32> {
    let book = codec.code_book();
    Matrix::from_fn(quant.q.rows(), quant.q.cols(), |r, c| {
        let zp = quant.zero_point.as_ref().map(|z| z[r]);
        dequantize_value(quant.q.get(r, c), quant.scale[r], zp, book)
    })
}

/// Quantize then immediately dequantize every row.
pub fn fake_quantize_rows(
    w: &Matrix<f32>,
    codec: Codec,
    num_bits: u32,
    quantile: f32,
) -> Matrix<f32> {
    dequantize_rows(&quantize_rows(w, codec, num_bits, quantile), codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn asym() -> Codec {
        Codec::Uniform {
            scheme: Scheme::Asym,
            full_range: false,
        }
    }

    fn sym(full_range: bool) -> Codec {
        Codec::Uniform {
            scheme: Scheme::Sym,
            full_range,
        }
    }

    #[test]
    fn data_type_parsing() {
        assert_eq!("fp4".parse::<DataType>().unwrap(), DataType::Fp4Bnb);
        assert_eq!("fp4_e2m1".parse::<DataType>().unwrap(), DataType::Fp4E2m1);
        assert_eq!("nf4".parse::<DataType>().unwrap(), DataType::Nf4);
        assert!("int3".parse::<DataType>().is_err());
        assert!("SYM".parse::<Scheme>().is_err());
    }

    #[test]
    fn resolve_selects_lookup_only_at_four_bits() {
        assert_eq!(
            Codec::resolve(DataType::Nf4, Scheme::Asym, 4, false).unwrap(),
            Codec::Lookup(FourBit::Nf4)
        );
        assert_eq!(
            Codec::resolve(DataType::Nf4, Scheme::Asym, 8, false).unwrap(),
            asym()
        );
        assert_eq!(
            Codec::resolve(DataType::Int, Scheme::Sym, 4, true).unwrap(),
            sym(true)
        );
        assert!(Codec::resolve(DataType::Int, Scheme::Sym, 0, false).is_err());
    }

    #[test]
    fn code_books_are_ascending_and_paired() {
        for book in [&NF4, &FP4_BNB, &FP4_E2M1] {
            assert_eq!(book.levels.len(), book.codes.len(), "{}", book.name);
            assert!(book.levels.windows(2).all(|w| w[0] < w[1]), "{}", book.name);
            assert!(book.codes.iter().all(|&c| (-8..=7).contains(&c)));
        }
        assert_eq!(NF4.levels.len(), 16);
        assert_eq!(NF4.max_level(), 1.0);
        assert_eq!(FP4_BNB.max_level(), 12.0);
        assert_eq!(FP4_E2M1.max_level(), 6.0);
    }

    #[test]
    fn bucket_uses_midpoints() {
        assert_eq!(NF4.bucket(-5.0), Some(0));
        assert_eq!(NF4.bucket(5.0), Some(15));
        assert_eq!(NF4.bucket(0.0), Some(7));
        assert_eq!(NF4.bucket(0.03), Some(7));
        assert_eq!(NF4.bucket(0.05), Some(8));
        assert_eq!(NF4.bucket(f32::NAN), None);
        assert_eq!(NF4.level_of_code(7), -1.0);
        assert_eq!(NF4.level_of_code(-1), 1.0);
        assert_eq!(FP4_BNB.level_of_code(-8), 0.0);
    }

    #[test]
    fn asym_known_values() {
        let w = Matrix::from_vec(1, 4, vec![-1.0, 0.0, 0.5, 2.0]).unwrap();
        let out = quantize_rows(&w, asym(), 2, 1.0);
        // scale = 3/3 = 1, zp = 1
        assert_eq!(out.scale, vec![1.0]);
        assert_eq!(out.zero_point, Some(vec![1]));
        // 0.5 rounds half to even
        assert_eq!(out.q.as_slice(), &[0, 1, 1, 3]);
        assert_eq!(dequantize_rows(&out, asym()).as_slice(), &[-1.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn asym_zero_row_gets_unit_bounds() {
        let w = Matrix::<f32>::zeros(2, 3);
        let out = quantize_rows(&w, asym(), 4, 1.0);
        assert_eq!(out.scale, vec![2.0 / 15.0; 2]);
        assert!(out.scale.iter().all(|&s| s != 0.0));
        assert_eq!(out.zero_point.as_ref().map(Vec::len), Some(2));
        assert!(dequantize_rows(&out, asym()).as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sym_zero_row_gets_unit_bound() {
        let w = Matrix::<f32>::zeros(1, 4);
        let out = quantize_rows(&w, sym(false), 4, 1.0);
        assert_eq!(out.scale, vec![1.0 / 7.0]);
        assert_eq!(out.zero_point, None);

        let out = quantize_rows(&w, sym(false), 2, 1.0);
        assert_eq!(out.scale, vec![1.0]);
    }

    #[test]
    fn sym_full_range_flips_scale_toward_larger_extreme() {
        // positive extreme dominates: scale is negated so 2.0 lands on -8
        let w = Matrix::from_vec(1, 3, vec![-1.0, 0.5, 2.0]).unwrap();
        let out = quantize_rows(&w, sym(true), 4, 1.0);
        assert_eq!(out.scale, vec![-0.25]);
        assert_eq!(out.q.as_slice(), &[4, -2, -8]);
        assert_eq!(dequantize_rows(&out, sym(true)).as_slice(), &[-1.0, 0.5, 2.0]);

        // negative extreme dominates: scale stays positive
        let w = Matrix::from_vec(1, 2, vec![-2.0, 1.0]).unwrap();
        let out = quantize_rows(&w, sym(true), 4, 1.0);
        assert_eq!(out.scale, vec![0.25]);
        assert_eq!(out.q.as_slice(), &[-8, 4]);
    }

    #[test]
    fn sym_without_full_range_uses_positive_bound() {
        let w = Matrix::from_vec(1, 3, vec![-1.0, 0.5, 2.0]).unwrap();
        let out = quantize_rows(&w, sym(false), 4, 1.0);
        assert_eq!(out.scale, vec![2.0 / 7.0]);
        assert_eq!(out.q.get(0, 2), 7);
        assert!(out.q.as_slice().iter().all(|&q| (-8..=7).contains(&q)));
    }

    #[test]
    fn one_bit_sym_uses_special_bounds() {
        assert_eq!(sym_bounds(1), (0, 1));
        assert_eq!(sym_bounds(4), (-8, 7));
        let w = Matrix::from_vec(1, 3, vec![-1.0, 0.2, 1.0]).unwrap();
        let out = quantize_rows(&w, sym(true), 1, 1.0);
        assert_eq!(out.scale, vec![1.0]);
        assert_eq!(out.q.as_slice(), &[0, 0, 1]);
    }

    #[test]
    fn quantile_shrinks_range() {
        let w = Matrix::from_vec(1, 2, vec![-1.0, 1.0]).unwrap();
        let full = quantize_rows(&w, sym(false), 8, 1.0);
        let clipped = quantize_rows(&w, sym(false), 8, 0.9);
        assert!(clipped.scale[0] < full.scale[0]);
        assert_eq!(clipped.q.as_slice(), &[-127, 127]);
    }

    #[test]
    fn nf4_maps_extremes_and_zero_to_levels() {
        let w = Matrix::from_vec(1, 3, vec![-1.0, 0.0, 1.0]).unwrap();
        let codec = Codec::Lookup(FourBit::Nf4);
        let out = quantize_rows(&w, codec, 4, 1.0);
        assert_eq!(out.scale, vec![1.0]);
        assert_eq!(out.q.as_slice(), &[7, 0, -1]);
        assert_eq!(fake_quantize_rows(&w, codec, 4, 1.0).as_slice(), &[-1.0, 0.0, 1.0]);
    }

    #[test]
    fn fp4_scale_uses_max_level() {
        let w = Matrix::from_vec(1, 2, vec![-6.0, 3.0]).unwrap();
        let out = quantize_rows(&w, Codec::Lookup(FourBit::Fp4E2m1), 4, 1.0);
        assert_eq!(out.scale, vec![1.0]);
        assert_eq!(out.q.as_slice(), &[-1, 5]);
    }
}
