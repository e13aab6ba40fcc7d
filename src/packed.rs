//! Bit-packed storage for weight-only quantized linear layers.
//!
//! `n_pack = storage_bits / bits` quantized fields share one storage word.
//! Words are packed along the input channels (`compression_dim = 1`) or the
//! output channels (`compression_dim = 0`). Field `e` of a word occupies bits
//! `[bits * e, bits * (e + 1))`.

use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{self, Codec, Scheme};
use crate::error::{QuantError, Result};
use crate::kernel;
use crate::quantize::{group_index, num_groups};
use crate::tensor::Matrix;

/// Width of one storage word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageWidth {
    W8,
    W16,
    W32,
    W64,
}

impl StorageWidth {
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            8 => Ok(StorageWidth::W8),
            16 => Ok(StorageWidth::W16),
            32 => Ok(StorageWidth::W32),
            64 => Ok(StorageWidth::W64),
            other => Err(QuantError::UnsupportedStorageWidth(other)),
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            StorageWidth::W8 => 8,
            StorageWidth::W16 => 16,
            StorageWidth::W32 => 32,
            StorageWidth::W64 => 64,
        }
    }
}

/// Axis along which fields are packed into words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionDim {
    /// Output channels (dim 0).
    Output,
    /// Input channels (dim 1).
    Input,
}

impl CompressionDim {
    pub fn from_index(dim: usize) -> Result<Self> {
        match dim {
            0 => Ok(CompressionDim::Output),
            1 => Ok(CompressionDim::Input),
            other => Err(QuantError::UnsupportedCompressionDim(other)),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            CompressionDim::Output => 0,
            CompressionDim::Input => 1,
        }
    }
}

/// Precision in which scales and bias are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDtype {
    #[default]
    F32,
    F16,
    Bf16,
}

impl ScaleDtype {
    /// Round `x` to this precision.
    #[inline]
    pub fn round(&self, x: f32) -> f32 {
        match self {
            ScaleDtype::F32 => x,
            ScaleDtype::F16 => f16::from_f32(x).to_f32(),
            ScaleDtype::Bf16 => bf16::from_f32(x).to_f32(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            ScaleDtype::F32 => 4,
            ScaleDtype::F16 | ScaleDtype::Bf16 => 2,
        }
    }
}

impl FromStr for ScaleDtype {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" | "fp32" | "float32" => Ok(ScaleDtype::F32),
            "f16" | "fp16" | "float16" => Ok(ScaleDtype::F16),
            "bf16" | "bfloat16" => Ok(ScaleDtype::Bf16),
            other => Err(QuantError::UnsupportedScaleDtype(other.to_string())),
        }
    }
}

/// Layout options of a [`WeightOnlyLinear`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackOptions {
    pub storage_bits: u32,
    pub compression_dim: usize,
    pub scale_dtype: ScaleDtype,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            storage_bits: 32,
            compression_dim: 1,
            scale_dtype: ScaleDtype::F32,
        }
    }
}

#[inline]
fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// An unsigned integer type used as one storage word.
pub trait Word: Copy + Default + Send + Sync {
    fn from_u64(v: u64) -> Self;
    fn to_u64(self) -> u64;
}

macro_rules! impl_word {
    ($($t:ty),*) => {
        $(
            impl Word for $t {
                #[inline]
                fn from_u64(v: u64) -> Self {
                    v as $t
                }

                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }
            }
        )*
    };
}

impl_word!(u8, u16, u32, u64);

/// Pack each row of `src` into words of `n_pack` fields.
///
/// `bits * n_pack` never exceeds the width of `W`, so narrowing the
/// accumulated `u64` is lossless.
fn pack_rows<W: Word>(src: &Matrix<i32>, bits: u32, n_pack: usize) -> Matrix<W> {
    let mask = low_mask(bits);
    let words = src.cols().div_ceil(n_pack);
    Matrix::from_fn(src.rows(), words, |r, j| {
        let row = src.row(r);
        let start = j * n_pack;
        let end = (start + n_pack).min(row.len());
        let word = row[start..end]
            .iter()
            .enumerate()
            .fold(0u64, |word, (e, &v)| {
                word | (((v as i64 as u64) & mask) << (bits as usize * e))
            });
        W::from_u64(word)
    })
}

/// Extract field `e` of `word`, sign-extending when `signed`.
#[inline]
fn extract(word: u64, bits: u32, e: usize, signed: bool) -> i32 {
    let field = word << (64 - bits as usize * (e + 1));
    if signed {
        ((field as i64) >> (64 - bits)) as i32
    } else {
        (field >> (64 - bits)) as i32
    }
}

/// Inverse of [`pack_rows`] for a row length of `cols`.
fn unpack_rows<W: Word>(
    words: &Matrix<W>,
    bits: u32,
    n_pack: usize,
    cols: usize,
    signed: bool,
) -> Matrix<i32> {
    Matrix::from_fn(words.rows(), cols, |r, c| {
        extract(words.get(r, c / n_pack).to_u64(), bits, c % n_pack, signed)
    })
}

/// Packed words held at their storage width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PackedWords {
    W8(Matrix<u8>),
    W16(Matrix<u16>),
    W32(Matrix<u32>),
    W64(Matrix<u64>),
}

macro_rules! each_width {
    ($words:expr, $m:ident => $body:expr) => {
        match $words {
            PackedWords::W8($m) => $body,
            PackedWords::W16($m) => $body,
            PackedWords::W32($m) => $body,
            PackedWords::W64($m) => $body,
        }
    };
}

macro_rules! map_width {
    ($words:expr, $m:ident => $body:expr) => {
        match $words {
            PackedWords::W8($m) => PackedWords::W8($body),
            PackedWords::W16($m) => PackedWords::W16($body),
            PackedWords::W32($m) => PackedWords::W32($body),
            PackedWords::W64($m) => PackedWords::W64($body),
        }
    };
}

impl PackedWords {
    pub fn zeros(width: StorageWidth, rows: usize, cols: usize) -> Self {
        match width {
            StorageWidth::W8 => PackedWords::W8(Matrix::zeros(rows, cols)),
            StorageWidth::W16 => PackedWords::W16(Matrix::zeros(rows, cols)),
            StorageWidth::W32 => PackedWords::W32(Matrix::zeros(rows, cols)),
            StorageWidth::W64 => PackedWords::W64(Matrix::zeros(rows, cols)),
        }
    }

    /// Pack the rows of `src` into words of `width`.
    pub fn pack(width: StorageWidth, src: &Matrix<i32>, bits: u32, n_pack: usize) -> Self {
        match width {
            StorageWidth::W8 => PackedWords::W8(pack_rows(src, bits, n_pack)),
            StorageWidth::W16 => PackedWords::W16(pack_rows(src, bits, n_pack)),
            StorageWidth::W32 => PackedWords::W32(pack_rows(src, bits, n_pack)),
            StorageWidth::W64 => PackedWords::W64(pack_rows(src, bits, n_pack)),
        }
    }

    pub fn unpack(&self, bits: u32, n_pack: usize, cols: usize, signed: bool) -> Matrix<i32> {
        each_width!(self, m => unpack_rows(m, bits, n_pack, cols, signed))
    }

    pub fn transpose(&self) -> Self {
        map_width!(self, m => m.transpose())
    }

    pub fn width(&self) -> StorageWidth {
        match self {
            PackedWords::W8(_) => StorageWidth::W8,
            PackedWords::W16(_) => StorageWidth::W16,
            PackedWords::W32(_) => StorageWidth::W32,
            PackedWords::W64(_) => StorageWidth::W64,
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        each_width!(self, m => m.shape())
    }

    /// Number of words.
    pub fn len(&self) -> usize {
        each_width!(self, m => m.as_slice().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Word at `(r, c)`, widened to `u64`.
    pub fn word(&self, r: usize, c: usize) -> u64 {
        each_width!(self, m => m.get(r, c).to_u64())
    }

    pub fn size_bytes(&self) -> usize {
        self.len() * self.width().bits() as usize / 8
    }

    pub fn validate(&self) -> Result<()> {
        each_width!(self, m => m.validate())
    }
}

/// Shapes of the packed weight and zero-point buffers.
fn packed_shapes(
    in_features: usize,
    out_features: usize,
    n_pack: usize,
    n_groups: usize,
    dim: CompressionDim,
) -> ([usize; 2], [usize; 2]) {
    match dim {
        CompressionDim::Input => (
            [out_features, in_features.div_ceil(n_pack)],
            [out_features, n_groups.div_ceil(n_pack)],
        ),
        CompressionDim::Output => (
            [out_features.div_ceil(n_pack), in_features],
            [out_features.div_ceil(n_pack), n_groups],
        ),
    }
}

/// A linear layer whose weight is kept group-quantized and bit-packed.
///
/// Construction allocates zero-filled buffers; [`pack`](Self::pack) fills them
/// once. [`recover`](Self::recover) and [`forward`](Self::forward) only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightOnlyLinear {
    in_features: usize,
    out_features: usize,
    bits: u32,
    group_size: usize,
    codec: Codec,
    storage: StorageWidth,
    compression_dim: CompressionDim,
    scale_dtype: ScaleDtype,
    scale: Matrix<f32>,
    packed_weight: PackedWords,
    packed_zp: Option<PackedWords>,
    bias: Option<Vec<f32>>,
    packed: bool,
}

impl WeightOnlyLinear {
    /// Allocate an empty store. `group_size == -1` means one group per row.
    /// A packed zero-point buffer is allocated when `codec` carries zero points.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bits: u32,
        group_size: i64,
        codec: Codec,
        opts: &PackOptions,
    ) -> Result<Self> {
        let storage = StorageWidth::from_bits(opts.storage_bits)?;
        let compression_dim = CompressionDim::from_index(opts.compression_dim)?;
        if bits == 0 || bits > storage.bits() || bits > codec::MAX_BITS {
            return Err(QuantError::InvalidBits {
                got: bits,
                max: storage.bits().min(codec::MAX_BITS),
            });
        }
        let group_size = match group_size {
            -1 => in_features,
            g if g > 0 => g as usize,
            g => return Err(QuantError::InvalidGroupSize(g)),
        };

        let n_pack = (storage.bits() / bits) as usize;
        let n_groups = num_groups(in_features, group_size);
        let (weight_shape, zp_shape) =
            packed_shapes(in_features, out_features, n_pack, n_groups, compression_dim);

        Ok(Self {
            in_features,
            out_features,
            bits,
            group_size,
            codec,
            storage,
            compression_dim,
            scale_dtype: opts.scale_dtype,
            scale: Matrix::zeros(out_features, n_groups),
            packed_weight: PackedWords::zeros(storage, weight_shape[0], weight_shape[1]),
            packed_zp: codec
                .has_zero_point()
                .then(|| PackedWords::zeros(storage, zp_shape[0], zp_shape[1])),
            bias: None,
            packed: false,
        })
    }

    /// Allocate a zero bias vector.
    pub fn with_bias(mut self) -> Self {
        self.bias = Some(vec![0.0; self.out_features]);
        self
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn storage(&self) -> StorageWidth {
        self.storage
    }

    pub fn compression_dim(&self) -> CompressionDim {
        self.compression_dim
    }

    pub fn scale_dtype(&self) -> ScaleDtype {
        self.scale_dtype
    }

    /// Fields per storage word.
    pub fn n_pack(&self) -> usize {
        (self.storage.bits() / self.bits) as usize
    }

    pub fn num_groups(&self) -> usize {
        self.scale.cols()
    }

    pub fn scale(&self) -> &Matrix<f32> {
        &self.scale
    }

    pub fn packed_weight(&self) -> &PackedWords {
        &self.packed_weight
    }

    pub fn packed_zero_point(&self) -> Option<&PackedWords> {
        self.packed_zp.as_ref()
    }

    pub fn bias(&self) -> Option<&[f32]> {
        self.bias.as_deref()
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Whether weight fields are read back without sign extension.
    fn unsigned_codes(&self) -> bool {
        match self.codec {
            Codec::Uniform {
                scheme: Scheme::Asym,
                ..
            } => true,
            // the 1-bit symmetric range is {0, 1}
            Codec::Uniform {
                scheme: Scheme::Sym,
                ..
            } => self.bits == 1,
            Codec::Lookup(_) => false,
        }
    }

    fn pack_matrix(&self, src: &Matrix<i32>) -> PackedWords {
        let (bits, n_pack) = (self.bits, self.n_pack());
        match self.compression_dim {
            CompressionDim::Input => PackedWords::pack(self.storage, src, bits, n_pack),
            CompressionDim::Output => {
                PackedWords::pack(self.storage, &src.transpose(), bits, n_pack).transpose()
            }
        }
    }

    fn unpack_matrix(
        &self,
        words: &PackedWords,
        rows: usize,
        cols: usize,
        signed: bool,
    ) -> Matrix<i32> {
        let (bits, n_pack) = (self.bits, self.n_pack());
        match self.compression_dim {
            CompressionDim::Input => words.unpack(bits, n_pack, cols, signed),
            CompressionDim::Output => {
                words.transpose().unpack(bits, n_pack, rows, signed).transpose()
            }
        }
    }

    /// Check that a deserialized store is internally consistent.
    ///
    /// Every accessor and [`recover`](Self::recover) may assume a store that
    /// passed this check.
    pub fn validate(&self) -> Result<()> {
        let max = self.storage.bits().min(codec::MAX_BITS);
        if self.bits == 0 || self.bits > max {
            return Err(QuantError::InvalidBits {
                got: self.bits,
                max,
            });
        }
        if self.group_size == 0 {
            return Err(QuantError::InvalidGroupSize(0));
        }
        self.scale.validate()?;
        let n_groups = num_groups(self.in_features, self.group_size);
        if self.scale.shape() != [self.out_features, n_groups] {
            return Err(QuantError::ShapeMismatch {
                what: "scale",
                expected: vec![self.out_features, n_groups],
                got: self.scale.shape().to_vec(),
            });
        }

        let (weight_shape, zp_shape) = packed_shapes(
            self.in_features,
            self.out_features,
            self.n_pack(),
            n_groups,
            self.compression_dim,
        );
        self.validate_words(&self.packed_weight, "packed weight", weight_shape)?;
        match (&self.packed_zp, self.codec.has_zero_point()) {
            (Some(zp), true) => self.validate_words(zp, "packed zero point", zp_shape)?,
            (None, false) => {}
            (None, true) => return Err(QuantError::MissingBuffer("zero point")),
            (Some(_), false) => {
                return Err(QuantError::CorruptStore("zero points stored for a codec without them"))
            }
        }

        if let Some(b) = &self.bias {
            if b.len() != self.out_features {
                return Err(QuantError::ShapeMismatch {
                    what: "bias",
                    expected: vec![self.out_features],
                    got: vec![b.len()],
                });
            }
        }
        Ok(())
    }

    fn validate_words(
        &self,
        words: &PackedWords,
        what: &'static str,
        shape: [usize; 2],
    ) -> Result<()> {
        if words.width() != self.storage {
            return Err(QuantError::CorruptStore("word width differs from storage width"));
        }
        words.validate()?;
        if words.shape() != shape {
            return Err(QuantError::ShapeMismatch {
                what,
                expected: shape.to_vec(),
                got: words.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Store quantized integers with their group parameters.
    ///
    /// `scale` (and `zero_point`, when given) must have shape
    /// `(out_features, num_groups)`. Packing again replaces earlier contents.
    pub fn pack(
        &mut self,
        q: &Matrix<i32>,
        scale: &Matrix<f32>,
        zero_point: Option<&Matrix<i32>>,
        bias: Option<&[f32]>,
    ) -> Result<()> {
        if scale.shape() != self.scale.shape() {
            return Err(QuantError::ShapeMismatch {
                what: "scale",
                expected: self.scale.shape().to_vec(),
                got: scale.shape().to_vec(),
            });
        }
        if q.shape() != [self.out_features, self.in_features] {
            return Err(QuantError::ShapeMismatch {
                what: "int weight",
                expected: vec![self.out_features, self.in_features],
                got: q.shape().to_vec(),
            });
        }
        if let Some(zp) = zero_point {
            if self.packed_zp.is_none() {
                return Err(QuantError::MissingBuffer("zero point"));
            }
            if zp.shape() != self.scale.shape() {
                return Err(QuantError::ShapeMismatch {
                    what: "zero point",
                    expected: self.scale.shape().to_vec(),
                    got: zp.shape().to_vec(),
                });
            }
        }
        if let Some(b) = bias {
            if self.bias.is_none() {
                return Err(QuantError::MissingBuffer("bias"));
            }
            if b.len() != self.out_features {
                return Err(QuantError::ShapeMismatch {
                    what: "bias",
                    expected: vec![self.out_features],
                    got: vec![b.len()],
                });
            }
        }

        let dtype = self.scale_dtype;
        self.scale = scale.map(|s| dtype.round(s));
        if let Some(b) = bias {
            self.bias = Some(b.iter().map(|&v| dtype.round(v)).collect());
        }
        self.packed_weight = self.pack_matrix(q);
        if let Some(buf) = self.packed_zp.as_mut() {
            let [rows, cols] = buf.shape();
            *buf = PackedWords::zeros(self.storage, rows, cols);
        }
        if let Some(zp) = zero_point {
            self.packed_zp = Some(self.pack_matrix(zp));
        }
        self.packed = true;
        debug!("packed {} into {:?} words", self, self.packed_weight.shape());
        Ok(())
    }

    /// Unpacked integer codes, shape `(out_features, in_features)`.
    pub fn unpack_weight(&self) -> Matrix<i32> {
        self.unpack_matrix(
            &self.packed_weight,
            self.out_features,
            self.in_features,
            !self.unsigned_codes(),
        )
    }

    /// Unpacked zero points, shape `(out_features, num_groups)`.
    pub fn unpack_zero_point(&self) -> Option<Matrix<i32>> {
        self.packed_zp
            .as_ref()
            .map(|zp| self.unpack_matrix(zp, self.out_features, self.num_groups(), false))
    }

    /// Dequantize the packed weight back to `(out_features, in_features)` floats.
    pub fn recover(&self) -> Matrix<f32> {
        debug!("recovering {} weight", self);
        if !self.packed {
            warn!(
                "recovering an unpacked weight-only layer ({}); result is all zeros",
                self
            );
        }
        let q = self.unpack_weight();
        let zp = self.unpack_zero_point();
        let book = self.codec.code_book();
        let n_groups = self.num_groups();
        Matrix::from_fn(self.out_features, self.in_features, |r, c| {
            let g = group_index(c, self.group_size, n_groups);
            let z = zp.as_ref().map(|z| z.get(r, g));
            codec::dequantize_value(q.get(r, c), self.scale.get(r, g), z, book)
        })
    }

    /// Recover the weight and apply it to `input` (shape `(batch, in_features)`).
    ///
    /// The float weight is rebuilt on every call and never cached.
    pub fn forward(&self, input: &Matrix<f32>) -> Result<Matrix<f32>> {
        let weight = self.recover();
        kernel::linear(input, &weight, self.bias.as_deref())
    }

    /// Bytes held by packed words, scales, zero points and bias.
    pub fn size_bytes(&self) -> usize {
        let mut size = self.packed_weight.size_bytes()
            + self.scale.as_slice().len() * self.scale_dtype.size_bytes();
        if let Some(zp) = &self.packed_zp {
            size += zp.size_bytes();
        }
        if let Some(b) = &self.bias {
            size += b.len() * self.scale_dtype.size_bytes();
        }
        size
    }

    /// Size of the float32 weight divided by [`size_bytes`](Self::size_bytes).
    pub fn compression_ratio(&self) -> f64 {
        let size = self.size_bytes();
        if size == 0 {
            return f64::INFINITY;
        }
        (self.in_features * self.out_features * 4) as f64 / size as f64
    }
}

impl fmt::Display for WeightOnlyLinear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in_features={}, out_features={}, bits={}, group_size={}, bias={}",
            self.in_features,
            self.out_features,
            self.bits,
            self.group_size,
            self.bias.is_some()
        )
    }
}
