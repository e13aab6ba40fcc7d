//! Error types for woqpak.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuantError {
    #[error("num_bits must be in 1..={max}, got {got}")]
    InvalidBits { got: u32, max: u32 },

    #[error("group_size must be -1 or a positive integer, got {0}")]
    InvalidGroupSize(i64),

    #[error("unsupported data type '{0}' (expected int, nf4, fp4, fp4_e2m1_bnb or fp4_e2m1)")]
    UnsupportedDataType(String),

    #[error("unsupported scheme '{0}' (expected sym or asym)")]
    UnsupportedScheme(String),

    #[error("unsupported storage width {0} (expected 8, 16, 32 or 64)")]
    UnsupportedStorageWidth(u32),

    #[error("unsupported compression dim {0} (0 is output channel, 1 is input channel)")]
    UnsupportedCompressionDim(usize),

    #[error("unsupported scale dtype '{0}' (expected f32, f16 or bf16)")]
    UnsupportedScaleDtype(String),

    #[error("{what} shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("{0} is not set when initializing")]
    MissingBuffer(&'static str),

    #[error("inconsistent weight-only store: {0}")]
    CorruptStore(&'static str),

    #[error("unsupported group_dim {0} (expected 1, or 0 for float output)")]
    UnsupportedGroupDim(usize),

    #[error("invalid quantile {0} (expected a finite value in (0, 1])")]
    InvalidQuantile(f32),

    #[error("layer '{0}' not found")]
    LayerNotFound(String),

    #[error("unsupported artifact version {got} (expected {expected})")]
    ArtifactVersion { got: u32, expected: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, QuantError>;
