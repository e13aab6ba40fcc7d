//! Weight-only post-training quantization for linear layers.
//!
//! Weights are rounded to the nearest level of a uniform integer grid
//! (symmetric or asymmetric) or of a 4-bit lookup table (NF4 / FP4), one scale
//! per group of input channels, and optionally bit-packed into
//! [`WeightOnlyLinear`] stores that are expanded back to floats on demand.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod config;
pub mod error;
pub mod kernel;
pub mod model;
pub mod packed;
pub mod quantize;
pub mod rtn;
pub mod search;
pub mod tensor;
pub mod utils;

pub use codec::{Codec, DataType, FourBit, Scheme};
pub use config::{LayerOverride, PackOptions, RtnConfig, ScaleDtype};
pub use error::{QuantError, Result};
pub use model::{Layer, LayerHost, Linear, Model};
pub use packed::{CompressionDim, PackedWords, StorageWidth, WeightOnlyLinear};
pub use quantize::{quant_weight, quant_weight_int, IntWeight, QuantParams};
pub use rtn::{rtn_quantize, LayerReport, RtnReport};
pub use search::{search_clip, SearchResult};
pub use tensor::{FloatBundle, FloatTensor, Matrix};

/// Current on-disk artifact format version.
pub const ARTIFACT_VERSION: u32 = 1;

/// A quantized model as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: u32,
    pub model: Model,
}

impl ModelArtifact {
    pub fn new(model: Model) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            model,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode an artifact, rejecting other format versions and
    /// inconsistent layers.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let artifact: ModelArtifact = bincode::deserialize(bytes)?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(QuantError::ArtifactVersion {
                got: artifact.version,
                expected: ARTIFACT_VERSION,
            });
        }
        artifact.model.validate()?;
        Ok(artifact)
    }
}

pub fn save_artifact(path: impl AsRef<Path>, artifact: &ModelArtifact) -> Result<()> {
    fs::write(path, artifact.to_bytes()?)?;
    Ok(())
}

pub fn load_artifact(path: impl AsRef<Path>) -> Result<ModelArtifact> {
    ModelArtifact::from_bytes(&fs::read(path)?)
}

pub fn read_bundle(path: impl AsRef<Path>) -> Result<FloatBundle> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

pub fn write_bundle(path: impl AsRef<Path>, bundle: &FloatBundle) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(bundle)?)?;
    Ok(())
}
