//! Configuration of a round-to-nearest quantization run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::{DataType, Scheme};
use crate::error::{QuantError, Result};
use crate::packed::{CompressionDim, StorageWidth};
use crate::quantize::QuantParams;

pub use crate::packed::{PackOptions, ScaleDtype};

/// Per-layer settings. Keys left unset fall back to the global values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerOverride {
    pub bits: Option<u32>,
    pub group_size: Option<i64>,
    pub scheme: Option<Scheme>,
    pub quantile: Option<f32>,
    pub data_type: Option<DataType>,
}

/// Global settings of [`crate::rtn::rtn_quantize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtnConfig {
    pub num_bits: u32,
    pub group_size: i64,
    pub scheme: Scheme,
    pub quantile: f32,
    pub data_type: DataType,
    /// Replace layers with packed [`crate::packed::WeightOnlyLinear`] stores
    /// instead of writing fake-quantized floats back.
    pub return_int: bool,
    /// Use `-2^(bits-1)` as the symmetric lower bound.
    pub full_range: bool,
    pub enable_mse_search: bool,
    /// `0` groups along output channels, `1` along input channels.
    pub group_dim: usize,
    pub weight_config: BTreeMap<String, LayerOverride>,
    /// Layer names left untouched.
    pub skip: Vec<String>,
    pub pack: PackOptions,
}

impl Default for RtnConfig {
    fn default() -> Self {
        Self {
            num_bits: 4,
            group_size: 32,
            scheme: Scheme::Asym,
            quantile: 1.0,
            data_type: DataType::Int,
            return_int: false,
            full_range: false,
            enable_mse_search: false,
            group_dim: 1,
            weight_config: BTreeMap::new(),
            skip: Vec::new(),
            pack: PackOptions::default(),
        }
    }
}

impl RtnConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: RtnConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Global parameters before per-layer overrides.
    pub fn base_params(&self) -> QuantParams {
        QuantParams {
            num_bits: self.num_bits,
            group_size: self.group_size,
            scheme: self.scheme,
            quantile: self.quantile,
            data_type: self.data_type,
            full_range: self.full_range,
        }
    }

    /// Effective parameters for layer `name`. An override replaces only the
    /// keys it sets and applies to that layer alone.
    pub fn params_for(&self, name: &str) -> QuantParams {
        let base = self.base_params();
        let Some(o) = self.weight_config.get(name) else {
            return base;
        };
        QuantParams {
            num_bits: o.bits.unwrap_or(base.num_bits),
            group_size: o.group_size.unwrap_or(base.group_size),
            scheme: o.scheme.unwrap_or(base.scheme),
            quantile: o.quantile.unwrap_or(base.quantile),
            data_type: o.data_type.unwrap_or(base.data_type),
            full_range: base.full_range,
        }
    }

    pub fn is_skipped(&self, name: &str) -> bool {
        self.skip.iter().any(|s| s == name)
    }

    /// Check every parameter set this config can produce.
    pub fn validate(&self) -> Result<()> {
        match self.group_dim {
            0 if self.return_int => return Err(QuantError::UnsupportedGroupDim(0)),
            0 | 1 => {}
            other => return Err(QuantError::UnsupportedGroupDim(other)),
        }
        StorageWidth::from_bits(self.pack.storage_bits)?;
        CompressionDim::from_index(self.pack.compression_dim)?;
        self.base_params().codec()?;
        for name in self.weight_config.keys() {
            self.params_for(name).codec()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_json_yields_defaults() {
        let config = RtnConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RtnConfig::default());
        assert_eq!(config.pack.storage_bits, 32);
        assert_eq!(config.pack.compression_dim, 1);
        assert_eq!(config.pack.scale_dtype, ScaleDtype::F32);
    }

    #[test]
    fn overrides_apply_to_their_layer_only() {
        let config = RtnConfig::from_json_str(
            r#"{
                "num_bits": 4,
                "weight_config": {
                    "fc2": { "bits": 8, "group_size": -1, "scheme": "sym" }
                }
            }"#,
        )
        .unwrap();

        let fc2 = config.params_for("fc2");
        assert_eq!(fc2.num_bits, 8);
        assert_eq!(fc2.group_size, -1);
        assert_eq!(fc2.scheme, Scheme::Sym);
        assert_eq!(fc2.quantile, 1.0);

        // a layer after fc2 sees the globals again
        let fc3 = config.params_for("fc3");
        assert_eq!(fc3, config.base_params());
    }

    #[test]
    fn pack_options_parse() {
        let config = RtnConfig::from_json_str(
            r#"{ "return_int": true, "pack": { "storage_bits": 8, "scale_dtype": "bf16" } }"#,
        )
        .unwrap();
        assert_eq!(config.pack.storage_bits, 8);
        assert_eq!(config.pack.compression_dim, 1);
        assert_eq!(config.pack.scale_dtype, ScaleDtype::Bf16);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        for json in [
            r#"{ "group_dim": 2 }"#,
            r#"{ "group_dim": 0, "return_int": true }"#,
            r#"{ "pack": { "storage_bits": 12 } }"#,
            r#"{ "pack": { "compression_dim": 3 } }"#,
            r#"{ "num_bits": 17 }"#,
            r#"{ "quantile": 1.5 }"#,
            r#"{ "weight_config": { "fc": { "group_size": 0 } } }"#,
            r#"{ "weight_config": { "fc": { "width": 2 } } }"#,
        ] {
            assert!(RtnConfig::from_json_str(json).is_err(), "{}", json);
        }
        assert!(RtnConfig::from_json_str(r#"{ "group_dim": 0 }"#).is_ok());
    }

    #[test]
    fn skip_list() {
        let config = RtnConfig {
            skip: vec!["lm_head".into()],
            ..Default::default()
        };
        assert!(config.is_skipped("lm_head"));
        assert!(!config.is_skipped("fc1"));
    }
}
