//! Round-to-nearest weight-only quantization of every linear layer of a host.

use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;

use crate::codec::{DataType, Scheme};
use crate::config::RtnConfig;
use crate::error::{QuantError, Result};
use crate::model::{LayerHost, Linear};
use crate::packed::WeightOnlyLinear;
use crate::quantize::{quant_weight, quant_weight_int, QuantParams};
use crate::search::search_clip;
use crate::tensor::Matrix;
use crate::utils::mean_squared_error;

/// Outcome for one rewritten layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerReport {
    pub name: String,
    /// Effective parameters, including the searched quantile.
    pub params: QuantParams,
    pub mse: f64,
    pub packed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RtnReport {
    pub layers: Vec<LayerReport>,
    pub skipped: Vec<String>,
}

enum Rewrite {
    Float(Matrix<f32>),
    Packed(Box<WeightOnlyLinear>),
}

fn log_params(name: &str, params: &QuantParams) {
    let mut msg = format!(
        "RTN quantization config: num_bits={}, group_size={}, scheme={}, quantile={}",
        params.num_bits, params.group_size, params.scheme, params.quantile
    );
    if params.data_type != DataType::Int {
        msg.push_str(&format!(", dtype={}", params.data_type));
    } else if params.scheme == Scheme::Sym {
        msg.push_str(&format!(", enable_full_range={}", params.full_range));
    }
    debug!("RTN quantized module: {}", name);
    debug!("{}", msg);
}

fn quantize_layer(
    name: &str,
    linear: &Linear,
    config: &RtnConfig,
) -> Result<(Rewrite, LayerReport)> {
    let mut params = config.params_for(name);
    log_params(name, &params);

    let transposed = config.group_dim == 0;
    let oriented;
    let weight = if transposed {
        oriented = linear.weight.transpose();
        &oriented
    } else {
        &linear.weight
    };

    if config.enable_mse_search {
        params.quantile = search_clip(weight, &params)?.best_quantile;
    }

    let (rewrite, mse) = if config.return_int {
        // validated: integer output only groups along input channels
        let int_weight = quant_weight_int(weight, &params)?;
        let mut layer = WeightOnlyLinear::new(
            linear.in_features(),
            linear.out_features(),
            params.num_bits,
            params.group_size,
            int_weight.codec,
            &config.pack,
        )?;
        if linear.bias.is_some() {
            layer = layer.with_bias();
        }
        layer.pack(
            &int_weight.q,
            &int_weight.scale,
            int_weight.zero_point.as_ref(),
            linear.bias.as_deref(),
        )?;
        let mse = mean_squared_error(weight.as_slice(), layer.recover().as_slice());
        (Rewrite::Packed(Box::new(layer)), mse)
    } else {
        let q = quant_weight(weight, &params)?;
        let mse = mean_squared_error(weight.as_slice(), q.as_slice());
        let q = if transposed { q.transpose() } else { q };
        (Rewrite::Float(q), mse)
    };

    let report = LayerReport {
        name: name.to_string(),
        params,
        mse,
        packed: matches!(rewrite, Rewrite::Packed(_)),
    };
    Ok((rewrite, report))
}

/// Quantize every linear layer of `host` with round-to-nearest.
///
/// Layers are quantized in parallel and written back in name order. With
/// `return_int` each layer is replaced by a packed [`WeightOnlyLinear`];
/// otherwise its weight is overwritten by the fake-quantized floats.
pub fn rtn_quantize<H: LayerHost + Sync>(host: &mut H, config: &RtnConfig) -> Result<RtnReport> {
    config.validate()?;

    let (names, skipped): (Vec<String>, Vec<String>) = host
        .linear_names()
        .into_iter()
        .partition(|name| !config.is_skipped(name));
    for name in &skipped {
        info!("skipping layer {}", name);
    }

    let shared: &H = host;
    let results = names
        .par_iter()
        .map(|name| {
            let linear = shared
                .linear(name)
                .ok_or_else(|| QuantError::LayerNotFound(name.clone()))?;
            quantize_layer(name, linear, config)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut report = RtnReport {
        layers: Vec::with_capacity(results.len()),
        skipped,
    };
    for (rewrite, layer_report) in results {
        match rewrite {
            Rewrite::Float(w) => host.set_weight(&layer_report.name, w)?,
            Rewrite::Packed(l) => host.replace(&layer_report.name, *l)?,
        }
        report.layers.push(layer_report);
    }

    info!(
        "RTN quantized {} layers ({} skipped), mean MSE {:.6e}",
        report.layers.len(),
        report.skipped.len(),
        report.mean_mse()
    );
    Ok(report)
}

impl RtnReport {
    pub fn mean_mse(&self) -> f64 {
        if self.layers.is_empty() {
            return 0.0;
        }
        self.layers.iter().map(|l| l.mse).sum::<f64>() / self.layers.len() as f64
    }
}
