use std::fs;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use woqpak::utils::{error_stats, ErrorStats};
use woqpak::{
    load_artifact, read_bundle, rtn_quantize, save_artifact, search_clip, write_bundle, DataType,
    FloatBundle, Layer, LayerHost, Model, ModelArtifact, RtnConfig, ScaleDtype, Scheme,
};

/// woqpak CLI: weight-only round-to-nearest quantization of tensor bundles.
#[derive(Parser, Debug)]
#[command(author, version, about = "woqpak weight-only quantizer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Quantize every linear layer of a JSON float tensor bundle.
    Quantize {
        /// Input JSON file describing a FloatBundle
        #[arg(short, long)]
        input: String,
        /// Output file: a JSON bundle, or a binary artifact with --return-int
        #[arg(short, long)]
        output: String,
        #[command(flatten)]
        quant: QuantArgs,
    },
    /// Expand a packed artifact back into a JSON float bundle.
    Recover {
        /// Input binary artifact file
        #[arg(short, long)]
        input: String,
        /// Output JSON file for the recovered FloatBundle
        #[arg(short, long)]
        output: String,
    },
    /// Inspect an artifact and print a human-readable summary.
    Inspect {
        /// Input binary artifact file
        #[arg(short, long)]
        input: String,
    },
    /// Search the clip quantile of every linear layer and print the result.
    SearchClip {
        /// Input JSON file describing a FloatBundle
        #[arg(short, long)]
        input: String,
        #[command(flatten)]
        quant: QuantArgs,
    },
    /// Benchmark codecs and print a size/error table.
    Bench {
        /// Input JSON file describing a FloatBundle
        #[arg(short, long)]
        input: String,
    },
}

/// Settings layered over the defaults, or over `--config` when given.
#[derive(Args, Debug)]
struct QuantArgs {
    /// JSON file with an RtnConfig
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    bits: Option<u32>,
    /// Columns per group, -1 for whole rows
    #[arg(long, allow_hyphen_values = true)]
    group_size: Option<i64>,
    /// sym or asym
    #[arg(long)]
    scheme: Option<String>,
    /// int, nf4, fp4, fp4_e2m1_bnb or fp4_e2m1
    #[arg(long)]
    data_type: Option<String>,
    #[arg(long)]
    quantile: Option<f32>,
    /// Write a packed binary artifact instead of a fake-quantized bundle
    #[arg(long)]
    return_int: bool,
    #[arg(long)]
    full_range: bool,
    #[arg(long)]
    mse_search: bool,
    /// 0 groups output channels, 1 input channels
    #[arg(long)]
    group_dim: Option<usize>,
    /// Storage word width: 8, 16, 32 or 64
    #[arg(long)]
    storage_bits: Option<u32>,
    #[arg(long)]
    compression_dim: Option<usize>,
    /// f32, f16 or bf16
    #[arg(long)]
    scale_dtype: Option<String>,
}

impl QuantArgs {
    fn to_config(&self) -> Result<RtnConfig> {
        let mut config = match &self.config {
            Some(path) => RtnConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config file: {}", path))?,
            None => RtnConfig::default(),
        };
        if let Some(bits) = self.bits {
            config.num_bits = bits;
        }
        if let Some(g) = self.group_size {
            config.group_size = g;
        }
        if let Some(s) = &self.scheme {
            config.scheme = s.parse::<Scheme>()?;
        }
        if let Some(d) = &self.data_type {
            config.data_type = d.parse::<DataType>()?;
        }
        if let Some(q) = self.quantile {
            config.quantile = q;
        }
        config.return_int |= self.return_int;
        config.full_range |= self.full_range;
        config.enable_mse_search |= self.mse_search;
        if let Some(dim) = self.group_dim {
            config.group_dim = dim;
        }
        if let Some(bits) = self.storage_bits {
            config.pack.storage_bits = bits;
        }
        if let Some(dim) = self.compression_dim {
            config.pack.compression_dim = dim;
        }
        if let Some(dt) = &self.scale_dtype {
            config.pack.scale_dtype = dt.parse::<ScaleDtype>()?;
        }
        config.validate().context("Invalid quantization settings")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Quantize {
            input,
            output,
            quant,
        } => quantize_cmd(&input, &output, &quant)?,
        Commands::Recover { input, output } => recover_cmd(&input, &output)?,
        Commands::Inspect { input } => inspect_cmd(&input)?,
        Commands::SearchClip { input, quant } => search_clip_cmd(&input, &quant)?,
        Commands::Bench { input } => bench_cmd(&input)?,
    }

    Ok(())
}

fn load_model(input: &str) -> Result<(FloatBundle, Model)> {
    let bundle = read_bundle(input)
        .with_context(|| format!("Failed to read input JSON bundle: {}", input))?;
    let model = Model::from_bundle(&bundle).context("Failed to build model from bundle")?;
    Ok((bundle, model))
}

/// Error statistics over all weights shared by two bundles.
fn bundle_error(original: &FloatBundle, restored: &FloatBundle) -> ErrorStats {
    let mut a = Vec::new();
    let mut b = Vec::new();
    for o in &original.tensors {
        if let Some(r) = restored
            .tensors
            .iter()
            .find(|r| r.name == o.name && r.shape == o.shape)
        {
            a.extend_from_slice(&o.data);
            b.extend_from_slice(&r.data);
        }
    }
    error_stats(&a, &b)
}

fn print_error(stats: &ErrorStats) {
    if stats.count > 0 {
        println!("Reconstruction error (over {} values):", stats.count);
        println!("  MSE:  {:.6}", stats.mse);
        println!("  MAE:  {:.6}", stats.mae);
        println!("  MAX:  {:.6}", stats.max);
    }
}

fn quantize_cmd(input: &str, output: &str, quant: &QuantArgs) -> Result<()> {
    let config = quant.to_config()?;
    let (bundle, mut model) = load_model(input)?;

    let report = rtn_quantize(&mut model, &config).context("Quantization failed")?;
    for layer in &report.layers {
        println!(
            "  {:<24} bits={} group_size={} scheme={} dtype={} quantile={:.3} mse={:.3e}",
            layer.name,
            layer.params.num_bits,
            layer.params.group_size,
            layer.params.scheme,
            layer.params.data_type,
            layer.params.quantile,
            layer.mse
        );
    }

    let restored = model.to_bundle();
    let output_bytes = if config.return_int {
        let artifact = ModelArtifact::new(model);
        save_artifact(output, &artifact)
            .with_context(|| format!("Failed to write artifact file: {}", output))?;
        fs::metadata(output)
            .with_context(|| format!("Failed to stat artifact file: {}", output))?
            .len()
    } else {
        write_bundle(output, &restored)
            .with_context(|| format!("Failed to write JSON bundle: {}", output))?;
        fs::metadata(output)
            .with_context(|| format!("Failed to stat JSON bundle: {}", output))?
            .len()
    };

    let input_bytes = fs::metadata(input)
        .with_context(|| format!("Failed to stat input JSON bundle: {}", input))?
        .len();
    println!("Input size:        {} bytes", input_bytes);
    println!("Output size:       {} bytes", output_bytes);
    if output_bytes > 0 {
        let ratio = input_bytes as f64 / output_bytes as f64;
        println!("Compression ratio: {:.2}x (input / output)", ratio);
    }
    print_error(&bundle_error(&bundle, &restored));

    Ok(())
}

fn recover_cmd(input: &str, output: &str) -> Result<()> {
    let artifact =
        load_artifact(input).with_context(|| format!("Failed to load artifact file: {}", input))?;
    let bundle = artifact.model.to_bundle();
    write_bundle(output, &bundle)
        .with_context(|| format!("Failed to write JSON bundle: {}", output))?;

    println!(
        "Recovered {} tensors from {} into {}",
        bundle.tensors.len(),
        input,
        output
    );

    Ok(())
}

fn inspect_cmd(input: &str) -> Result<()> {
    let artifact =
        load_artifact(input).with_context(|| format!("Failed to load artifact file: {}", input))?;

    println!("Artifact: {}", input);
    println!("  Version: {}", artifact.version);
    println!("  Layers:  {}", artifact.model.layers().count());
    println!("  Bytes:   {}", artifact.model.size_bytes());

    for (name, layer) in artifact.model.layers() {
        match layer {
            Layer::WeightOnly(l) => println!(
                "    - {}: {}, codec {:?}, {} bit words packed along dim {}, {:.2}x",
                name,
                l,
                l.codec(),
                l.storage().bits(),
                l.compression_dim().index(),
                l.compression_ratio()
            ),
            Layer::Linear(l) => println!(
                "    - {}: float, shape {:?}, bias={}",
                name,
                l.weight.shape(),
                l.bias.is_some()
            ),
        }
    }
    for t in artifact.model.passthrough() {
        println!("    - {}: passthrough, shape {:?}", t.name, t.shape);
    }

    Ok(())
}

fn search_clip_cmd(input: &str, quant: &QuantArgs) -> Result<()> {
    let config = quant.to_config()?;
    let (_, model) = load_model(input)?;

    println!("Clip search for {}:", input);
    println!("  {:<24} {:>10} {:>14} {:>14}", "layer", "quantile", "MSE", "MSE@1.0");
    for name in model.linear_names() {
        let Some(linear) = model.linear(&name) else {
            continue;
        };
        let weight = if config.group_dim == 0 {
            linear.weight.transpose()
        } else {
            linear.weight.clone()
        };
        let res = search_clip(&weight, &config.params_for(&name))
            .with_context(|| format!("Clip search failed for layer {}", name))?;
        let at_one = res.history.first().map_or(f64::NAN, |h| h.1);
        println!(
            "  {:<24} {:>10.3} {:>14.6e} {:>14.6e}",
            name, res.best_quantile, res.best_mse, at_one
        );
    }

    Ok(())
}

struct Candidate {
    label: &'static str,
    bytes: usize,
    stats: ErrorStats,
}

fn bench_configs() -> Vec<(&'static str, RtnConfig)> {
    let packed = |num_bits: u32, group_size: i64, scheme: Scheme, data_type: DataType| RtnConfig {
        num_bits,
        group_size,
        scheme,
        data_type,
        return_int: true,
        ..Default::default()
    };
    vec![
        ("int8_sym_g128", packed(8, 128, Scheme::Sym, DataType::Int)),
        ("int4_asym_g32", packed(4, 32, Scheme::Asym, DataType::Int)),
        ("int4_sym_g32", packed(4, 32, Scheme::Sym, DataType::Int)),
        ("int4_asym_g128", packed(4, 128, Scheme::Asym, DataType::Int)),
        ("nf4_g64", packed(4, 64, Scheme::Sym, DataType::Nf4)),
        ("fp4_g64", packed(4, 64, Scheme::Sym, DataType::Fp4Bnb)),
        ("int3_asym_g32", packed(3, 32, Scheme::Asym, DataType::Int)),
        ("int2_asym_g32", packed(2, 32, Scheme::Asym, DataType::Int)),
    ]
}

fn evaluate_codecs(bundle: &FloatBundle, model: &Model) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    for (label, config) in bench_configs() {
        let mut m = model.clone();
        if let Err(e) = rtn_quantize(&mut m, &config) {
            eprintln!("Skipping codec {} due to quantization error: {}", label, e);
            continue;
        }
        let stats = bundle_error(bundle, &m.to_bundle());
        let bytes = ModelArtifact::new(m)
            .to_bytes()
            .context("Failed to serialize artifact")?
            .len();
        out.push(Candidate {
            label,
            bytes,
            stats,
        });
    }
    Ok(out)
}

fn bench_cmd(input: &str) -> Result<()> {
    let (bundle, model) = load_model(input)?;

    let candidates = evaluate_codecs(&bundle, &model)?;

    if candidates.is_empty() {
        return Err(anyhow::Error::msg("No viable codecs evaluated in bench"));
    }

    println!("Codec benchmark for {} ({} float bytes):", input, model.size_bytes());
    println!(
        "  {:<16} {:>12} {:>12} {:>12} {:>12}",
        "codec", "bytes", "MSE", "MAE", "MAX"
    );
    for c in &candidates {
        println!(
            "  {:<16} {:>12} {:>12.6} {:>12.6} {:>12.6}",
            c.label, c.bytes, c.stats.mse, c.stats.mae, c.stats.max
        );
    }

    Ok(())
}
