//! Checkpoint quantization planner
//!
//! Loads a SafeTensors checkpoint, derives the per-tensor quantization
//! actions (splitting fused query/key/value tensors), optionally runs the
//! reference quantizer on each action, and writes a JSON plan.
//!
//! # Usage
//!
//! ```bash
//! # Plan a Falcon RW 1B conversion with 4-bit feedforward weights
//! ckpt-convert --input falcon.safetensors --special-model FALCON_RW_1B \
//!              --feedforward-bits 4 --output plan.json
//!
//! # Read the policy from a TOML file and measure reconstruction error
//! ckpt-convert --input model.safetensors --config policy.toml --quantize
//! ```
//!
//! Policy precedence: command-line flags, then `CKPT_QUANT_*` environment
//! variables, then the `--config` file, then built-in defaults.

mod report;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ckpt_quant::{CkptLoader, QuantPolicy, SpecialModel, quantize_action};
use clap::Parser;
use report::{PlanEntry, PlanReport};

/// Derive quantization actions for a transformer checkpoint
#[derive(Parser, Debug)]
#[command(name = "ckpt-convert")]
#[command(about = "Derive per-tensor quantization actions for a SafeTensors checkpoint")]
#[command(version)]
struct Args {
    /// Input SafeTensors checkpoint
    #[arg(short, long)]
    input: PathBuf,

    /// Model family selecting naming and splitting rules (FALCON_RW_1B, GPT2)
    #[arg(short = 'm', long)]
    special_model: Option<SpecialModel>,

    /// Bit width for attention weights (4 or 8)
    #[arg(long)]
    attention_bits: Option<u8>,

    /// Bit width for feedforward weights (4 or 8)
    #[arg(long)]
    feedforward_bits: Option<u8>,

    /// Bit width for embeddings and the output head (4 or 8)
    #[arg(long)]
    embedding_bits: Option<u8>,

    /// Use asymmetric quantization (per-channel zero points)
    #[arg(long, conflicts_with = "symmetric")]
    asymmetric: bool,

    /// Force symmetric quantization over the config file and environment
    #[arg(long)]
    symmetric: bool,

    /// Policy TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the JSON plan here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run the reference quantizer and report reconstruction error
    #[arg(short, long)]
    quantize: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let policy = resolve_policy(&args)?;

    tracing::info!("Input: {}", args.input.display());
    tracing::info!(
        "Policy: attention={} feedforward={} embedding={} symmetric={} model={}",
        policy.attention_quant_bits,
        policy.feedforward_quant_bits,
        policy.embedding_quant_bits,
        policy.is_symmetric,
        policy.special_model.map(|m| m.to_string()).unwrap_or_else(|| "generic".into())
    );

    let report = build_plan(&args.input, policy, args.quantize)?;

    match &args.output {
        Some(path) => report.write(path)?,
        None => println!("{}", report.to_json()?),
    }

    tracing::info!("Plan complete!");
    tracing::info!(
        "  Actions: {} (quantized: {})",
        report.total_actions,
        report.quantized_actions
    );
    if let Some(path) = &args.output {
        tracing::info!("  Output: {}", path.display());
    }

    Ok(())
}

/// Merge the config file, environment and command-line flags.
fn resolve_policy(args: &Args) -> Result<QuantPolicy> {
    let mut policy = match &args.config {
        Some(path) => QuantPolicy::load(path)
            .with_context(|| format!("Failed to load policy: {}", path.display()))?,
        None => QuantPolicy::from_env().context("Invalid CKPT_QUANT_* environment")?,
    };

    if let Some(bits) = args.attention_bits {
        policy.attention_quant_bits = bits;
    }
    if let Some(bits) = args.feedforward_bits {
        policy.feedforward_quant_bits = bits;
    }
    if let Some(bits) = args.embedding_bits {
        policy.embedding_quant_bits = bits;
    }
    if args.asymmetric {
        policy.is_symmetric = false;
    } else if args.symmetric {
        policy.is_symmetric = true;
    }
    if args.special_model.is_some() {
        policy.special_model = args.special_model;
    }

    policy.validate().context("Invalid quantization policy")?;
    Ok(policy)
}

/// Load the checkpoint and turn its actions into a plan report.
fn build_plan(input: &Path, policy: QuantPolicy, quantize: bool) -> Result<PlanReport> {
    let loader = CkptLoader::new(input, policy)
        .with_context(|| format!("Failed to open checkpoint: {}", input.display()))?;
    let actions = loader
        .load_to_actions()
        .with_context(|| format!("Failed to derive actions: {}", input.display()))?;

    let mut entries = Vec::with_capacity(actions.len());
    for action in &actions {
        let quantized = if quantize {
            quantize_action(action)
                .with_context(|| format!("Failed to quantize: {}", action.target_name))?
        } else {
            None
        };
        if let Some(q) = &quantized {
            tracing::debug!(
                "{}: {} scales, ratio {:.2}",
                action.target_name,
                q.scales.len(),
                q.compression_ratio()
            );
        }
        entries.push(PlanEntry::new(action, quantized.as_ref()));
    }

    Ok(PlanReport::new(input, loader.policy(), entries))
}
