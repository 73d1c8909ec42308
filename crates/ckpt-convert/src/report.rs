//! JSON plan report written by `ckpt-convert`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ckpt_quant::{ActionSummary, QuantPolicy, QuantizationAction, QuantizedTensor};
use serde::Serialize;

/// One action plus the outcome of quantizing it, if requested.
#[derive(Debug, Serialize)]
pub struct PlanEntry {
    #[serde(flatten)]
    pub action: ActionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_abs_error: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f32>,
}

impl PlanEntry {
    pub fn new(action: &QuantizationAction, quantized: Option<&QuantizedTensor>) -> Self {
        Self {
            action: action.summary(),
            max_abs_error: quantized.map(|q| q.max_abs_error(&action.tensor_value)),
            compression_ratio: quantized.map(QuantizedTensor::compression_ratio),
        }
    }
}

/// Full conversion plan for one checkpoint.
#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub source: String,
    pub policy: QuantPolicy,
    pub total_actions: usize,
    pub quantized_actions: usize,
    pub conversion_tool: &'static str,
    pub conversion_version: &'static str,
    pub actions: Vec<PlanEntry>,
}

impl PlanReport {
    pub fn new(source: &Path, policy: &QuantPolicy, actions: Vec<PlanEntry>) -> Self {
        let quantized_actions = actions.iter().filter(|e| e.action.quantize_bits.is_some()).count();
        Self {
            source: source.display().to_string(),
            policy: policy.clone(),
            total_actions: actions.len(),
            quantized_actions,
            conversion_tool: "ckpt-convert",
            conversion_version: env!("CARGO_PKG_VERSION"),
            actions,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize plan")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
        tracing::debug!("Wrote plan: {}", path.display());
        Ok(())
    }
}
