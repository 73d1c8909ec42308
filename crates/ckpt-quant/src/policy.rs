//! Quantization policy: per-category bit widths, symmetry and model selection.
//!
//! A [`QuantPolicy`] can be built in code, loaded from a TOML file, or read
//! from `CKPT_QUANT_*` environment variables. Values given in a file are
//! overridden by the environment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LoaderError;

/// Bit widths an action may request.
pub const SUPPORTED_BITS: &[u8] = &[4, 8];

/// Target integer width of a quantized tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QuantBits {
    Int4,
    Int8,
}

impl QuantBits {
    pub fn bits(self) -> u8 {
        match self {
            Self::Int4 => 4,
            Self::Int8 => 8,
        }
    }

    /// Inclusive integer range of the quantized values.
    ///
    /// Symmetric ranges are narrowed by one so that zero sits in the middle
    /// (`[-127, 127]` rather than `[-128, 127]`).
    pub fn qrange(self, symmetric: bool) -> (i32, i32) {
        let half = 1i32 << (self.bits() - 1);
        if symmetric {
            (-(half - 1), half - 1)
        } else {
            (-half, half - 1)
        }
    }
}

impl TryFrom<u8> for QuantBits {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            4 => Ok(Self::Int4),
            8 => Ok(Self::Int8),
            other => Err(format!("unsupported bit width: {other}")),
        }
    }
}

impl From<QuantBits> for u8 {
    fn from(bits: QuantBits) -> Self {
        bits.bits()
    }
}

impl std::fmt::Display for QuantBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "int{}", self.bits())
    }
}

/// Policy bucket a tensor falls into when its bit width is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantCategory {
    Attention,
    Feedforward,
    Embedding,
}

impl QuantCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attention => "attention",
            Self::Feedforward => "feedforward",
            Self::Embedding => "embedding",
        }
    }
}

/// Model family whose tensor naming and fused-tensor layout should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialModel {
    /// Falcon RW 1B: fused `query_key_value`, interleaved per attention head.
    #[serde(rename = "FALCON_RW_1B")]
    FalconRw1b,
    /// GPT-2: fused `c_attn`, contiguous thirds, Conv1D `[in, out]` weights.
    #[serde(rename = "GPT2")]
    Gpt2,
}

impl std::fmt::Display for SpecialModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FalconRw1b => write!(f, "FALCON_RW_1B"),
            Self::Gpt2 => write!(f, "GPT2"),
        }
    }
}

impl std::str::FromStr for SpecialModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "FALCON_RW_1B" => Ok(Self::FalconRw1b),
            "GPT2" | "GPT_2" => Ok(Self::Gpt2),
            other => Err(format!("unknown special model: {other}")),
        }
    }
}

/// Errors that can occur when loading or validating a [`QuantPolicy`].
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

/// Bit widths and symmetry applied to each tensor category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantPolicy {
    /// Bits for attention projection weights.
    /// Override: `CKPT_QUANT_ATTENTION_BITS`
    pub attention_quant_bits: u8,

    /// Bits for feedforward (MLP) weights.
    /// Override: `CKPT_QUANT_FEEDFORWARD_BITS`
    pub feedforward_quant_bits: u8,

    /// Bits for token embeddings and the output head.
    /// Override: `CKPT_QUANT_EMBEDDING_BITS`
    pub embedding_quant_bits: u8,

    /// Symmetric (zero point fixed at 0) or asymmetric quantization.
    /// Override: `CKPT_QUANT_SYMMETRIC`
    pub is_symmetric: bool,

    /// Naming rules to apply; `None` selects the generic HF layout.
    /// Override: `CKPT_QUANT_SPECIAL_MODEL` (`none` clears it)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_model: Option<SpecialModel>,
}

impl Default for QuantPolicy {
    fn default() -> Self {
        Self {
            attention_quant_bits: 8,
            feedforward_quant_bits: 8,
            embedding_quant_bits: 8,
            is_symmetric: true,
            special_model: None,
        }
    }
}

impl QuantPolicy {
    pub fn new(
        is_symmetric: bool,
        attention_quant_bits: u8,
        feedforward_quant_bits: u8,
        embedding_quant_bits: u8,
        special_model: Option<SpecialModel>,
    ) -> Self {
        Self {
            attention_quant_bits,
            feedforward_quant_bits,
            embedding_quant_bits,
            is_symmetric,
            special_model,
        }
    }

    /// Generate a default policy TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load a policy from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, PolicyError> {
        let mut policy: QuantPolicy = toml::from_str(toml_str)?;
        policy.apply_env_overrides()?;
        policy.validate()?;
        Ok(policy)
    }

    /// Start from defaults and apply environment overrides only.
    pub fn from_env() -> Result<Self, PolicyError> {
        let mut policy = Self::default();
        policy.apply_env_overrides()?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for category in
            [QuantCategory::Attention, QuantCategory::Feedforward, QuantCategory::Embedding]
        {
            let bits = self.raw_bits(category);
            if !SUPPORTED_BITS.contains(&bits) {
                return Err(PolicyError::Validation(format!(
                    "{}_quant_bits must be one of {SUPPORTED_BITS:?}, got {bits}",
                    category.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Bit width configured for `category`, as given.
    pub fn raw_bits(&self, category: QuantCategory) -> u8 {
        match category {
            QuantCategory::Attention => self.attention_quant_bits,
            QuantCategory::Feedforward => self.feedforward_quant_bits,
            QuantCategory::Embedding => self.embedding_quant_bits,
        }
    }

    /// Bit width for `category`, rejecting unsupported values.
    pub fn bits_for(&self, category: QuantCategory) -> Result<QuantBits, LoaderError> {
        let bits = self.raw_bits(category);
        QuantBits::try_from(bits).map_err(|_| LoaderError::UnsupportedBitWidth {
            category: category.as_str(),
            bits,
        })
    }

    /// Apply `CKPT_QUANT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), PolicyError> {
        for (key, slot) in [
            ("CKPT_QUANT_ATTENTION_BITS", &mut self.attention_quant_bits),
            ("CKPT_QUANT_FEEDFORWARD_BITS", &mut self.feedforward_quant_bits),
            ("CKPT_QUANT_EMBEDDING_BITS", &mut self.embedding_quant_bits),
        ] {
            if let Ok(val) = std::env::var(key) {
                *slot = val.parse::<u8>().map_err(|e| PolicyError::EnvOverride {
                    key: key.into(),
                    value: val.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        if let Ok(val) = std::env::var("CKPT_QUANT_SYMMETRIC") {
            self.is_symmetric = match val.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(PolicyError::EnvOverride {
                        key: "CKPT_QUANT_SYMMETRIC".into(),
                        value: val.clone(),
                        reason: "expected a boolean".into(),
                    });
                }
            };
        }

        if let Ok(val) = std::env::var("CKPT_QUANT_SPECIAL_MODEL") {
            self.special_model = if val.is_empty() || val.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(val.parse::<SpecialModel>().map_err(|reason| {
                    PolicyError::EnvOverride {
                        key: "CKPT_QUANT_SPECIAL_MODEL".into(),
                        value: val.clone(),
                        reason,
                    }
                })?)
            };
        }

        Ok(())
    }
}
