//! Checkpoint loader: turns a checkpoint into an ordered list of
//! quantization actions.
//!
//! Tensors are classified with the naming rules of the selected model,
//! assigned the bit width of their category, and fused query/key/value
//! tensors are split into separate q, k and v actions. The resulting list is
//! in network order: embeddings, layers by ascending index, final norm,
//! output head.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::action::QuantizationAction;
use crate::error::{LoaderError, Result};
use crate::names::{NamingRules, TensorSpec, rules_for};
use crate::policy::{QuantBits, QuantCategory, QuantPolicy, SpecialModel};
use crate::reader::{NamedTensor, SafeTensorsReader, TensorSource};

/// Loads a checkpoint and derives its quantization actions.
pub struct CkptLoader {
    ckpt_path: PathBuf,
    policy: QuantPolicy,
    rules: &'static dyn NamingRules,
}

impl std::fmt::Debug for CkptLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CkptLoader")
            .field("ckpt_path", &self.ckpt_path)
            .field("policy", &self.policy)
            .field("rules", &self.rules.model_name())
            .finish()
    }
}

impl CkptLoader {
    /// Create a loader for `ckpt_path` with the given policy.
    ///
    /// Fails if the path is not an existing file or a bit width is not
    /// supported. The policy is stored as given.
    pub fn new(ckpt_path: impl Into<PathBuf>, policy: QuantPolicy) -> Result<Self> {
        let ckpt_path = ckpt_path.into();
        for category in
            [QuantCategory::Attention, QuantCategory::Feedforward, QuantCategory::Embedding]
        {
            policy.bits_for(category)?;
        }
        if !ckpt_path.is_file() {
            return Err(LoaderError::CheckpointNotFound { path: ckpt_path });
        }

        let rules = rules_for(policy.special_model);
        Ok(Self { ckpt_path, policy, rules })
    }

    /// Positional constructor mirroring the individual policy fields.
    pub fn from_parts(
        ckpt_path: impl Into<PathBuf>,
        is_symmetric: bool,
        attention_quant_bits: u8,
        feedforward_quant_bits: u8,
        embedding_quant_bits: u8,
        special_model: Option<SpecialModel>,
    ) -> Result<Self> {
        Self::new(
            ckpt_path,
            QuantPolicy::new(
                is_symmetric,
                attention_quant_bits,
                feedforward_quant_bits,
                embedding_quant_bits,
                special_model,
            ),
        )
    }

    pub fn ckpt_path(&self) -> &Path {
        &self.ckpt_path
    }

    pub fn is_symmetric(&self) -> bool {
        self.policy.is_symmetric
    }

    pub fn attention_quant_bits(&self) -> u8 {
        self.policy.attention_quant_bits
    }

    pub fn feedforward_quant_bits(&self) -> u8 {
        self.policy.feedforward_quant_bits
    }

    pub fn embedding_quant_bits(&self) -> u8 {
        self.policy.embedding_quant_bits
    }

    pub fn special_model(&self) -> Option<SpecialModel> {
        self.policy.special_model
    }

    pub fn policy(&self) -> &QuantPolicy {
        &self.policy
    }

    /// Read the checkpoint and derive its actions.
    pub fn load_to_actions(&self) -> Result<Vec<QuantizationAction>> {
        tracing::info!(
            "Loading checkpoint: {} (model: {})",
            self.ckpt_path.display(),
            self.rules.model_name()
        );
        let tensors = SafeTensorsReader::new(&self.ckpt_path).read_tensors()?;
        self.actions_from_tensors(tensors)
    }

    /// Derive actions from already decoded tensors.
    pub fn actions_from_tensors(
        &self,
        tensors: Vec<NamedTensor>,
    ) -> Result<Vec<QuantizationAction>> {
        let source_count = tensors.len();

        let mut classified: Vec<(TensorSpec, NamedTensor)> = Vec::with_capacity(source_count);
        for tensor in tensors {
            let spec = self.rules.classify(&tensor.name).ok_or_else(|| {
                LoaderError::UnrecognizedTensor {
                    name: tensor.name.clone(),
                    model: self.rules.model_name().to_string(),
                }
            })?;
            tracing::debug!("{} -> {:?} (layer {:?})", tensor.name, spec.role, spec.layer);
            classified.push((spec, tensor));
        }
        classified.sort_by(|(a, ta), (b, tb)| {
            a.order_key().cmp(&b.order_key()).then_with(|| ta.name.cmp(&tb.name))
        });

        let mut actions = Vec::with_capacity(source_count + 4);
        let mut split_count = 0;
        for (spec, tensor) in classified {
            let bits = match spec.role.category() {
                Some(category) => Some(self.policy.bits_for(category)?),
                None => None,
            };
            if spec.fused.is_some() {
                split_count += 1;
                actions.extend(self.split_fused(&spec, tensor, bits)?);
            } else {
                let target = spec.targets.first().cloned().unwrap_or_else(|| tensor.name.clone());
                actions.push(self.make_action(&spec, tensor.name, target, tensor.data, bits)?);
            }
        }

        ensure_unique_targets(&actions)?;

        let quantized = actions.iter().filter(|a| a.is_quantized()).count();
        tracing::info!(
            "Derived {} actions from {} tensors ({} quantized, {} fused tensors split)",
            actions.len(),
            source_count,
            quantized,
            split_count
        );
        Ok(actions)
    }

    fn split_fused(
        &self,
        spec: &TensorSpec,
        tensor: NamedTensor,
        bits: Option<QuantBits>,
    ) -> Result<Vec<QuantizationAction>> {
        let NamedTensor { name, data } = tensor;
        let invalid = |reason: String| LoaderError::InvalidSplit {
            name: name.clone(),
            shape: data.shape.clone(),
            reason,
        };

        let fused = match spec.fused {
            Some(fused) => fused,
            None => return Err(invalid("tensor is not fused".into())),
        };
        if data.ndim() == 0 {
            return Err(invalid("scalar tensors cannot be split".into()));
        }
        if spec.targets.len() != 3 {
            return Err(invalid(format!("expected 3 targets, got {}", spec.targets.len())));
        }

        let axis = fused.axis.resolve(data.ndim());
        let ranges = fused.ranges(data.shape[axis]).map_err(&invalid)?;

        let mut out = Vec::with_capacity(3);
        for (target, ranges) in spec.targets.iter().zip(ranges.iter()) {
            let part = data.gather_axis(axis, ranges);
            tracing::debug!("{} split -> {} {:?}", name, target, part.shape);
            out.push(self.make_action(spec, name.clone(), target.clone(), part, bits)?);
        }
        Ok(out)
    }

    fn make_action(
        &self,
        spec: &TensorSpec,
        tensor_name: String,
        target_name: String,
        tensor_value: crate::tensor::TensorData,
        bits: Option<QuantBits>,
    ) -> Result<QuantizationAction> {
        let quantize_axis = if bits.is_some() { spec.quantize_axis } else { None };
        if let Some(axis) = quantize_axis {
            if axis >= tensor_value.ndim() {
                return Err(LoaderError::Quantization {
                    name: tensor_name,
                    reason: format!(
                        "channel axis {axis} out of range for shape {:?}",
                        tensor_value.shape
                    ),
                });
            }
        }
        let pack_dim = match bits {
            Some(QuantBits::Int4) => tensor_value.ndim().checked_sub(1),
            _ => None,
        };

        Ok(QuantizationAction {
            tensor_name,
            target_name,
            role: spec.role,
            layer: spec.layer,
            tensor_value,
            quantize_axis,
            quantize_bits: bits,
            pack_dim,
            is_symmetric: self.policy.is_symmetric,
        })
    }
}

/// Every target name may be written once.
fn ensure_unique_targets(actions: &[QuantizationAction]) -> Result<()> {
    let mut seen: HashMap<&str, &str> = HashMap::with_capacity(actions.len());
    for action in actions {
        if let Some(first) = seen.insert(&action.target_name, &action.tensor_name) {
            return Err(LoaderError::DuplicateTarget {
                target: action.target_name.clone(),
                first: first.to_string(),
                second: action.tensor_name.clone(),
            });
        }
    }
    Ok(())
}
