//! Tensor naming rules per model family.
//!
//! Each rule set maps a dotted checkpoint name such as
//! `transformer.h.3.self_attention.query_key_value.weight` to the role the
//! tensor plays in the network, the layer it belongs to, and the target
//! name(s) it is written under. Fused query/key/value tensors carry the
//! layout needed to split them.

use std::ops::Range;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::policy::{QuantCategory, SpecialModel};

/// What a tensor does in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    Embedding,
    AttentionWeight,
    AttentionBias,
    FusedQkvWeight,
    FusedQkvBias,
    FeedforwardWeight,
    FeedforwardBias,
    LayerNorm,
    OutputHead,
}

impl TensorRole {
    /// Policy bucket for quantized roles; `None` for tensors kept in float.
    pub fn category(self) -> Option<QuantCategory> {
        match self {
            Self::Embedding | Self::OutputHead => Some(QuantCategory::Embedding),
            Self::AttentionWeight | Self::FusedQkvWeight => Some(QuantCategory::Attention),
            Self::FeedforwardWeight => Some(QuantCategory::Feedforward),
            Self::AttentionBias
            | Self::FusedQkvBias
            | Self::FeedforwardBias
            | Self::LayerNorm => None,
        }
    }

    pub fn is_fused(self) -> bool {
        matches!(self, Self::FusedQkvWeight | Self::FusedQkvBias)
    }
}

/// Coarse position of a tensor in the network, used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Embedding,
    Layer,
    Final,
    Head,
}

/// How q, k and v are laid out along the split axis of a fused tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvLayout {
    /// `[q | k | v]`, each a third of the axis.
    Contiguous,
    /// `[q_0 k_0 v_0 | q_1 k_1 v_1 | ...]`, one block per attention head.
    HeadInterleaved { num_heads: usize },
}

/// Which axis of a fused tensor holds the concatenated projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAxis {
    First,
    Last,
}

impl SplitAxis {
    pub fn resolve(self, ndim: usize) -> usize {
        match self {
            Self::First => 0,
            Self::Last => ndim.saturating_sub(1),
        }
    }
}

/// Splitting recipe for a fused query/key/value tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusedQkv {
    pub layout: QkvLayout,
    pub axis: SplitAxis,
}

impl FusedQkv {
    /// Index ranges along the split axis for q, k and v, in that order.
    pub fn ranges(&self, dim: usize) -> Result<[Vec<Range<usize>>; 3], String> {
        match self.layout {
            QkvLayout::Contiguous => {
                if dim % 3 != 0 {
                    return Err(format!("axis length {dim} is not divisible by 3"));
                }
                let third = dim / 3;
                Ok([vec![0..third], vec![third..2 * third], vec![2 * third..dim]])
            }
            QkvLayout::HeadInterleaved { num_heads } => {
                let block = 3 * num_heads;
                if num_heads == 0 || dim % block != 0 {
                    return Err(format!(
                        "axis length {dim} is not divisible by 3 * {num_heads} heads"
                    ));
                }
                let head_dim = dim / block;
                let mut out: [Vec<Range<usize>>; 3] = Default::default();
                for head in 0..num_heads {
                    let base = head * 3 * head_dim;
                    for (slot, ranges) in out.iter_mut().enumerate() {
                        let start = base + slot * head_dim;
                        ranges.push(start..start + head_dim);
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Classification of a single checkpoint tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub role: TensorRole,
    pub stage: Stage,
    pub layer: Option<usize>,
    /// Position of the matching rule within its stage.
    pub rank: usize,
    pub is_bias: bool,
    /// One target name, or three (q, k, v) for fused tensors.
    pub targets: Vec<String>,
    /// Channel axis for per-channel scales, for quantized roles.
    pub quantize_axis: Option<usize>,
    pub fused: Option<FusedQkv>,
}

impl TensorSpec {
    /// Sort key placing tensors in network order.
    pub fn order_key(&self) -> (Stage, usize, usize, bool) {
        (self.stage, self.layer.unwrap_or(0), self.rank, self.is_bias)
    }
}

/// Model-specific mapping from checkpoint names to roles and targets.
pub trait NamingRules: Send + Sync {
    /// Identifier used in error messages.
    fn model_name(&self) -> &str;

    /// Classify `name`, or `None` when no rule covers it.
    fn classify(&self, name: &str) -> Option<TensorSpec>;
}

/// Naming rules for the selected model; `None` yields the generic HF rules.
pub fn rules_for(special_model: Option<SpecialModel>) -> &'static dyn NamingRules {
    match special_model {
        Some(SpecialModel::FalconRw1b) => &*FALCON_RW_1B,
        Some(SpecialModel::Gpt2) => &*GPT2,
        None => &*GENERIC,
    }
}

/// Number of attention heads in Falcon RW 1B.
pub const FALCON_RW_1B_NUM_HEADS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Embedding,
    Attention,
    FusedQkv,
    Feedforward,
    Norm,
    Head,
}

struct Rule {
    pattern: Regex,
    kind: RuleKind,
    stage: Stage,
    /// Template with `{layer}`, `{param}` and, for fused rules, `{proj}`.
    target: String,
}

/// Regex-driven rule table shared by all built-in model families.
struct RuleTable {
    model: &'static str,
    rules: Vec<Rule>,
    /// Output-channel axis of linear weights (`0` for `[out, in]`).
    linear_axis: usize,
    fused: Option<FusedQkv>,
}

impl RuleTable {
    fn new(model: &'static str, linear_axis: usize, fused: Option<FusedQkv>) -> Self {
        Self { model, rules: Vec::new(), linear_axis, fused }
    }

    fn rule(
        mut self,
        pattern: &str,
        kind: RuleKind,
        stage: Stage,
        target: impl Into<String>,
    ) -> Self {
        // Patterns are literals below; a bad one is a programming error.
        let pattern = Regex::new(pattern).unwrap_or_else(|e| panic!("bad rule {pattern}: {e}"));
        self.rules.push(Rule { pattern, kind, stage, target: target.into() });
        self
    }
}

impl NamingRules for RuleTable {
    fn model_name(&self) -> &str {
        self.model
    }

    fn classify(&self, name: &str) -> Option<TensorSpec> {
        for (rank, rule) in self.rules.iter().enumerate() {
            let Some(caps) = rule.pattern.captures(name) else {
                continue;
            };
            // An index that overflows usize names no real layer.
            let layer = match caps.name("layer") {
                Some(m) => Some(m.as_str().parse::<usize>().ok()?),
                None => None,
            };
            let is_bias = caps.name("param").map(|m| m.as_str() == "bias").unwrap_or(false);

            let role = match (rule.kind, is_bias) {
                (RuleKind::Embedding, _) => TensorRole::Embedding,
                (RuleKind::Head, _) => TensorRole::OutputHead,
                (RuleKind::Norm, _) => TensorRole::LayerNorm,
                (RuleKind::Attention, false) => TensorRole::AttentionWeight,
                (RuleKind::Attention, true) => TensorRole::AttentionBias,
                (RuleKind::FusedQkv, false) => TensorRole::FusedQkvWeight,
                (RuleKind::FusedQkv, true) => TensorRole::FusedQkvBias,
                (RuleKind::Feedforward, false) => TensorRole::FeedforwardWeight,
                (RuleKind::Feedforward, true) => TensorRole::FeedforwardBias,
            };

            let param = match (rule.kind, is_bias) {
                (RuleKind::Norm, false) => "scale",
                (RuleKind::Norm, true) => "bias",
                (_, false) => "w",
                (_, true) => "b",
            };
            let base = rule
                .target
                .replace("{layer}", &layer.unwrap_or(0).to_string())
                .replace("{param}", param);

            let fused = if rule.kind == RuleKind::FusedQkv { self.fused } else { None };
            let targets = if fused.is_some() {
                ["q", "k", "v"].iter().map(|p| base.replace("{proj}", p)).collect()
            } else {
                vec![base]
            };

            let quantize_axis = match role {
                TensorRole::Embedding | TensorRole::OutputHead => Some(0),
                r if r.category().is_some() => Some(self.linear_axis),
                _ => None,
            };

            return Some(TensorSpec {
                role,
                stage: rule.stage,
                layer,
                rank,
                is_bias,
                targets,
                quantize_axis,
                fused,
            });
        }
        None
    }
}

const LAYER: &str = "params.lm.transformer.x_layers_{layer}";

lazy_static! {
    static ref FALCON_RW_1B: RuleTable = RuleTable::new(
        "FALCON_RW_1B",
        0,
        Some(FusedQkv {
            layout: QkvLayout::HeadInterleaved { num_heads: FALCON_RW_1B_NUM_HEADS },
            axis: SplitAxis::First,
        }),
    )
    .rule(r"^transformer\.word_embeddings\.weight$", RuleKind::Embedding, Stage::Embedding,
        "params.lm.token_embedding.w")
    .rule(r"^transformer\.h\.(?P<layer>\d+)\.input_layernorm\.(?P<param>weight|bias)$",
        RuleKind::Norm, Stage::Layer, concat_layer("pre_layer_norm.{param}"))
    .rule(r"^transformer\.h\.(?P<layer>\d+)\.self_attention\.query_key_value\.(?P<param>weight|bias)$",
        RuleKind::FusedQkv, Stage::Layer, concat_layer("self_attention.{proj}.{param}"))
    .rule(r"^transformer\.h\.(?P<layer>\d+)\.self_attention\.dense\.(?P<param>weight|bias)$",
        RuleKind::Attention, Stage::Layer, concat_layer("self_attention.post.{param}"))
    .rule(r"^transformer\.h\.(?P<layer>\d+)\.post_attention_layernorm\.(?P<param>weight|bias)$",
        RuleKind::Norm, Stage::Layer, concat_layer("post_layer_norm.{param}"))
    .rule(r"^transformer\.h\.(?P<layer>\d+)\.mlp\.dense_h_to_4h\.(?P<param>weight|bias)$",
        RuleKind::Feedforward, Stage::Layer, concat_layer("ff_layer.ffn_layer1.{param}"))
    .rule(r"^transformer\.h\.(?P<layer>\d+)\.mlp\.dense_4h_to_h\.(?P<param>weight|bias)$",
        RuleKind::Feedforward, Stage::Layer, concat_layer("ff_layer.ffn_layer2.{param}"))
    .rule(r"^transformer\.ln_f\.(?P<param>weight|bias)$", RuleKind::Norm, Stage::Final,
        "params.lm.final_ln.{param}")
    .rule(r"^lm_head\.weight$", RuleKind::Head, Stage::Head, "params.lm.softmax.logits_ffn.w");

    static ref GPT2: RuleTable = RuleTable::new(
        "GPT2",
        1,
        Some(FusedQkv { layout: QkvLayout::Contiguous, axis: SplitAxis::Last }),
    )
    .rule(r"^(?:transformer\.)?wte\.weight$", RuleKind::Embedding, Stage::Embedding,
        "params.lm.token_embedding.w")
    .rule(r"^(?:transformer\.)?wpe\.weight$", RuleKind::Embedding, Stage::Embedding,
        "params.lm.position_embedding.w")
    .rule(r"^(?:transformer\.)?h\.(?P<layer>\d+)\.ln_1\.(?P<param>weight|bias)$",
        RuleKind::Norm, Stage::Layer, concat_layer("pre_layer_norm.{param}"))
    .rule(r"^(?:transformer\.)?h\.(?P<layer>\d+)\.attn\.c_attn\.(?P<param>weight|bias)$",
        RuleKind::FusedQkv, Stage::Layer, concat_layer("self_attention.{proj}.{param}"))
    .rule(r"^(?:transformer\.)?h\.(?P<layer>\d+)\.attn\.c_proj\.(?P<param>weight|bias)$",
        RuleKind::Attention, Stage::Layer, concat_layer("self_attention.post.{param}"))
    .rule(r"^(?:transformer\.)?h\.(?P<layer>\d+)\.ln_2\.(?P<param>weight|bias)$",
        RuleKind::Norm, Stage::Layer, concat_layer("post_layer_norm.{param}"))
    .rule(r"^(?:transformer\.)?h\.(?P<layer>\d+)\.mlp\.c_fc\.(?P<param>weight|bias)$",
        RuleKind::Feedforward, Stage::Layer, concat_layer("ff_layer.ffn_layer1.{param}"))
    .rule(r"^(?:transformer\.)?h\.(?P<layer>\d+)\.mlp\.c_proj\.(?P<param>weight|bias)$",
        RuleKind::Feedforward, Stage::Layer, concat_layer("ff_layer.ffn_layer2.{param}"))
    .rule(r"^(?:transformer\.)?ln_f\.(?P<param>weight|bias)$", RuleKind::Norm, Stage::Final,
        "params.lm.final_ln.{param}")
    .rule(r"^lm_head\.weight$", RuleKind::Head, Stage::Head, "params.lm.softmax.logits_ffn.w");

    static ref GENERIC: RuleTable = RuleTable::new("generic", 0, None)
    .rule(r"^model\.embed_tokens\.weight$", RuleKind::Embedding, Stage::Embedding,
        "params.lm.token_embedding.w")
    .rule(r"^model\.layers\.(?P<layer>\d+)\.input_layernorm\.(?P<param>weight|bias)$",
        RuleKind::Norm, Stage::Layer, concat_layer("pre_layer_norm.{param}"))
    .rule(r"^model\.layers\.(?P<layer>\d+)\.self_attn\.q_proj\.(?P<param>weight|bias)$",
        RuleKind::Attention, Stage::Layer, concat_layer("self_attention.q.{param}"))
    .rule(r"^model\.layers\.(?P<layer>\d+)\.self_attn\.k_proj\.(?P<param>weight|bias)$",
        RuleKind::Attention, Stage::Layer, concat_layer("self_attention.k.{param}"))
    .rule(r"^model\.layers\.(?P<layer>\d+)\.self_attn\.v_proj\.(?P<param>weight|bias)$",
        RuleKind::Attention, Stage::Layer, concat_layer("self_attention.v.{param}"))
    .rule(r"^model\.layers\.(?P<layer>\d+)\.self_attn\.o_proj\.(?P<param>weight|bias)$",
        RuleKind::Attention, Stage::Layer, concat_layer("self_attention.post.{param}"))
    .rule(r"^model\.layers\.(?P<layer>\d+)\.post_attention_layernorm\.(?P<param>weight|bias)$",
        RuleKind::Norm, Stage::Layer, concat_layer("post_layer_norm.{param}"))
    .rule(r"^model\.layers\.(?P<layer>\d+)\.mlp\.gate_proj\.(?P<param>weight|bias)$",
        RuleKind::Feedforward, Stage::Layer, concat_layer("ff_layer.ffn_layer1_gate.{param}"))
    .rule(r"^model\.layers\.(?P<layer>\d+)\.mlp\.up_proj\.(?P<param>weight|bias)$",
        RuleKind::Feedforward, Stage::Layer, concat_layer("ff_layer.ffn_layer1.{param}"))
    .rule(r"^model\.layers\.(?P<layer>\d+)\.mlp\.down_proj\.(?P<param>weight|bias)$",
        RuleKind::Feedforward, Stage::Layer, concat_layer("ff_layer.ffn_layer2.{param}"))
    .rule(r"^model\.norm\.(?P<param>weight|bias)$", RuleKind::Norm, Stage::Final,
        "params.lm.final_ln.{param}")
    .rule(r"^lm_head\.weight$", RuleKind::Head, Stage::Head, "params.lm.softmax.logits_ffn.w");
}

fn concat_layer(suffix: &str) -> String {
    format!("{LAYER}.{suffix}")
}
