//! Property-based tests for fused-tensor splitting and name classification.

use std::collections::HashSet;

use ckpt_quant::names::{FusedQkv, QkvLayout, SplitAxis};
use ckpt_quant::{SpecialModel, TensorData, TensorRole, rules_for};
use proptest::prelude::*;

fn arange(shape: &[usize]) -> TensorData {
    let n: usize = shape.iter().product();
    TensorData::new(shape.to_vec(), (0..n).map(|i| i as f32).collect())
}

fn layout_strategy() -> impl Strategy<Value = (QkvLayout, usize)> {
    prop_oneof![
        (1usize..8).prop_map(|d| (QkvLayout::Contiguous, 3 * d)),
        (1usize..6, 1usize..4).prop_map(|(heads, head_dim)| {
            (QkvLayout::HeadInterleaved { num_heads: heads }, 3 * heads * head_dim)
        }),
    ]
}

proptest! {
    /// q, k and v are equal-sized, disjoint, order-preserving and cover the source.
    #[test]
    fn prop_split_partitions_axis(
        (layout, dim) in layout_strategy(),
        cols in 1usize..5,
        split_last in any::<bool>(),
    ) {
        let (shape, axis) = if split_last {
            (vec![cols, dim], SplitAxis::Last)
        } else {
            (vec![dim, cols], SplitAxis::First)
        };
        let source = arange(&shape);
        let fused = FusedQkv { layout, axis };
        let resolved = axis.resolve(shape.len());
        let ranges = fused.ranges(dim).unwrap();

        let mut seen = HashSet::new();
        for r in ranges.iter() {
            let part = source.gather_axis(resolved, r);
            prop_assert_eq!(part.shape[resolved], dim / 3);
            prop_assert!(part.values.windows(2).all(|w| w[0] < w[1]));
            for v in &part.values {
                prop_assert!(seen.insert(*v as i64));
            }
        }
        prop_assert_eq!(seen.len(), source.numel());
    }

    /// Falcon layer tensors keep their layer index and never panic on arbitrary input.
    #[test]
    fn prop_falcon_layer_index(layer in 0usize..512) {
        let rules = rules_for(Some(SpecialModel::FalconRw1b));
        let name = format!("transformer.h.{layer}.self_attention.query_key_value.bias");
        let spec = rules.classify(&name).unwrap();
        prop_assert_eq!(spec.layer, Some(layer));
        prop_assert_eq!(spec.role, TensorRole::FusedQkvBias);
        prop_assert_eq!(spec.targets.len(), 3);
    }

    #[test]
    fn prop_classify_never_panics(name in any::<String>()) {
        for model in [None, Some(SpecialModel::FalconRw1b), Some(SpecialModel::Gpt2)] {
            let _ = rules_for(model).classify(&name);
        }
    }
}

#[test]
fn norm_tensors_are_never_quantized() {
    let cases = [
        (Some(SpecialModel::FalconRw1b), "transformer.h.0.input_layernorm.weight"),
        (Some(SpecialModel::FalconRw1b), "transformer.ln_f.bias"),
        (Some(SpecialModel::Gpt2), "transformer.h.3.ln_2.weight"),
        (None, "model.norm.weight"),
    ];
    for (model, name) in cases {
        let spec = rules_for(model).classify(name).unwrap();
        assert_eq!(spec.role, TensorRole::LayerNorm, "{name}");
        assert_eq!(spec.role.category(), None, "{name}");
    }
}
