//! Shared fixture builders for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value as Json, json};

/// Builds a small F32 SafeTensors checkpoint on disk.
#[derive(Default)]
pub struct CheckpointBuilder {
    tensors: Vec<(String, Vec<usize>, Vec<f32>)>,
}

impl CheckpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor whose values are `offset, offset + 1, ...` in row-major order.
    pub fn arange(mut self, name: &str, shape: &[usize], offset: f32) -> Self {
        let n: usize = shape.iter().product();
        let values = (0..n).map(|i| offset + i as f32).collect();
        self.tensors.push((name.to_string(), shape.to_vec(), values));
        self
    }

    pub fn tensor(mut self, name: &str, shape: &[usize], values: Vec<f32>) -> Self {
        self.tensors.push((name.to_string(), shape.to_vec(), values));
        self
    }

    /// SafeTensors layout: header_size (u64 le) | header_json | tensor_data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = Map::new();
        let mut data = Vec::new();
        for (name, shape, values) in &self.tensors {
            let start = data.len();
            data.extend_from_slice(bytemuck::cast_slice::<f32, u8>(values));
            header.insert(
                name.clone(),
                json!({ "dtype": "F32", "shape": shape, "data_offsets": [start, data.len()] }),
            );
        }
        let header = serde_json::to_string(&Json::Object(header)).unwrap();

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(header.len() as u64).to_le_bytes());
        buffer.extend_from_slice(header.as_bytes());
        buffer.extend_from_slice(&data);
        buffer
    }

    pub fn write(&self, path: &Path) -> PathBuf {
        fs::write(path, self.to_bytes()).unwrap();
        path.to_path_buf()
    }
}

pub const FALCON_HIDDEN: usize = 64;
pub const FALCON_VOCAB: usize = 16;

/// One-layer Falcon RW 1B style checkpoint with the real tensor names.
///
/// The hidden size is shrunk to 64 (32 heads of dimension 2).
pub fn falcon_rw_1b(layers: usize) -> CheckpointBuilder {
    let h = FALCON_HIDDEN;
    let mut b =
        CheckpointBuilder::new().arange("transformer.word_embeddings.weight", &[FALCON_VOCAB, h], 0.0);
    for i in 0..layers {
        let p = format!("transformer.h.{i}");
        b = b
            .arange(&format!("{p}.input_layernorm.weight"), &[h], 1.0)
            .arange(&format!("{p}.input_layernorm.bias"), &[h], 0.0)
            .arange(&format!("{p}.self_attention.query_key_value.weight"), &[3 * h, h], 0.0)
            .arange(&format!("{p}.self_attention.query_key_value.bias"), &[3 * h], 0.0)
            .arange(&format!("{p}.self_attention.dense.weight"), &[h, h], 0.0)
            .arange(&format!("{p}.self_attention.dense.bias"), &[h], 0.0)
            .arange(&format!("{p}.post_attention_layernorm.weight"), &[h], 1.0)
            .arange(&format!("{p}.post_attention_layernorm.bias"), &[h], 0.0)
            .arange(&format!("{p}.mlp.dense_h_to_4h.weight"), &[4 * h, h], -100.0)
            .arange(&format!("{p}.mlp.dense_h_to_4h.bias"), &[4 * h], 0.0)
            .arange(&format!("{p}.mlp.dense_4h_to_h.weight"), &[h, 4 * h], -100.0)
            .arange(&format!("{p}.mlp.dense_4h_to_h.bias"), &[h], 0.0);
    }
    b.arange("transformer.ln_f.weight", &[h], 1.0)
        .arange("transformer.ln_f.bias", &[h], 0.0)
        .arange("lm_head.weight", &[FALCON_VOCAB, h], 0.0)
}

/// One-layer GPT-2 style checkpoint (Conv1D weights are `[in, out]`).
pub fn gpt2() -> CheckpointBuilder {
    let h = 8;
    CheckpointBuilder::new()
        .arange("wte.weight", &[10, h], 0.0)
        .arange("wpe.weight", &[4, h], 0.0)
        .arange("h.0.ln_1.weight", &[h], 1.0)
        .arange("h.0.ln_1.bias", &[h], 0.0)
        .arange("h.0.attn.c_attn.weight", &[h, 3 * h], 0.0)
        .arange("h.0.attn.c_attn.bias", &[3 * h], 0.0)
        .arange("h.0.attn.c_proj.weight", &[h, h], 0.0)
        .arange("h.0.attn.c_proj.bias", &[h], 0.0)
        .arange("h.0.ln_2.weight", &[h], 1.0)
        .arange("h.0.ln_2.bias", &[h], 0.0)
        .arange("h.0.mlp.c_fc.weight", &[h, 4 * h], 0.0)
        .arange("h.0.mlp.c_fc.bias", &[4 * h], 0.0)
        .arange("h.0.mlp.c_proj.weight", &[4 * h, h], 0.0)
        .arange("h.0.mlp.c_proj.bias", &[h], 0.0)
        .arange("ln_f.weight", &[h], 1.0)
        .arange("ln_f.bias", &[h], 0.0)
}
