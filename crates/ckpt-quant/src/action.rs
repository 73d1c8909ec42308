//! Quantization actions: the per-tensor directives produced by the loader.

use serde::Serialize;

use crate::names::TensorRole;
use crate::policy::QuantBits;
use crate::tensor::TensorData;

/// One directive for the quantizer / writer.
///
/// Pass-through actions (`quantize_bits == None`) carry tensors that stay in
/// float, such as biases and layer-norm parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationAction {
    /// Name of the checkpoint tensor the data was taken from.
    pub tensor_name: String,
    /// Name the data is written under; differs per q/k/v slice of a fused tensor.
    pub target_name: String,
    pub role: TensorRole,
    pub layer: Option<usize>,
    pub tensor_value: TensorData,
    /// Channel axis for per-channel scales.
    pub quantize_axis: Option<usize>,
    pub quantize_bits: Option<QuantBits>,
    /// Axis along which 4-bit values are packed two per byte. Rows of
    /// `shape[pack_dim..]` elements are packed independently, each starting
    /// on a byte boundary.
    pub pack_dim: Option<usize>,
    pub is_symmetric: bool,
}

impl QuantizationAction {
    pub fn is_quantized(&self) -> bool {
        self.quantize_bits.is_some()
    }

    pub fn summary(&self) -> ActionSummary {
        ActionSummary {
            tensor_name: self.tensor_name.clone(),
            target_name: self.target_name.clone(),
            role: self.role,
            layer: self.layer,
            shape: self.tensor_value.shape.clone(),
            quantize_bits: self.quantize_bits.map(QuantBits::bits),
            quantize_axis: self.quantize_axis,
            pack_dim: self.pack_dim,
            is_symmetric: self.is_symmetric,
        }
    }
}

/// Data-free view of an action, suitable for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionSummary {
    pub tensor_name: String,
    pub target_name: String,
    pub role: TensorRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<usize>,
    pub shape: Vec<usize>,
    pub quantize_bits: Option<u8>,
    pub quantize_axis: Option<usize>,
    pub pack_dim: Option<usize>,
    pub is_symmetric: bool,
}
