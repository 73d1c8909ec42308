//! Dense row-major f32 tensors and the slicing used to split fused tensors.

use std::ops::Range;

use half::{bf16, f16};
use safetensors::Dtype;
use safetensors::tensor::TensorView;

use crate::error::{LoaderError, Result};

/// Row-major tensor values decoded to f32.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self { shape, values }
    }

    pub fn numel(&self) -> usize {
        self.values.len()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Decode a SafeTensors view.
    ///
    /// Reads little-endian elements chunk by chunk; the view's data is not
    /// guaranteed to be aligned for its element type.
    pub fn from_view(name: &str, view: &TensorView<'_>) -> Result<Self> {
        let data = view.data();
        let values: Vec<f32> = match view.dtype() {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Dtype::F64 => data
                .chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                })
                .collect(),
            Dtype::I8 => data.iter().map(|&b| b as i8 as f32).collect(),
            Dtype::U8 => data.iter().map(|&b| b as f32).collect(),
            Dtype::I16 => data
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32)
                .collect(),
            Dtype::I32 => data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            other => {
                return Err(LoaderError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: format!("{other:?}"),
                });
            }
        };

        let shape = view.shape().to_vec();
        ensure_numel(name, &shape, values.len())?;
        Ok(Self { shape, values })
    }

    /// Concatenate the given index ranges of `axis` into a new tensor.
    ///
    /// Ranges are taken in the order given and elements keep their relative
    /// order inside each range.
    pub fn gather_axis(&self, axis: usize, ranges: &[Range<usize>]) -> TensorData {
        let dim = self.shape[axis];
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let taken: usize = ranges.iter().map(|r| r.len()).sum();

        let mut values = Vec::with_capacity(outer * taken * inner);
        for o in 0..outer {
            let base = o * dim;
            for r in ranges {
                let start = (base + r.start) * inner;
                let end = (base + r.end) * inner;
                values.extend_from_slice(&self.values[start..end]);
            }
        }

        let mut shape = self.shape.clone();
        shape[axis] = taken;
        TensorData { shape, values }
    }
}

/// The decoded element count must match the declared shape.
fn ensure_numel(name: &str, shape: &[usize], decoded: usize) -> Result<()> {
    let expected: usize = shape.iter().product();
    if decoded != expected {
        return Err(LoaderError::MalformedTensor {
            name: name.to_string(),
            detail: format!("decoded {decoded} elements, shape {shape:?} expects {expected}"),
        });
    }
    Ok(())
}
