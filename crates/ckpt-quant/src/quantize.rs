//! Reference per-channel quantizer for [`QuantizationAction`]s.
//!
//! Symmetric: `scale = max|x| / qmax`, zero point 0.
//! Asymmetric: `scale = (max - min) / (qmax - qmin)` over a range that always
//! contains 0, `zero_point = qmin - round(min / scale)`.
//!
//! Int8 values are stored one per byte; int4 values are packed two per byte,
//! low nibble first, row by row along the pack dimension. Each row starts on a
//! byte boundary, so an odd row length leaves the final high nibble zero.

use crate::action::QuantizationAction;
use crate::error::{LoaderError, Result};
use crate::policy::QuantBits;
use crate::tensor::TensorData;

/// Quantized form of one action's tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub target_name: String,
    pub shape: Vec<usize>,
    pub bits: QuantBits,
    pub axis: usize,
    /// Rows of `shape[pack_dim..]` elements are packed independently (int4 only).
    pub pack_dim: Option<usize>,
    /// One scale per channel along `axis`.
    pub scales: Vec<f32>,
    /// One zero point per channel; `None` for symmetric quantization.
    pub zero_points: Option<Vec<i32>>,
    pub data: Vec<u8>,
}

impl QuantizedTensor {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size ratio against an f32 tensor of the same shape.
    pub fn compression_ratio(&self) -> f32 {
        let original_bytes = self.numel() * 4;
        let zp_bytes = self.zero_points.as_ref().map(|z| z.len() * 4).unwrap_or(0);
        let compressed_bytes = self.data.len() + self.scales.len() * 4 + zp_bytes;
        original_bytes as f32 / compressed_bytes.max(1) as f32
    }

    /// Integer values in row-major order.
    pub fn values(&self) -> Vec<i8> {
        match self.bits {
            QuantBits::Int8 => bytemuck::cast_slice::<u8, i8>(&self.data).to_vec(),
            QuantBits::Int4 => {
                let row = packed_row_len(&self.shape, self.pack_dim);
                unpack_int4_rows(&self.data, row, self.numel())
            }
        }
    }

    pub fn dequantize(&self) -> TensorData {
        let (channels, inner) = split_dims(&self.shape, self.axis);
        let values = self
            .values()
            .iter()
            .enumerate()
            .map(|(i, &q)| {
                let c = (i / inner) % channels;
                let zp = self.zero_points.as_ref().map(|z| z[c]).unwrap_or(0);
                (q as i32 - zp) as f32 * self.scales[c]
            })
            .collect();
        TensorData::new(self.shape.clone(), values)
    }

    /// Largest absolute reconstruction error against `original`.
    ///
    /// NaN if any reconstructed value is NaN.
    pub fn max_abs_error(&self, original: &TensorData) -> f32 {
        let mut worst = 0.0f32;
        for (a, b) in self.dequantize().values.iter().zip(original.values.iter()) {
            let diff = (a - b).abs();
            if diff.is_nan() {
                return f32::NAN;
            }
            worst = worst.max(diff);
        }
        worst
    }
}

/// Quantize an action's tensor; `Ok(None)` for pass-through actions.
pub fn quantize_action(action: &QuantizationAction) -> Result<Option<QuantizedTensor>> {
    let Some(bits) = action.quantize_bits else {
        return Ok(None);
    };
    let tensor = &action.tensor_value;
    let axis = match action.quantize_axis {
        Some(axis) if axis < tensor.ndim() => axis,
        other => {
            return Err(LoaderError::Quantization {
                name: action.target_name.clone(),
                reason: format!("invalid channel axis {other:?} for shape {:?}", tensor.shape),
            });
        }
    };
    if let Some(bad) = tensor.values.iter().find(|v| !v.is_finite()) {
        return Err(LoaderError::Quantization {
            name: action.target_name.clone(),
            reason: format!("non-finite value {bad}"),
        });
    }

    let (channels, inner) = split_dims(&tensor.shape, axis);
    let mut mins = vec![0.0f32; channels];
    let mut maxs = vec![0.0f32; channels];
    for (i, &v) in tensor.values.iter().enumerate() {
        let c = (i / inner) % channels;
        mins[c] = mins[c].min(v);
        maxs[c] = maxs[c].max(v);
    }

    let pack_dim = match bits {
        QuantBits::Int4 => action.pack_dim.or(tensor.ndim().checked_sub(1)),
        QuantBits::Int8 => None,
    };
    if let Some(dim) = pack_dim {
        if dim >= tensor.ndim() {
            return Err(LoaderError::Quantization {
                name: action.target_name.clone(),
                reason: format!("pack dimension {dim} out of range for shape {:?}", tensor.shape),
            });
        }
    }

    let (qmin, qmax) = bits.qrange(action.is_symmetric);
    let mut scales = Vec::with_capacity(channels);
    let mut zero_points = Vec::with_capacity(channels);
    for c in 0..channels {
        if action.is_symmetric {
            let max_abs = mins[c].abs().max(maxs[c].abs());
            scales.push(nonzero(max_abs / qmax as f32));
            zero_points.push(0);
        } else {
            // f64 keeps the range finite for inputs near f32::MAX.
            let range = maxs[c] as f64 - mins[c] as f64;
            let scale = nonzero((range / (qmax - qmin) as f64) as f32);
            let zp = (qmin - (mins[c] / scale).round() as i32).clamp(qmin, qmax);
            scales.push(scale);
            zero_points.push(zp);
        }
    }

    if let Some(bad) = scales.iter().find(|s| !s.is_finite()) {
        return Err(LoaderError::Quantization {
            name: action.target_name.clone(),
            reason: format!("non-finite scale {bad}"),
        });
    }

    let q: Vec<i8> = tensor
        .values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let c = (i / inner) % channels;
            let q = (v / scales[c]).round() as i32 + zero_points[c];
            q.clamp(qmin, qmax) as i8
        })
        .collect();

    let data = match bits {
        QuantBits::Int8 => bytemuck::cast_slice::<i8, u8>(&q).to_vec(),
        QuantBits::Int4 => pack_int4_rows(&q, packed_row_len(&tensor.shape, pack_dim)),
    };

    tracing::trace!("quantized {} to {} ({} channels)", action.target_name, bits, channels);
    Ok(Some(QuantizedTensor {
        target_name: action.target_name.clone(),
        shape: tensor.shape.clone(),
        bits,
        axis,
        pack_dim,
        scales,
        zero_points: if action.is_symmetric { None } else { Some(zero_points) },
        data,
    }))
}

/// Channel count along `axis` and the element stride of one channel step.
fn split_dims(shape: &[usize], axis: usize) -> (usize, usize) {
    let inner = shape[axis + 1..].iter().product();
    (shape[axis].max(1), inner)
}

/// Elements per packed row; the whole tensor when there is no pack dimension.
fn packed_row_len(shape: &[usize], pack_dim: Option<usize>) -> usize {
    match pack_dim {
        Some(dim) => shape[dim..].iter().product(),
        None => shape.iter().product(),
    }
}

fn nonzero(scale: f32) -> f32 {
    if scale > 0.0 { scale } else { 1.0 }
}

/// Pack signed 4-bit values two per byte, low nibble first.
pub fn pack_int4(values: &[i8]) -> Vec<u8> {
    values
        .chunks(2)
        .map(|pair| {
            let lo = (pair[0] as u8) & 0x0F;
            let hi = pair.get(1).map(|&v| (v as u8) & 0x0F).unwrap_or(0);
            lo | (hi << 4)
        })
        .collect()
}

/// Pack each `row_len`-element row separately with [`pack_int4`].
pub fn pack_int4_rows(values: &[i8], row_len: usize) -> Vec<u8> {
    if row_len == 0 {
        return Vec::new();
    }
    values.chunks(row_len).flat_map(pack_int4).collect()
}

/// Inverse of [`pack_int4_rows`].
pub fn unpack_int4_rows(packed: &[u8], row_len: usize, len: usize) -> Vec<i8> {
    if row_len == 0 {
        return Vec::new();
    }
    packed
        .chunks(row_len.div_ceil(2))
        .flat_map(|row| unpack_int4(row, row_len))
        .take(len)
        .collect()
}

/// Inverse of [`pack_int4`], sign-extending each nibble.
pub fn unpack_int4(packed: &[u8], len: usize) -> Vec<i8> {
    packed
        .iter()
        .flat_map(|&b| [((b << 4) as i8) >> 4, (b as i8) >> 4])
        .take(len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::TensorRole;

    fn action(
        shape: &[usize],
        values: Vec<f32>,
        bits: Option<QuantBits>,
        symmetric: bool,
    ) -> QuantizationAction {
        QuantizationAction {
            tensor_name: "w".into(),
            target_name: "params.w".into(),
            role: TensorRole::FeedforwardWeight,
            layer: Some(0),
            tensor_value: TensorData::new(shape.to_vec(), values),
            quantize_axis: bits.map(|_| 0),
            quantize_bits: bits,
            pack_dim: None,
            is_symmetric: symmetric,
        }
    }

    #[test]
    fn test_pass_through_is_not_quantized() {
        let a = action(&[2], vec![1.0, 2.0], None, true);
        assert!(quantize_action(&a).unwrap().is_none());
    }

    #[test]
    fn test_symmetric_int8_per_channel() {
        let a = action(&[2, 3], vec![1.0, -0.5, 0.25, 10.0, 5.0, -2.5], Some(QuantBits::Int8), true);
        let q = quantize_action(&a).unwrap().unwrap();
        assert_eq!(q.scales.len(), 2);
        assert!((q.scales[0] - 1.0 / 127.0).abs() < 1e-7);
        assert!((q.scales[1] - 10.0 / 127.0).abs() < 1e-6);
        assert!(q.zero_points.is_none());
        assert_eq!(q.values()[0], 127);
        assert_eq!(q.values()[3], 127);
        assert!(q.max_abs_error(&a.tensor_value) <= q.scales[1] / 2.0 + 1e-6);
    }

    #[test]
    fn test_asymmetric_int8_keeps_zero_exact() {
        let a = action(&[1, 4], vec![0.0, 1.0, 2.0, 3.0], Some(QuantBits::Int8), false);
        let q = quantize_action(&a).unwrap().unwrap();
        let zp = q.zero_points.as_ref().unwrap()[0];
        assert_eq!(zp, -128);
        let deq = q.dequantize();
        assert_eq!(deq.values[0], 0.0);
        assert!(q.max_abs_error(&a.tensor_value) <= q.scales[0] / 2.0 + 1e-6);
    }

    #[test]
    fn test_int4_packs_two_per_byte() {
        let a = action(&[1, 5], vec![-7.0, -1.0, 0.0, 3.0, 7.0], Some(QuantBits::Int4), true);
        let q = quantize_action(&a).unwrap().unwrap();
        assert_eq!(q.data.len(), 3);
        assert_eq!(q.values(), vec![-7, -1, 0, 3, 7]);
        assert!(q.compression_ratio() > 1.0);
    }

    #[test]
    fn test_int4_rows_start_on_byte_boundary() {
        let mut a = action(
            &[2, 3],
            vec![1.0, -1.0, 2.0, -3.0, 3.0, 0.0],
            Some(QuantBits::Int4),
            true,
        );
        a.pack_dim = Some(1);
        let q = quantize_action(&a).unwrap().unwrap();
        assert_eq!(q.pack_dim, Some(1));
        // Two bytes per row of three nibbles.
        assert_eq!(q.data.len(), 4);
        assert_eq!(q.data[1] >> 4, 0);
        assert_eq!(q.data[3] >> 4, 0);
        assert_eq!(q.values().len(), 6);
        assert!(q.max_abs_error(&a.tensor_value) <= q.scales[1] / 2.0 + 1e-6);
    }

    #[test]
    fn test_asymmetric_extreme_range_stays_finite() {
        let a = action(&[1, 2], vec![-3e38, 3e38], Some(QuantBits::Int8), false);
        let q = quantize_action(&a).unwrap().unwrap();
        assert!(q.scales[0].is_finite());
        let deq = q.dequantize();
        assert!(deq.values.iter().all(|v| v.is_finite()));
        let err = q.max_abs_error(&a.tensor_value);
        assert!(err.is_finite());
        assert!(err <= q.scales[0]);
    }

    #[test]
    fn test_max_abs_error_reports_nan() {
        let q = QuantizedTensor {
            target_name: "params.w".into(),
            shape: vec![2],
            bits: QuantBits::Int8,
            axis: 0,
            pack_dim: None,
            scales: vec![f32::NAN, 1.0],
            zero_points: None,
            data: vec![1, 1],
        };
        let original = TensorData::new(vec![2], vec![1.0, 1.0]);
        assert!(q.max_abs_error(&original).is_nan());
    }

    #[test]
    fn test_all_zero_channel() {
        let a = action(&[2, 2], vec![0.0, 0.0, 1.0, -1.0], Some(QuantBits::Int8), true);
        let q = quantize_action(&a).unwrap().unwrap();
        assert_eq!(q.scales[0], 1.0);
        assert_eq!(q.dequantize().values[..2], [0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_is_rejected() {
        let a = action(&[2], vec![f32::NAN, 1.0], Some(QuantBits::Int8), true);
        assert!(matches!(
            quantize_action(&a).unwrap_err(),
            LoaderError::Quantization { .. }
        ));
    }

    #[test]
    fn test_unpack_int4_round_trip() {
        let vals: Vec<i8> = (-8..8).collect();
        assert_eq!(unpack_int4(&pack_int4(&vals), vals.len()), vals);

        let odd: Vec<i8> = vec![-8, 7, 1, -1, 0, 3];
        assert_eq!(unpack_int4_rows(&pack_int4_rows(&odd, 3), 3, odd.len()), odd);
    }
}
