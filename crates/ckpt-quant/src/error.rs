//! Error types for checkpoint loading and action derivation.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Errors raised while turning a checkpoint into quantization actions.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The checkpoint path does not point at an existing file.
    #[error("checkpoint not found: {}", path.display())]
    CheckpointNotFound { path: PathBuf },

    /// The checkpoint exists but could not be read.
    #[error("failed to read checkpoint {}: {source}", path.display())]
    CheckpointUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint bytes are not a valid named-tensor archive.
    #[error("invalid checkpoint {}: {detail}", path.display())]
    InvalidCheckpoint { path: PathBuf, detail: String },

    /// A tensor name is not covered by the naming rules of the selected model.
    #[error("tensor `{name}` does not match any known role for model {model}")]
    UnrecognizedTensor { name: String, model: String },

    /// Two checkpoint tensors map to the same target name.
    #[error("tensors `{first}` and `{second}` both map to target `{target}`")]
    DuplicateTarget {
        target: String,
        first: String,
        second: String,
    },

    /// A requested bit width is not supported.
    #[error("unsupported {category} bit width: {bits} (supported: 4, 8)")]
    UnsupportedBitWidth { category: &'static str, bits: u8 },

    /// The tensor element type cannot be decoded to f32.
    #[error("tensor `{name}` has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    /// Decoded tensor data does not match the shape declared in the header.
    #[error("tensor `{name}` is malformed: {detail}")]
    MalformedTensor { name: String, detail: String },

    /// A fused tensor cannot be split with the configured layout.
    #[error("cannot split fused tensor `{name}` with shape {shape:?}: {reason}")]
    InvalidSplit {
        name: String,
        shape: Vec<usize>,
        reason: String,
    },

    /// A quantization parameter is inconsistent with the tensor it targets.
    #[error("cannot quantize `{name}`: {reason}")]
    Quantization { name: String, reason: String },
}
