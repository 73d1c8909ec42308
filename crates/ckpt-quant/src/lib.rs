//! Quantization planning for transformer checkpoints
//!
//! This crate reads a SafeTensors checkpoint and derives an ordered list of
//! quantization actions, one per (possibly split) tensor:
//! - tensors are classified by naming rules for the selected model family
//! - attention, feedforward and embedding weights get their own bit width
//! - fused query/key/value tensors are split into separate q, k, v actions
//! - biases and layer-norm parameters pass through unquantized
//!
//! ```no_run
//! use ckpt_quant::{CkptLoader, QuantPolicy, SpecialModel};
//!
//! let policy = QuantPolicy::new(true, 8, 4, 8, Some(SpecialModel::FalconRw1b));
//! let loader = CkptLoader::new("falcon_rw_1b.safetensors", policy)?;
//! for action in loader.load_to_actions()? {
//!     println!("{} -> {:?}", action.target_name, action.quantize_bits);
//! }
//! # Ok::<(), ckpt_quant::LoaderError>(())
//! ```

pub mod action;
pub mod error;
pub mod loader;
pub mod names;
pub mod policy;
pub mod quantize;
pub mod reader;
pub mod tensor;

pub use action::{ActionSummary, QuantizationAction};
pub use error::{LoaderError, Result};
pub use loader::CkptLoader;
pub use names::{NamingRules, TensorRole, rules_for};
pub use policy::{PolicyError, QuantBits, QuantCategory, QuantPolicy, SpecialModel};
pub use quantize::{QuantizedTensor, quantize_action};
pub use reader::{NamedTensor, SafeTensorsReader, TensorSource};
pub use tensor::TensorData;
