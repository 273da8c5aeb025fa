//! Base model loading: `config.json`, safetensors weights, the decoder
//! forward pass and LoRA adapters.

pub mod config;
pub mod decoder;
pub mod lora;
pub mod weights;

pub use config::{Architecture, ModelConfig};
pub use decoder::{CausalLm, ParameterSummary, causal_lm_loss};
pub use lora::{AdaptedLinear, LoraAdapter};
pub use weights::{WeightIndex, WeightStore};
