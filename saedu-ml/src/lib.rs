//! # saedu-ml: model acquisition and LoRA fine-tuning
//!
//! Library behind the `saedu-download` and `saedu-finetune` tools.
//!
//! - [`zoo`]: hub access, repository file selection and persisting a model
//!   as a self-contained local artifact
//! - [`llm`]: int8/int4 weight quantization, PEFT adapter files and the
//!   fine-tuning pipeline
//! - [`data`]: JSON-lines instruction records, fixed-length tokenization,
//!   splitting and batching
//! - [`model`]: `config.json` parsing, memory-mapped weights, the decoder
//!   forward pass and LoRA layers
//! - [`training`]: the training loop with its schedule, metrics, callbacks
//!   and checkpoints

pub mod data;
pub mod error;
pub mod llm;
pub mod model;
pub mod runtime;
pub mod training;
pub mod zoo;

pub use error::MlError;
