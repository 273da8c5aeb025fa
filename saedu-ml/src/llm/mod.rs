//! LLM tooling: weight quantization, LoRA adapter persistence and the
//! fine-tuning pipeline.

pub mod adapter;
pub mod finetune;
pub mod quantize;

pub use adapter::{PeftAdapterConfig, restore_adapter, save_adapter, write_merged_model};
pub use finetune::{FineTuneJob, FineTuneOutcome, artifact_dir, finetune, run};
pub use quantize::{FileReport, QuantizationConfig, convert_file};
