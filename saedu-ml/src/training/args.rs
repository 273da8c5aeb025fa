//! Resolved training arguments, persisted as `training_args.json`.

use saedu_core::{FineTuneSettings, Precision, TrainerSettings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const TRAINING_ARGS_FILE: &str = "training_args.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub lr_scheduler_type: String,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: usize,
    pub load_best_model_at_end: bool,
    pub metric_for_best_model: String,
    pub greater_is_better: bool,
    pub fp16: bool,
    pub bf16: bool,
    pub max_length: usize,
    pub seed: u64,
}

impl TrainingArguments {
    pub fn new(output_dir: PathBuf, run: &FineTuneSettings, trainer: &TrainerSettings) -> Self {
        Self {
            output_dir,
            num_train_epochs: run.num_epochs,
            per_device_train_batch_size: run.batch_size,
            per_device_eval_batch_size: run.batch_size,
            gradient_accumulation_steps: trainer.gradient_accumulation_steps,
            learning_rate: run.learning_rate,
            lr_scheduler_type: "linear".to_string(),
            warmup_steps: trainer.warmup_steps,
            weight_decay: trainer.weight_decay,
            adam_beta1: trainer.adam_beta1,
            adam_beta2: trainer.adam_beta2,
            adam_epsilon: trainer.adam_epsilon,
            max_grad_norm: trainer.max_grad_norm,
            logging_steps: trainer.logging_steps,
            eval_steps: trainer.eval_steps,
            save_steps: trainer.save_steps,
            save_total_limit: trainer.save_total_limit,
            load_best_model_at_end: trainer.load_best_model_at_end,
            metric_for_best_model: "eval_loss".to_string(),
            greater_is_better: false,
            fp16: run.precision == Precision::F16,
            bf16: run.precision == Precision::Bf16,
            max_length: run.max_length,
            seed: run.seed,
        }
    }

    /// Optimizer steps per epoch; a trailing partial accumulation window
    /// still triggers a step.
    pub fn steps_per_epoch(&self, num_examples: usize) -> usize {
        let batches = num_examples.div_ceil(self.per_device_train_batch_size.max(1));
        batches.div_ceil(self.gradient_accumulation_steps.max(1))
    }

    pub fn max_steps(&self, num_examples: usize) -> usize {
        self.steps_per_epoch(num_examples) * self.num_train_epochs
    }
}
