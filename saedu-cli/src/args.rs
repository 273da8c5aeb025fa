//! Command-line arguments of both tools.
//!
//! Flags are optional so that values from config files and `SAEDU_*`
//! environment variables survive unless a flag is actually given. The
//! defaults shown in `--help` are the built-in configuration defaults.

use clap::{Args, Parser};
use saedu_core::{DevicePreference, Precision, Quantization, SaeduConfig};
use std::path::PathBuf;

/// Flags shared by both tools.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Extra TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Download a pretrained model and tokenizer, optionally quantized.
#[derive(Parser, Debug, Clone)]
#[command(name = "saedu-download", version, about, long_about = None)]
pub struct DownloadCli {
    /// Hub model identifier or local model directory [default: CohereForAI/aya-23-8B]
    #[arg(long)]
    pub model: Option<String>,

    /// Destination directory [default: ./models/base/aya-23-8b]
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Weight precision: none, int8 or int4 [default: none]
    #[arg(long)]
    pub quantization: Option<Quantization>,

    /// Hub revision (branch, tag or commit) [default: main]
    #[arg(long)]
    pub revision: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl DownloadCli {
    pub fn apply(&self, config: &mut SaeduConfig) {
        let download = &mut config.download;
        if let Some(model) = &self.model {
            download.model = model.clone();
        }
        if let Some(output) = &self.output {
            download.output = output.clone();
        }
        if let Some(quantization) = self.quantization {
            download.quantization = quantization;
        }
        if let Some(revision) = &self.revision {
            config.hub.revision = revision.clone();
        }
    }
}

/// Fine-tune a base model with LoRA on a JSON-lines instruction dataset.
#[derive(Parser, Debug, Clone)]
#[command(name = "saedu-finetune", version, about, long_about = None)]
pub struct FinetuneCli {
    /// Base model: hub identifier or local directory [default: CohereForAI/aya-23-8B]
    #[arg(long = "model_name", alias = "model-name")]
    pub model_name: Option<String>,

    /// JSON-lines file with instruction/response records
    #[arg(long = "dataset_path", alias = "dataset-path")]
    pub dataset_path: PathBuf,

    /// Root directory for the fine-tuned artifact [default: ./models/fine-tuned]
    #[arg(long = "output_dir", alias = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Language tag used in the artifact name [default: en]
    #[arg(long)]
    pub language: Option<String>,

    /// Training epochs [default: 3]
    #[arg(long = "num_epochs", alias = "num-epochs")]
    pub num_epochs: Option<usize>,

    /// Per-device batch size [default: 4]
    #[arg(long = "batch_size", alias = "batch-size")]
    pub batch_size: Option<usize>,

    /// Optimizer learning rate [default: 2e-4]
    #[arg(long = "learning_rate", alias = "learning-rate")]
    pub learning_rate: Option<f64>,

    /// Token sequence length cap [default: 2048]
    #[arg(long = "max_length", alias = "max-length")]
    pub max_length: Option<usize>,

    /// Base weight dtype: f16, bf16 or f32 [default: f16]
    #[arg(long)]
    pub precision: Option<Precision>,

    /// Compute device: auto, cpu, cuda or metal [default: auto]
    #[arg(long)]
    pub device: Option<DevicePreference>,

    /// Seed for shuffling, splitting, adapter init and dropout [default: 42]
    #[arg(long)]
    pub seed: Option<u64>,

    /// Reject records missing `instruction` or `response`
    #[arg(long = "strict_records", alias = "strict-records")]
    pub strict_records: bool,

    /// Also write the base model with the adapter merged in
    #[arg(long = "merge_weights", alias = "merge-weights")]
    pub merge_weights: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl FinetuneCli {
    pub fn apply(&self, config: &mut SaeduConfig) {
        let run = &mut config.finetune;
        run.dataset_path = Some(self.dataset_path.clone());
        if let Some(model_name) = &self.model_name {
            run.model_name = model_name.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            run.output_dir = output_dir.clone();
        }
        if let Some(language) = &self.language {
            run.language = language.clone();
        }
        if let Some(v) = self.num_epochs {
            run.num_epochs = v;
        }
        if let Some(v) = self.batch_size {
            run.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            run.learning_rate = v;
        }
        if let Some(v) = self.max_length {
            run.max_length = v;
        }
        if let Some(v) = self.precision {
            run.precision = v;
        }
        if let Some(v) = self.seed {
            run.seed = v;
        }
        run.strict_records |= self.strict_records;
        run.merge_weights |= self.merge_weights;
        if let Some(device) = self.device {
            config.runtime.device = device;
        }
    }
}
