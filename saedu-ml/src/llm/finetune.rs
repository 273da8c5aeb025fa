//! The fine-tuning pipeline: base model and dataset in, LoRA adapter out.

use crate::data::{RecordPolicy, TokenizerBundle, load_jsonl, prepare_dataset};
use crate::error::MlError;
use crate::llm::adapter::{PeftAdapterConfig, save_adapter, write_merged_model};
use crate::model::{CausalLm, ModelConfig, ParameterSummary, WeightStore};
use crate::runtime::{describe, dtype_for, select_device};
use crate::training::{
    ConsoleProgress, NonFiniteLossGuard, TRAINING_ARGS_FILE, Trainer, TrainerState,
    TrainingArguments,
};
use crate::zoo::{HubClient, ModelSource};
use candle_nn::VarMap;
use saedu_core::persistence::atomic_write_json;
use saedu_core::{DevicePreference, FineTuneSettings, LoraSettings, TrainerSettings};
use std::path::{Path, PathBuf};
use tracing::info;

/// Directory under a merged export holding the full model.
pub const MERGED_DIR: &str = "merged";

/// Everything a fine-tuning run needs besides the base model files.
#[derive(Debug, Clone)]
pub struct FineTuneJob {
    pub settings: FineTuneSettings,
    pub lora: LoraSettings,
    pub trainer: TrainerSettings,
    pub device: DevicePreference,
}

impl FineTuneJob {
    pub fn validate(&self) -> Result<(), MlError> {
        self.settings.validate()?;
        self.lora.validate()?;
        self.trainer.validate()?;
        Ok(())
    }

    fn dataset_path(&self) -> Result<&Path, MlError> {
        self.settings
            .dataset_path
            .as_deref()
            .ok_or_else(|| MlError::invalid_input("a dataset path is required"))
    }

    fn record_policy(&self) -> RecordPolicy {
        if self.settings.strict_records {
            RecordPolicy::Strict
        } else {
            RecordPolicy::Lenient
        }
    }
}

/// `<output_dir>/<base>-sa-edu-<language>`.
pub fn artifact_dir(output_dir: &Path, base_name: &str, language: &str) -> PathBuf {
    output_dir.join(format!("{base_name}-sa-edu-{language}"))
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct FineTuneOutcome {
    pub artifact_dir: PathBuf,
    pub adapter_weights: PathBuf,
    pub merged_dir: Option<PathBuf>,
    pub parameters: ParameterSummary,
    pub train_examples: usize,
    pub validation_examples: usize,
    pub state: TrainerState,
}

/// Resolve the base model, then train on a blocking worker.
pub async fn run(client: &HubClient, job: FineTuneJob) -> Result<FineTuneOutcome, MlError> {
    job.validate()?;
    let dataset = job.dataset_path()?;
    if !dataset.is_file() {
        return Err(MlError::not_found(format!("dataset {}", dataset.display())));
    }

    let source = ModelSource::parse(&job.settings.model_name, client.revision())?;
    let base_name = source.basename();
    let snapshot = client.resolve(&source).await?;
    let model_dir = snapshot.root()?.to_path_buf();
    info!(model = %snapshot.model_id, dir = %model_dir.display(), "base model resolved");

    tokio::task::spawn_blocking(move || finetune(&model_dir, &base_name, &job)).await?
}

/// Fine-tune the model in `model_dir` and write the adapter artifact.
pub fn finetune(model_dir: &Path, base_name: &str, job: &FineTuneJob) -> Result<FineTuneOutcome, MlError> {
    job.validate()?;
    let settings = &job.settings;

    let mut tokenizer = TokenizerBundle::load(model_dir)?;
    tokenizer.configure_fixed_length(settings.max_length)?;
    println!(
        "Tokenizer loaded (vocab {}, pad token {})",
        tokenizer.vocab_size(),
        tokenizer.eos_token()
    );

    let records = load_jsonl(job.dataset_path()?, job.record_policy())?;
    if records.is_empty() {
        return Err(MlError::dataset("dataset contains no records"));
    }
    let split = prepare_dataset(
        &records,
        &tokenizer,
        settings.validation_fraction,
        settings.seed,
    )?;
    println!(
        "Dataset: {} train / {} validation examples",
        split.train.len(),
        split.validation.len()
    );

    let device = select_device(job.device)?;
    let store = WeightStore::open(model_dir, dtype_for(settings.precision), &device)?;
    let config = ModelConfig::load(model_dir)?;
    let mut model = CausalLm::load(&store, &config, settings.max_length)?;
    drop(store);
    println!(
        "Loaded {} ({}) in {} on {}",
        base_name,
        config.model_type,
        settings.precision,
        describe(&device)
    );

    let varmap = VarMap::new();
    let parameters = model.attach_lora(&job.lora, &varmap, settings.seed)?;
    println!("{parameters}");

    let artifact = artifact_dir(&settings.output_dir, base_name, &settings.language);
    std::fs::create_dir_all(&artifact)?;
    let args = TrainingArguments::new(artifact.clone(), settings, &job.trainer);
    atomic_write_json(&artifact.join(TRAINING_ARGS_FILE), &args)?;

    let adapter_config = PeftAdapterConfig::from_settings(&job.lora, &settings.model_name);
    let state = Trainer::new(
        &model,
        &varmap,
        args,
        adapter_config.clone(),
        tokenizer.pad_token_id(),
    )
    .with_callback(Box::new(ConsoleProgress))
    .with_callback(Box::new(NonFiniteLossGuard))
    .train(&split.train, &split.validation)?;

    let adapter_weights = save_adapter(&artifact, &varmap, &adapter_config)?;
    tokenizer.save(&artifact)?;

    let merged_dir = if settings.merge_weights {
        let merged = artifact.join(MERGED_DIR);
        write_merged_model(&model, model_dir, &merged)?;
        tokenizer.save(&merged)?;
        Some(merged)
    } else {
        None
    };

    info!(
        artifact = %artifact.display(),
        steps = state.global_step,
        best = ?state.best_model_checkpoint,
        "fine-tuning complete"
    );
    Ok(FineTuneOutcome {
        artifact_dir: artifact,
        adapter_weights,
        merged_dir,
        parameters,
        train_examples: split.train.len(),
        validation_examples: split.validation.len(),
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_dir_naming() {
        assert_eq!(
            artifact_dir(Path::new("./models/fine-tuned"), "aya-23-8B", "zu"),
            PathBuf::from("./models/fine-tuned/aya-23-8B-sa-edu-zu")
        );
    }

    #[test]
    fn test_dataset_path_required() {
        let job = FineTuneJob {
            settings: FineTuneSettings::default(),
            lora: LoraSettings::default(),
            trainer: TrainerSettings::default(),
            device: DevicePreference::Cpu,
        };
        assert!(matches!(job.dataset_path(), Err(MlError::InvalidInput(_))));
    }
}
