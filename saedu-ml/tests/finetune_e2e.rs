//! End-to-end fine-tuning on the tiny offline model.

mod common;

use pretty_assertions::assert_eq;
use saedu_core::{
    DevicePreference, FineTuneSettings, HubConfig, LoraSettings, Precision, TrainerSettings,
};
use saedu_ml::MlError;
use saedu_ml::data::{RecordPolicy, TokenizerBundle, load_jsonl, prepare_dataset};
use saedu_ml::llm::{FineTuneJob, PeftAdapterConfig, artifact_dir, finetune, run};
use saedu_ml::model::{CausalLm, ModelConfig, WeightStore};
use saedu_ml::training::{
    CallbackAction, LogEntry, Trainer, TrainerState, TrainingArguments, TrainingCallback,
};
use saedu_ml::zoo::HubClient;
use serde_json::json;
use std::path::Path;

fn job(dataset: &Path, output: &Path) -> FineTuneJob {
    FineTuneJob {
        settings: FineTuneSettings {
            model_name: "tiny-llama".to_string(),
            dataset_path: Some(dataset.to_path_buf()),
            output_dir: output.to_path_buf(),
            num_epochs: 1,
            max_length: 16,
            precision: Precision::F32,
            ..FineTuneSettings::default()
        },
        lora: LoraSettings::default(),
        trainer: TrainerSettings::default(),
        device: DevicePreference::Cpu,
    }
}

fn offline_client() -> HubClient {
    HubClient::new(&HubConfig {
        progress: false,
        ..HubConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_single_record_produces_adapter_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let model_dir = tmp.path().join("tiny-llama");
    common::write_model(&model_dir);
    let dataset = tmp.path().join("train.jsonl");
    common::write_dataset(&dataset, &[json!({"instruction": "2+2?", "response": "4"})]);
    let output = tmp.path().join("fine-tuned");

    let mut job = job(&dataset, &output);
    job.settings.model_name = model_dir.display().to_string();
    let outcome = run(&offline_client(), job).await.unwrap();

    let artifact = output.join("tiny-llama-sa-edu-en");
    assert_eq!(outcome.artifact_dir, artifact);
    assert_eq!(outcome.train_examples, 1);
    assert_eq!(outcome.validation_examples, 0);
    assert_eq!(outcome.state.global_step, 1);
    assert!(outcome.state.eval_history().is_empty());
    assert!(outcome.merged_dir.is_none());

    for file in [
        "adapter_model.safetensors",
        "adapter_config.json",
        "tokenizer.json",
        "tokenizer_config.json",
        "special_tokens_map.json",
        "training_args.json",
        "trainer_state.json",
    ] {
        assert!(artifact.join(file).is_file(), "missing {file}");
    }

    let tokenizer_config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(artifact.join("tokenizer_config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(tokenizer_config["pad_token"], "</s>");

    // two layers, q_proj and v_proj, r = 16
    let (h, kv) = (common::HIDDEN as u64, common::KV_DIM as u64);
    let expected = 2 * (16 * h + 16 * h) + 2 * (16 * h + 16 * kv);
    assert_eq!(outcome.parameters.trainable, expected);
    assert_eq!(outcome.parameters.total, common::parameter_count() + expected);

    let adapters = candle_core::safetensors::load(
        artifact.join("adapter_model.safetensors"),
        &candle_core::Device::Cpu,
    )
    .unwrap();
    assert_eq!(adapters.len(), 8);
    assert!(adapters.contains_key("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"));
    assert!(adapters.contains_key("base_model.model.model.layers.1.self_attn.v_proj.lora_B.weight"));

    let state: TrainerState = serde_json::from_str(
        &std::fs::read_to_string(artifact.join("trainer_state.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(state.global_step, outcome.state.global_step);
    assert_eq!(state.log_history.len(), outcome.state.log_history.len());
}

#[test]
fn test_merged_export_is_a_loadable_model() {
    let tmp = tempfile::tempdir().unwrap();
    let model_dir = tmp.path().join("tiny-llama");
    common::write_model(&model_dir);
    let dataset = tmp.path().join("train.jsonl");
    let records: Vec<_> = (0..10)
        .map(|_| json!({"instruction": "2+2?", "response": "4"}))
        .collect();
    common::write_dataset(&dataset, &records);

    let mut job = job(&dataset, tmp.path());
    job.settings.merge_weights = true;
    job.settings.language = "zu".to_string();
    job.trainer.warmup_steps = 0;
    job.trainer.eval_steps = 1;
    job.trainer.save_steps = 1;
    job.trainer.gradient_accumulation_steps = 1;
    let outcome = finetune(&model_dir, "tiny-llama", &job).unwrap();

    assert_eq!(outcome.artifact_dir, artifact_dir(tmp.path(), "tiny-llama", "zu"));
    assert_eq!(outcome.train_examples, 9);
    assert_eq!(outcome.validation_examples, 1);
    // 9 examples in batches of 4, one optimizer step per batch
    assert_eq!(outcome.state.global_step, 3);
    assert_eq!(outcome.state.eval_history().len(), 3);
    let best = outcome.state.best_model_checkpoint.clone().unwrap();
    assert!(best.join("adapter_model.safetensors").is_file());

    let merged = outcome.merged_dir.unwrap();
    assert!(merged.join("tokenizer.json").is_file());
    let config = ModelConfig::load(&merged).unwrap();
    assert_eq!(config.num_hidden_layers, common::LAYERS);
    let store = WeightStore::open(&merged, candle_core::DType::F32, &candle_core::Device::Cpu).unwrap();
    assert!(!store.is_quantized());
    assert_eq!(store.parameter_count().unwrap(), common::parameter_count());
}

#[test]
fn test_strict_records_reject_missing_response() {
    let tmp = tempfile::tempdir().unwrap();
    let model_dir = tmp.path().join("tiny-llama");
    common::write_model(&model_dir);
    let dataset = tmp.path().join("train.jsonl");
    common::write_dataset(&dataset, &[json!({"instruction": "2+2?"})]);

    let mut strict = job(&dataset, tmp.path());
    strict.settings.strict_records = true;
    let err = finetune(&model_dir, "tiny-llama", &strict).unwrap_err();
    assert!(matches!(err, MlError::Dataset(_)), "{err}");

    let lenient = job(&dataset, tmp.path());
    assert!(finetune(&model_dir, "tiny-llama", &lenient).is_ok());
}

#[test]
fn test_empty_dataset_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let model_dir = tmp.path().join("tiny-llama");
    common::write_model(&model_dir);
    let dataset = tmp.path().join("empty.jsonl");
    std::fs::write(&dataset, "\n\n").unwrap();

    let err = finetune(&model_dir, "tiny-llama", &job(&dataset, tmp.path())).unwrap_err();
    assert!(matches!(err, MlError::Dataset(_)));
}

#[tokio::test]
async fn test_missing_dataset_fails_before_model_resolution() {
    let tmp = tempfile::tempdir().unwrap();
    let mut job = job(&tmp.path().join("missing.jsonl"), tmp.path());
    job.settings.model_name = "org/does-not-matter".to_string();
    let err = run(&offline_client(), job).await.unwrap_err();
    assert!(matches!(err, MlError::NotFound(_)));
}

/// Stops on the first training loss it sees.
struct StopOnFirstLoss;

impl TrainingCallback for StopOnFirstLoss {
    fn on_log(&mut self, _state: &TrainerState, entry: &LogEntry) -> CallbackAction {
        match entry.loss {
            Some(_) => CallbackAction::Stop("loss became NaN".to_string()),
            None => CallbackAction::Continue,
        }
    }
}

#[test]
fn test_stopped_run_still_writes_adapter_and_state() {
    let tmp = tempfile::tempdir().unwrap();
    let model_dir = tmp.path().join("tiny-llama");
    common::write_model(&model_dir);
    let dataset = tmp.path().join("train.jsonl");
    common::write_dataset(&dataset, &[json!({"instruction": "2+2?", "response": "4"})]);

    let mut job = job(&dataset, tmp.path());
    job.trainer.logging_steps = 1;
    let settings = &job.settings;

    let mut tokenizer = TokenizerBundle::load(&model_dir).unwrap();
    tokenizer.configure_fixed_length(settings.max_length).unwrap();
    let records = load_jsonl(&dataset, RecordPolicy::Lenient).unwrap();
    let split = prepare_dataset(&records, &tokenizer, 0.1, settings.seed).unwrap();

    let device = candle_core::Device::Cpu;
    let store = WeightStore::open(&model_dir, candle_core::DType::F32, &device).unwrap();
    let config = ModelConfig::load(&model_dir).unwrap();
    let mut model = CausalLm::load(&store, &config, settings.max_length).unwrap();
    let varmap = candle_nn::VarMap::new();
    model.attach_lora(&job.lora, &varmap, settings.seed).unwrap();

    let output = tmp.path().join("stopped");
    let args = TrainingArguments::new(output.clone(), settings, &job.trainer);
    let adapter_config = PeftAdapterConfig::from_settings(&job.lora, "tiny-llama");
    let err = Trainer::new(&model, &varmap, args, adapter_config, tokenizer.pad_token_id())
        .with_callback(Box::new(StopOnFirstLoss))
        .train(&split.train, &split.validation)
        .unwrap_err();
    assert!(matches!(err, MlError::Training(_)), "{err}");

    assert!(output.join("adapter_model.safetensors").is_file());
    assert!(output.join("adapter_config.json").is_file());
    let state: TrainerState = serde_json::from_str(
        &std::fs::read_to_string(output.join("trainer_state.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(state.global_step, 1);
    assert_eq!(state.log_history.len(), 1);
}

#[test]
fn test_merged_tensors_come_out_in_f16() {
    let tmp = tempfile::tempdir().unwrap();
    let model_dir = tmp.path().join("tiny-llama");
    common::write_model(&model_dir);

    let device = candle_core::Device::Cpu;
    let store = WeightStore::open(&model_dir, candle_core::DType::F32, &device).unwrap();
    let config = ModelConfig::load(&model_dir).unwrap();
    let mut model = CausalLm::load(&store, &config, 16).unwrap();
    let varmap = candle_nn::VarMap::new();
    model.attach_lora(&LoraSettings::default(), &varmap, 42).unwrap();

    let tensors = model.merged_tensors(candle_core::DType::F16).unwrap();
    assert!(tensors.iter().all(|(_, t)| t.dtype() == candle_core::DType::F16));
    let params: u64 = tensors.iter().map(|(_, t)| t.elem_count() as u64).sum();
    assert_eq!(params, common::parameter_count());
    assert!(
        tensors
            .iter()
            .any(|(name, _)| name == "model.layers.0.self_attn.q_proj.weight")
    );
}
