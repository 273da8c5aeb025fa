//! Acquisition from a local snapshot, and fine-tuning on the result.

mod common;

use pretty_assertions::assert_eq;
use saedu_core::{
    DevicePreference, DownloadSettings, FineTuneSettings, HubConfig, LoraSettings, Precision,
    Quantization, TrainerSettings,
};
use saedu_ml::llm::{FineTuneJob, finetune};
use saedu_ml::model::{WeightIndex, WeightStore};
use saedu_ml::zoo::{HubClient, ModelSnapshot, acquire, disk_usage, persist};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;

fn offline_client() -> HubClient {
    HubClient::new(&HubConfig {
        progress: false,
        ..HubConfig::default()
    })
    .unwrap()
}

/// Split the tiny model's weights over two shards with an index.
fn shard_model(dir: &Path) {
    let single = dir.join("model.safetensors");
    let tensors = candle_core::safetensors::load(&single, &candle_core::Device::Cpu).unwrap();
    std::fs::remove_file(&single).unwrap();

    let (first, second): (HashMap<_, _>, HashMap<_, _>) = tensors
        .into_iter()
        .partition(|(name, _)| name.starts_with("model.layers.0.") || name.starts_with("model.embed"));
    let mut weight_map = serde_json::Map::new();
    for (file, part) in [
        ("model-00001-of-00002.safetensors", &first),
        ("model-00002-of-00002.safetensors", &second),
    ] {
        candle_core::safetensors::save(part, dir.join(file)).unwrap();
        for name in part.keys() {
            weight_map.insert(name.clone(), json!(file));
        }
    }
    std::fs::write(
        dir.join("model.safetensors.index.json"),
        json!({"metadata": {"total_size": 0}, "weight_map": weight_map}).to_string(),
    )
    .unwrap();
}

#[tokio::test]
async fn test_acquire_local_artifact_is_complete() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    common::write_model(&source);
    let output = tmp.path().join("base");

    let settings = DownloadSettings {
        model: source.display().to_string(),
        output: output.clone(),
        quantization: Quantization::None,
    };
    let report = acquire(&offline_client(), &settings).await.unwrap();

    assert_eq!(report.parameters, common::parameter_count());
    assert_eq!(report.quantized_tensors, 0);
    assert_eq!(report.disk_bytes, disk_usage(&output).unwrap());
    assert!(!report.tokenizer_files.is_empty());
    assert!(!report.weight_files.is_empty());
    for file in report.tokenizer_files.iter().chain(&report.weight_files) {
        assert!(output.join(file).is_file(), "missing {file}");
    }
    assert!(output.join("generation_config.json").is_file());

    // the artifact stands on its own
    let again = ModelSnapshot::from_dir(&output).unwrap();
    assert_eq!(again.files.weights, vec!["model.safetensors"]);
}

#[test]
fn test_sharded_int4_index_is_rewritten() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    common::write_model(&source);
    shard_model(&source);
    let output = tmp.path().join("base-int4");

    let snapshot = ModelSnapshot::from_dir(&source).unwrap();
    assert_eq!(snapshot.files.weights.len(), 2);
    let report = persist(&snapshot, &output, Quantization::Int4).unwrap();
    // seven projections per layer
    assert_eq!(report.quantized_tensors, 7 * common::LAYERS);

    let index: WeightIndex = serde_json::from_str(
        &std::fs::read_to_string(output.join("model.safetensors.index.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(
        index.weight_map["model.layers.0.self_attn.q_proj.weight.absmax"],
        "model-00001-of-00002.safetensors"
    );
    assert_eq!(
        index.weight_map["model.layers.1.mlp.down_proj.weight.absmax"],
        "model-00002-of-00002.safetensors"
    );
    assert!(index.metadata["total_size"].as_u64().unwrap() > 0);

    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(output.join("config.json")).unwrap()).unwrap();
    assert_eq!(config["quantization_config"]["bits"], 4);
    assert_eq!(config["quantization_config"]["block_size"], 64);

    let store = WeightStore::open(&output, candle_core::DType::F32, &candle_core::Device::Cpu).unwrap();
    assert!(store.is_quantized());
    assert_eq!(store.parameter_count().unwrap(), common::parameter_count());
}

#[test]
fn test_finetune_on_quantized_base() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    common::write_model(&source);
    let base = tmp.path().join("base-int8");
    let snapshot = ModelSnapshot::from_dir(&source).unwrap();
    persist(&snapshot, &base, Quantization::Int8).unwrap();

    let dataset = tmp.path().join("train.jsonl");
    common::write_dataset(
        &dataset,
        &[
            json!({"instruction": "2+2?", "response": "4"}),
            json!({"instruction": "2+2?", "response": null}),
        ],
    );
    let job = FineTuneJob {
        settings: FineTuneSettings {
            model_name: base.display().to_string(),
            dataset_path: Some(dataset),
            output_dir: tmp.path().join("out"),
            num_epochs: 1,
            max_length: 16,
            precision: Precision::F32,
            ..FineTuneSettings::default()
        },
        lora: LoraSettings::default(),
        trainer: TrainerSettings::default(),
        device: DevicePreference::Cpu,
    };
    let outcome = finetune(&base, "base-int8", &job).unwrap();
    assert_eq!(outcome.train_examples + outcome.validation_examples, 2);
    assert!(outcome.adapter_weights.is_file());
}
