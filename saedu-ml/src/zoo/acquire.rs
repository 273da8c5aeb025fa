//! Model acquisition: persist a resolved snapshot as a self-contained local
//! artifact, converting weights to the requested precision on the way.

use crate::data::tokenize::TOKENIZER_FILE;
use crate::error::MlError;
use crate::llm::quantize::{FileReport, annotate_model_config, convert_file};
use crate::model::config::{GENERATION_CONFIG_FILE, MODEL_CONFIG_FILE};
use crate::model::weights::{WEIGHTS_INDEX_FILE, WeightIndex};
use crate::zoo::artifact::{disk_usage, to_gb};
use crate::zoo::download::{HubClient, ModelSource};
use crate::zoo::snapshot::ModelSnapshot;
use saedu_core::persistence::{atomic_copy, atomic_write_json};
use saedu_core::{DownloadSettings, Quantization};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Summary of a completed acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    pub model_id: String,
    pub output: PathBuf,
    pub quantization: Quantization,
    /// Parameters counted from the source tensor shapes.
    pub parameters: u64,
    pub quantized_tensors: usize,
    pub tokenizer_files: Vec<String>,
    pub weight_files: Vec<String>,
    /// Recursive size of the output directory.
    pub disk_bytes: u64,
}

impl AcquisitionReport {
    pub fn size_gb(&self) -> f64 {
        to_gb(self.disk_bytes)
    }
}

/// Write tokenizer, config and converted weights of `snapshot` into `output`.
///
/// Blocking; callers on the async runtime go through [`acquire`].
pub fn persist(
    snapshot: &ModelSnapshot,
    output: &Path,
    level: Quantization,
) -> Result<AcquisitionReport, MlError> {
    std::fs::create_dir_all(output)?;

    let tokenizer_path = snapshot.path(TOKENIZER_FILE)?;
    tokenizers::Tokenizer::from_file(tokenizer_path)
        .map_err(|e| MlError::tokenizer(format!("{}: {e}", tokenizer_path.display())))?;
    for name in &snapshot.files.tokenizer {
        atomic_copy(snapshot.path(name)?, &output.join(name))?;
    }
    info!(files = snapshot.files.tokenizer.len(), "tokenizer saved");

    let mut config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(snapshot.path(MODEL_CONFIG_FILE)?)?)?;
    if !config.is_object() {
        return Err(MlError::model(format!("{MODEL_CONFIG_FILE} is not a JSON object")));
    }
    annotate_model_config(&mut config, level);
    atomic_write_json(&output.join(MODEL_CONFIG_FILE), &config)?;
    if snapshot.paths.contains_key(GENERATION_CONFIG_FILE) {
        atomic_copy(
            snapshot.path(GENERATION_CONFIG_FILE)?,
            &output.join(GENERATION_CONFIG_FILE),
        )?;
    }

    let mut reports: Vec<(String, FileReport)> = Vec::with_capacity(snapshot.files.weights.len());
    for name in &snapshot.files.weights {
        info!(file = %name, quantization = %level, "converting weights");
        let report = convert_file(snapshot.path(name)?, &output.join(name), level)?;
        reports.push((name.clone(), report));
    }

    if let Some(index_name) = &snapshot.files.weight_index {
        let source: WeightIndex =
            serde_json::from_str(&std::fs::read_to_string(snapshot.path(index_name)?)?)?;
        let mut index = WeightIndex {
            metadata: source.metadata,
            weight_map: Default::default(),
        };
        for (file, report) in &reports {
            for tensor in &report.tensor_names {
                index.weight_map.insert(tensor.clone(), file.clone());
            }
        }
        index.set_total_size(reports.iter().map(|(_, r)| r.bytes_out).sum());
        atomic_write_json(&output.join(WEIGHTS_INDEX_FILE), &index)?;
    }

    let report = AcquisitionReport {
        model_id: snapshot.model_id.clone(),
        output: output.to_path_buf(),
        quantization: level,
        parameters: reports.iter().map(|(_, r)| r.parameters).sum(),
        quantized_tensors: reports.iter().map(|(_, r)| r.quantized).sum(),
        tokenizer_files: snapshot.files.tokenizer.clone(),
        weight_files: snapshot.files.weights.clone(),
        disk_bytes: disk_usage(output)?,
    };
    info!(
        model = %report.model_id,
        parameters = report.parameters,
        quantized = report.quantized_tensors,
        gb = format!("{:.2}", report.size_gb()),
        "model saved"
    );
    Ok(report)
}

/// Resolve `settings.model`, fetch it and persist it under `settings.output`.
pub async fn acquire(
    client: &HubClient,
    settings: &DownloadSettings,
) -> Result<AcquisitionReport, MlError> {
    let source = ModelSource::parse(&settings.model, client.revision())?;
    let snapshot = client.resolve(&source).await?;
    let output = settings.output.clone();
    let level = settings.quantization;
    tokio::task::spawn_blocking(move || persist(&snapshot, &output, level)).await?
}
