//! LoRA adapter persistence: PEFT `adapter_config.json`, adapter weights,
//! restoring a checkpoint and exporting merged weights.

use crate::error::MlError;
use crate::llm::quantize::annotate_model_config;
use crate::model::config::{GENERATION_CONFIG_FILE, MODEL_CONFIG_FILE};
use crate::model::decoder::CausalLm;
use crate::model::weights::SINGLE_WEIGHTS_FILE;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use saedu_core::persistence::{atomic_copy, atomic_write_json, write_atomically};
use saedu_core::{LoraSettings, Quantization};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// PEFT adapter configuration, loadable by `PeftModel.from_pretrained`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeftAdapterConfig {
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f64,
    pub target_modules: Vec<String>,
    pub lora_dropout: f64,
    pub bias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_model_name_or_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub inference_mode: bool,
}

impl PeftAdapterConfig {
    pub fn from_settings(settings: &LoraSettings, base_model: &str) -> Self {
        let mut target_modules = settings.target_modules.clone();
        target_modules.sort();
        target_modules.dedup();
        Self {
            peft_type: "LORA".to_string(),
            r: settings.r,
            lora_alpha: settings.alpha,
            target_modules,
            lora_dropout: settings.dropout,
            bias: settings.bias.clone(),
            base_model_name_or_path: Some(base_model.to_string()),
            task_type: Some("CAUSAL_LM".to_string()),
            fan_in_fan_out: false,
            inference_mode: true,
        }
    }

    pub fn load(dir: &Path) -> Result<Self, MlError> {
        let text = std::fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn adapter_tensors(varmap: &VarMap) -> Result<HashMap<String, Tensor>, MlError> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| MlError::training("adapter variable map lock poisoned"))?;
    Ok(vars
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect())
}

/// Write `adapter_model.safetensors` and `adapter_config.json` into `dir`.
/// Returns the weights path.
pub fn save_adapter(
    dir: &Path,
    varmap: &VarMap,
    config: &PeftAdapterConfig,
) -> Result<PathBuf, MlError> {
    std::fs::create_dir_all(dir)?;
    let tensors = adapter_tensors(varmap)?;
    if tensors.is_empty() {
        return Err(MlError::training("no adapter weights to save"));
    }
    let weights = dir.join(ADAPTER_WEIGHTS_FILE);
    write_atomically(&weights, |tmp| {
        candle_core::safetensors::save(&tensors, tmp).map_err(std::io::Error::other)
    })?;
    atomic_write_json(&dir.join(ADAPTER_CONFIG_FILE), config)?;
    tracing::debug!(dir = %dir.display(), tensors = tensors.len(), "adapter saved");
    Ok(weights)
}

/// Overwrite the adapter variables in `varmap` with the weights in `path`.
pub fn restore_adapter(varmap: &VarMap, path: &Path, device: &Device) -> Result<(), MlError> {
    let saved = candle_core::safetensors::load(path, device)?;
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| MlError::training("adapter variable map lock poisoned"))?;
    for (name, var) in vars.iter() {
        let tensor = saved.get(name).ok_or_else(|| {
            MlError::not_found(format!("adapter tensor `{name}` in {}", path.display()))
        })?;
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    tracing::debug!(path = %path.display(), "adapter restored");
    Ok(())
}

/// Write a full F16 model with the adapters folded into the base weights.
///
/// `config.json` and `generation_config.json` are taken from `base_dir`.
pub fn write_merged_model(model: &CausalLm, base_dir: &Path, dest: &Path) -> Result<(), MlError> {
    std::fs::create_dir_all(dest)?;
    let tensors: HashMap<_, _> = model.merged_tensors(DType::F16)?.into_iter().collect();
    write_atomically(&dest.join(SINGLE_WEIGHTS_FILE), |tmp| {
        candle_core::safetensors::save(&tensors, tmp).map_err(std::io::Error::other)
    })?;

    let mut config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(base_dir.join(MODEL_CONFIG_FILE))?)?;
    annotate_model_config(&mut config, Quantization::None);
    atomic_write_json(&dest.join(MODEL_CONFIG_FILE), &config)?;

    let generation = base_dir.join(GENERATION_CONFIG_FILE);
    if generation.exists() {
        atomic_copy(&generation, &dest.join(GENERATION_CONFIG_FILE))?;
    }
    tracing::info!(dest = %dest.display(), tensors = tensors.len(), "merged model written");
    Ok(())
}
