//! Safetensors weight discovery and loading.
//!
//! Weights are memory-mapped across every shard of a model directory.
//! Tensors persisted in int8 or int4 form are dequantized on load, so a
//! quantized artifact serves as a frozen base like any other.

use crate::error::MlError;
use crate::llm::quantize::{
    INT4_SCALE_SUFFIX, INT8_SCALE_SUFFIX, dequantize_int4, dequantize_int8,
};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use safetensors::Dtype;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

pub const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
/// Adapter weights share the extension but are never part of the base model.
const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// `model.safetensors.index.json` of a sharded checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightIndex {
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub weight_map: BTreeMap<String, String>,
}

impl WeightIndex {
    /// Shard file names in sorted order, each listed once.
    pub fn shards(&self) -> Vec<String> {
        self.weight_map
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn set_total_size(&mut self, bytes: u64) {
        self.metadata.insert("total_size".into(), bytes.into());
    }
}

/// Whether a repository file name is a base-model safetensors file.
pub fn is_weight_file(name: &str) -> bool {
    name.ends_with(".safetensors") && !name.ends_with(ADAPTER_WEIGHTS_FILE)
}

/// Locate the safetensors files of the model in `dir`.
///
/// Prefers the shard index, then `model.safetensors`, then any other
/// safetensors file in the directory.
pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>, MlError> {
    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    if index_path.exists() {
        let index: WeightIndex = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
        let files: Vec<PathBuf> = index.shards().into_iter().map(|f| dir.join(f)).collect();
        if let Some(missing) = files.iter().find(|f| !f.exists()) {
            return Err(MlError::not_found(format!(
                "shard {} listed in {WEIGHTS_INDEX_FILE}",
                missing.display()
            )));
        }
        return Ok(files);
    }

    let single = dir.join(SINGLE_WEIGHTS_FILE);
    if single.exists() {
        return Ok(vec![single]);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_weight_file)
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(MlError::not_found(format!(
            "safetensors weights in {}",
            dir.display()
        )));
    }
    Ok(files)
}

/// Read access to a model's weights in a fixed dtype on a fixed device.
pub struct WeightStore {
    tensors: MmapedSafetensors,
    names: HashSet<String>,
    dtype: DType,
    device: Device,
}

impl std::fmt::Debug for WeightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightStore")
            .field("tensors", &self.names.len())
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish()
    }
}

impl WeightStore {
    pub fn open(dir: &Path, dtype: DType, device: &Device) -> Result<Self, MlError> {
        let files = weight_files(dir)?;
        // SAFETY: weight files are treated as read-only for the store's lifetime.
        let tensors = unsafe { MmapedSafetensors::multi(files.as_slice())? };
        let names = tensors.tensors().into_iter().map(|(name, _)| name).collect();
        tracing::debug!(dir = %dir.display(), files = files.len(), "weights mapped");
        Ok(Self {
            tensors,
            names,
            dtype,
            device: device.clone(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Whether any weight is stored in quantized form.
    pub fn is_quantized(&self) -> bool {
        self.names
            .iter()
            .any(|n| n.ends_with(INT8_SCALE_SUFFIX) || n.ends_with(INT4_SCALE_SUFFIX))
    }

    /// Names of the logical model tensors, scale tensors excluded.
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .names
            .iter()
            .filter(|n| !n.ends_with(INT8_SCALE_SUFFIX) && !n.ends_with(INT4_SCALE_SUFFIX))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Parameters of the logical model, counting packed int4 weights at full width.
    pub fn parameter_count(&self) -> Result<u64, MlError> {
        let mut total = 0u64;
        for name in self.tensor_names() {
            let view = self.tensors.get(&name)?;
            let mut elements = view.shape().iter().product::<usize>() as u64;
            if self.contains(&format!("{name}{INT4_SCALE_SUFFIX}")) {
                elements *= 2;
            }
            total += elements;
        }
        Ok(total)
    }

    /// Load a tensor in the store dtype, dequantizing if needed.
    pub fn get(&self, name: &str) -> Result<Tensor, MlError> {
        self.get_as(name, self.dtype)
    }

    pub fn get_opt(&self, name: &str) -> Result<Option<Tensor>, MlError> {
        if self.contains(name) {
            self.get(name).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn get_as(&self, name: &str, dtype: DType) -> Result<Tensor, MlError> {
        if !self.contains(name) {
            return Err(MlError::model(format!("missing tensor `{name}`")));
        }
        let int8_scale = format!("{name}{INT8_SCALE_SUFFIX}");
        let int4_scale = format!("{name}{INT4_SCALE_SUFFIX}");

        let tensor = if self.contains(&int8_scale) {
            let view = self.tensors.get(name)?;
            let (rows, cols) = matrix_dims(name, view.shape(), view.dtype(), Dtype::I8)?;
            let q: Vec<i8> = view.data().iter().map(|&b| b as i8).collect();
            let absmax = self.scales(&int8_scale)?;
            Tensor::from_vec(dequantize_int8(&q, &absmax, rows, cols), (rows, cols), &self.device)?
        } else if self.contains(&int4_scale) {
            let view = self.tensors.get(name)?;
            let (rows, half) = matrix_dims(name, view.shape(), view.dtype(), Dtype::U8)?;
            let cols = half * 2;
            let absmax = self.scales(&int4_scale)?;
            Tensor::from_vec(
                dequantize_int4(view.data(), &absmax, rows, cols),
                (rows, cols),
                &self.device,
            )?
        } else {
            self.tensors.load(name, &self.device)?
        };
        Ok(tensor.to_dtype(dtype)?)
    }

    fn scales(&self, name: &str) -> Result<Vec<f32>, MlError> {
        Ok(self
            .tensors
            .load(name, &Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?)
    }
}

fn matrix_dims(
    name: &str,
    shape: &[usize],
    actual: Dtype,
    expected: Dtype,
) -> Result<(usize, usize), MlError> {
    match (shape, actual == expected) {
        ([rows, cols], true) => Ok((*rows, *cols)),
        _ => Err(MlError::quantization(format!(
            "quantized tensor `{name}` has shape {shape:?} and dtype {actual:?}, expected a {expected:?} matrix"
        ))),
    }
}
