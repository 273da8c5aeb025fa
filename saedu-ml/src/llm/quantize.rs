//! Weight quantization for persisted model artifacts.
//!
//! Two symmetric absmax schemes are supported on linear-layer weights:
//!
//! - **int8**: one scale per output row. Stored as an `I8` tensor plus a
//!   `<name>.scb` F32 vector holding each row's absmax.
//! - **int4**: one scale per 64-column block of each row. Values in
//!   `[-7, 7]` are packed two per byte (even column in the high nibble) into
//!   a `U8` tensor of shape `[rows, cols / 2]`, plus a `<name>.absmax` F32
//!   tensor of shape `[rows, ceil(cols / 64)]`.
//!
//! Every other floating tensor is stored as F16.

use crate::error::MlError;
use half::{bf16, f16};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use saedu_core::Quantization;
use saedu_core::persistence::write_atomically;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Columns covered by one int4 scale.
pub const INT4_BLOCK_SIZE: usize = 64;
/// Suffix of the per-row absmax vector of an int8 weight.
pub const INT8_SCALE_SUFFIX: &str = ".scb";
/// Suffix of the per-block absmax matrix of an int4 weight.
pub const INT4_SCALE_SUFFIX: &str = ".absmax";
/// `quant_method` recorded in `config.json`.
pub const QUANT_METHOD: &str = "saedu_absmax";

const INT8_MAX: f32 = 127.0;
const INT4_MAX: f32 = 7.0;

/// Name fragments that keep a 2-D weight in floating point.
const SKIP_MODULES: &[&str] = &["embed", "norm", "lm_head"];

/// `quantization_config` entry written into `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub quant_method: String,
    pub bits: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<usize>,
    #[serde(default)]
    pub skip_modules: Vec<String>,
}

impl QuantizationConfig {
    /// `None` for unquantized artifacts.
    pub fn for_level(level: Quantization) -> Option<Self> {
        let block_size = match level {
            Quantization::None => return None,
            Quantization::Int8 => None,
            Quantization::Int4 => Some(INT4_BLOCK_SIZE),
        };
        Some(Self {
            quant_method: QUANT_METHOD.to_string(),
            bits: level.bits(),
            block_size,
            skip_modules: SKIP_MODULES.iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// Record the storage precision in a model's `config.json` value.
pub fn annotate_model_config(config: &mut serde_json::Value, level: Quantization) {
    if let Some(obj) = config.as_object_mut() {
        obj.insert("torch_dtype".into(), "float16".into());
        match QuantizationConfig::for_level(level) {
            Some(qc) => {
                if let Ok(value) = serde_json::to_value(qc) {
                    obj.insert("quantization_config".into(), value);
                }
            }
            None => {
                obj.remove("quantization_config");
            }
        }
    }
}

/// Whether a tensor is a linear-layer weight eligible for quantization.
pub fn is_linear_weight(name: &str, shape: &[usize]) -> bool {
    shape.len() == 2 && name.ends_with(".weight") && !SKIP_MODULES.iter().any(|m| name.contains(m))
}

/// A tensor ready to be written to a safetensors file.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTensor {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl StoredTensor {
    fn f32(name: String, shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            name,
            dtype: Dtype::F32,
            shape,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn f16(name: String, shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            name,
            dtype: Dtype::F16,
            shape,
            data: values
                .iter()
                .flat_map(|v| f16::from_f32(*v).to_le_bytes())
                .collect(),
        }
    }

    pub fn view(&self) -> Result<TensorView<'_>, MlError> {
        Ok(TensorView::new(self.dtype, self.shape.clone(), &self.data)?)
    }
}

/// Decode a floating tensor's little-endian bytes to f32.
pub fn to_f32(dtype: Dtype, data: &[u8]) -> Result<Vec<f32>, MlError> {
    let values = match dtype {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect(),
        other => {
            return Err(MlError::quantization(format!(
                "cannot decode {other:?} as floating point"
            )));
        }
    };
    Ok(values)
}

fn is_float(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::F16 | Dtype::BF16 | Dtype::F32 | Dtype::F64)
}

fn is_integer(dtype: Dtype) -> bool {
    matches!(
        dtype,
        Dtype::BOOL
            | Dtype::U8
            | Dtype::I8
            | Dtype::I16
            | Dtype::U16
            | Dtype::I32
            | Dtype::U32
            | Dtype::I64
            | Dtype::U64
    )
}

/// Per-row absmax int8 quantization of a row-major `[rows, cols]` matrix.
pub fn quantize_int8(values: &[f32], rows: usize, cols: usize) -> (Vec<i8>, Vec<f32>) {
    if cols == 0 {
        return (Vec::new(), vec![0.0; rows]);
    }
    let mut q = Vec::with_capacity(rows * cols);
    let mut absmax = Vec::with_capacity(rows);
    for row in values.chunks_exact(cols).take(rows) {
        let max = row.iter().fold(0f32, |m, v| m.max(v.abs()));
        absmax.push(max);
        let scale = if max > 0.0 { INT8_MAX / max } else { 0.0 };
        q.extend(
            row.iter()
                .map(|v| (v * scale).round().clamp(-INT8_MAX, INT8_MAX) as i8),
        );
    }
    (q, absmax)
}

pub fn dequantize_int8(q: &[i8], absmax: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    if cols == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(rows * cols);
    for (row, &max) in q.chunks_exact(cols).zip(absmax).take(rows) {
        let scale = max / INT8_MAX;
        out.extend(row.iter().map(|&v| f32::from(v) * scale));
    }
    out
}

/// Block-wise int4 quantization of a row-major `[rows, cols]` matrix.
///
/// `cols` must be even. Returns the packed bytes (`rows * cols / 2`) and
/// the per-block absmax (`rows * ceil(cols / 64)`).
pub fn quantize_int4(values: &[f32], rows: usize, cols: usize) -> (Vec<u8>, Vec<f32>) {
    debug_assert!(cols % 2 == 0);
    if cols == 0 {
        return (Vec::new(), Vec::new());
    }
    let blocks = cols.div_ceil(INT4_BLOCK_SIZE);
    let mut packed = vec![0u8; rows * cols / 2];
    let mut absmax = Vec::with_capacity(rows * blocks);

    for (r, row) in values.chunks_exact(cols).take(rows).enumerate() {
        for (b, block) in row.chunks(INT4_BLOCK_SIZE).enumerate() {
            let max = block.iter().fold(0f32, |m, v| m.max(v.abs()));
            absmax.push(max);
            let scale = if max > 0.0 { INT4_MAX / max } else { 0.0 };
            for (i, v) in block.iter().enumerate() {
                let col = b * INT4_BLOCK_SIZE + i;
                let nibble = ((v * scale).round().clamp(-INT4_MAX, INT4_MAX) as i8 as u8) & 0x0F;
                let byte = &mut packed[r * cols / 2 + col / 2];
                if col % 2 == 0 {
                    *byte |= nibble << 4;
                } else {
                    *byte |= nibble;
                }
            }
        }
    }
    (packed, absmax)
}

pub fn dequantize_int4(packed: &[u8], absmax: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let blocks = cols.div_ceil(INT4_BLOCK_SIZE);
    let mut out = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for col in 0..cols {
            let byte = packed[r * cols / 2 + col / 2];
            let nibble = if col % 2 == 0 { byte >> 4 } else { byte & 0x0F };
            // sign-extend the 4-bit two's complement value
            let q = ((nibble << 4) as i8) >> 4;
            let max = absmax[r * blocks + col / INT4_BLOCK_SIZE];
            out.push(f32::from(q) * max / INT4_MAX);
        }
    }
    out
}

/// Convert one source tensor into the tensors stored for `level`.
pub fn materialize(
    name: &str,
    view: &TensorView<'_>,
    level: Quantization,
) -> Result<Vec<StoredTensor>, MlError> {
    let dtype = view.dtype();
    let shape = view.shape().to_vec();

    if is_integer(dtype) {
        return Ok(vec![StoredTensor {
            name: name.to_string(),
            dtype,
            shape,
            data: view.data().to_vec(),
        }]);
    }
    if !is_float(dtype) {
        return Err(MlError::quantization(format!(
            "tensor `{name}` has unsupported dtype {dtype:?}"
        )));
    }

    let values = to_f32(dtype, view.data())?;
    if !is_linear_weight(name, &shape) {
        return Ok(vec![StoredTensor::f16(name.to_string(), shape, &values)]);
    }
    let (rows, cols) = (shape[0], shape[1]);
    if rows == 0 || cols == 0 {
        tracing::debug!(tensor = name, ?shape, "empty matrix, kept as F16");
        return Ok(vec![StoredTensor::f16(name.to_string(), shape, &values)]);
    }

    match level {
        Quantization::None => Ok(vec![StoredTensor::f16(name.to_string(), shape, &values)]),
        Quantization::Int8 => {
            let (q, absmax) = quantize_int8(&values, rows, cols);
            Ok(vec![
                StoredTensor {
                    name: name.to_string(),
                    dtype: Dtype::I8,
                    shape,
                    data: q.into_iter().map(|v| v as u8).collect(),
                },
                StoredTensor::f32(format!("{name}{INT8_SCALE_SUFFIX}"), vec![rows], &absmax),
            ])
        }
        Quantization::Int4 if cols % 2 != 0 => {
            tracing::debug!(tensor = name, cols, "odd column count, kept as F16");
            Ok(vec![StoredTensor::f16(name.to_string(), shape, &values)])
        }
        Quantization::Int4 => {
            let (packed, absmax) = quantize_int4(&values, rows, cols);
            Ok(vec![
                StoredTensor {
                    name: name.to_string(),
                    dtype: Dtype::U8,
                    shape: vec![rows, cols / 2],
                    data: packed,
                },
                StoredTensor::f32(
                    format!("{name}{INT4_SCALE_SUFFIX}"),
                    vec![rows, cols.div_ceil(INT4_BLOCK_SIZE)],
                    &absmax,
                ),
            ])
        }
    }
}

/// Outcome of converting one weight file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    /// Names of every tensor written, scale tensors included.
    pub tensor_names: Vec<String>,
    /// Linear weights stored in quantized form.
    pub quantized: usize,
    /// Parameters in the source tensors.
    pub parameters: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl FileReport {
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_out == 0 {
            1.0
        } else {
            self.bytes_in as f64 / self.bytes_out as f64
        }
    }
}

/// Rewrite a safetensors file at `dest` with every tensor materialized for
/// `level`. The destination is replaced atomically.
pub fn convert_file(src: &Path, dest: &Path, level: Quantization) -> Result<FileReport, MlError> {
    let file = std::fs::File::open(src)?;
    // SAFETY: the source file is not modified while mapped.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let tensors = SafeTensors::deserialize(&mmap)?;

    let mut report = FileReport {
        bytes_in: mmap.len() as u64,
        ..FileReport::default()
    };
    let mut stored = Vec::new();
    for (name, view) in tensors.tensors() {
        report.parameters += view.shape().iter().product::<usize>() as u64;
        let out = materialize(&name, &view, level)?;
        if out.len() > 1 {
            report.quantized += 1;
        }
        stored.extend(out);
    }
    stored.sort_by(|a, b| a.name.cmp(&b.name));

    let views = stored
        .iter()
        .map(|t| Ok((t.name.clone(), t.view()?)))
        .collect::<Result<Vec<_>, MlError>>()?;
    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    write_atomically(dest, |tmp| {
        safetensors::serialize_to_file(views, &metadata, tmp).map_err(std::io::Error::other)
    })?;

    report.bytes_out = std::fs::metadata(dest)?.len();
    report.tensor_names = stored.into_iter().map(|t| t.name).collect();
    tracing::debug!(
        file = %dest.display(),
        quantized = report.quantized,
        ratio = format!("{:.2}", report.compression_ratio()),
        "weights converted"
    );
    Ok(report)
}
