//! Compute runtime selection: device placement and precision.
//!
//! `auto` resolves to the first accelerator compiled into the binary (CUDA, then
//! Metal) and falls back to the CPU. An explicit accelerator that is not
//! available is an error rather than a silent fallback.

use crate::error::MlError;
use candle_core::{DType, Device};
use saedu_core::{DevicePreference, Precision};
use tracing::{debug, info};

/// Resolve a device preference into a concrete candle device.
pub fn select_device(preference: DevicePreference) -> Result<Device, MlError> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0)
            .map_err(|e| MlError::model(format!("CUDA device unavailable: {e}")))?,
        DevicePreference::Metal => Device::new_metal(0)
            .map_err(|e| MlError::model(format!("Metal device unavailable: {e}")))?,
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0)?
            } else {
                debug!("no accelerator compiled in, using CPU");
                Device::Cpu
            }
        }
    };
    info!(device = describe(&device), "compute device selected");
    Ok(device)
}

/// Tensor dtype for a configured precision.
pub fn dtype_for(precision: Precision) -> DType {
    match precision {
        Precision::F16 => DType::F16,
        Precision::Bf16 => DType::BF16,
        Precision::F32 => DType::F32,
    }
}

/// Short human-readable device name for logs and reports.
pub fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
