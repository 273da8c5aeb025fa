//! On-disk model artifact inspection.

use crate::error::MlError;
use std::path::Path;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Recursive sum of the sizes of all regular files under `dir`.
pub fn disk_usage(dir: &Path) -> Result<u64, MlError> {
    let mut total = 0;
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| MlError::Io(std::io::Error::other(e)))?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(|e| MlError::Io(std::io::Error::other(e)))?.len();
        }
    }
    Ok(total)
}

pub fn to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// `1234567` -> `"1,234,567"`.
pub fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
