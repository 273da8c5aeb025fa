//! Shared persistence utilities: atomic file writes, JSON load/save.
//!
//! Every artifact file the tools produce goes through [`write_atomically`], so a
//! crashed or interrupted run never leaves a truncated weight shard or config
//! behind under its final name, and a rerun simply replaces complete files.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Path of the temporary sibling used while writing `path`.
///
/// The `.tmp` suffix is appended to the full file name, so
/// `model.safetensors` and `model.safetensors.index.json` never share one.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Run `write` against a temporary sibling of `path`, then rename it into place.
///
/// Creates parent directories if they don't exist. The temporary file is
/// removed if `write` fails.
pub fn write_atomically<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    if let Err(e) = write(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path)
}

/// Atomically write JSON data to a file (pretty-printed).
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    write_atomically(path, |tmp| std::fs::write(tmp, data))
}

/// Atomically copy `src` to `dest`.
pub fn atomic_copy(src: &Path, dest: &Path) -> io::Result<u64> {
    let mut copied = 0;
    write_atomically(dest, |tmp| {
        copied = std::fs::copy(src, tmp)?;
        Ok(())
    })?;
    Ok(copied)
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
