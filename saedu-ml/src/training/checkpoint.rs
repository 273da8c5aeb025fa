//! Checkpoint management for training runs.
//!
//! Checkpoints are `checkpoint-<step>` directories under the run's output
//! directory, described by a `checkpoints.json` manifest. At most
//! `max_checkpoints` are kept; the oldest go first and the best checkpoint
//! is never removed.

use crate::error::MlError;
use chrono::{DateTime, Utc};
use saedu_core::persistence::{atomic_write_json, load_json};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
const MANIFEST_FILE: &str = "checkpoints.json";

/// A training checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: usize,
    pub epoch: f64,
    pub eval_loss: Option<f64>,
    pub path: PathBuf,
    /// SHA-256 of the checkpoint's primary file.
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: PathBuf, max_checkpoints: usize) -> Self {
        Self {
            base_dir,
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    pub fn checkpoint_dir(&self, step: usize) -> PathBuf {
        self.base_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
    }

    /// Checkpoints in the manifest, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>, MlError> {
        let mut checkpoints: Vec<Checkpoint> =
            load_json(&self.base_dir.join(MANIFEST_FILE))?.unwrap_or_default();
        checkpoints.sort_by_key(|c| c.step);
        Ok(checkpoints)
    }

    /// Write checkpoint `step` with `write`, record it and rotate old ones.
    ///
    /// `write` receives the freshly created checkpoint directory and returns
    /// the path of the file to fingerprint.
    pub fn save<F>(
        &self,
        step: usize,
        epoch: f64,
        eval_loss: Option<f64>,
        keep: Option<&Path>,
        write: F,
    ) -> Result<Checkpoint, MlError>
    where
        F: FnOnce(&Path) -> Result<PathBuf, MlError>,
    {
        let dir = self.checkpoint_dir(step);
        std::fs::create_dir_all(&dir)?;
        let primary = write(&dir)?;

        let bytes = std::fs::read(&primary)?;
        let hash = format!("{:x}", Sha256::digest(&bytes));
        let size_bytes = walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum();

        let checkpoint = Checkpoint {
            step,
            epoch,
            eval_loss,
            path: dir,
            hash,
            size_bytes,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.retain(|c| c.step != step);
        checkpoints.push(checkpoint.clone());
        self.rotate(&mut checkpoints, keep.or(Some(checkpoint.path.as_path())))?;
        atomic_write_json(&self.base_dir.join(MANIFEST_FILE), &checkpoints)?;

        tracing::info!(step, path = %checkpoint.path.display(), "checkpoint saved");
        Ok(checkpoint)
    }

    /// Delete the oldest checkpoints beyond the limit, sparing `keep`.
    fn rotate(&self, checkpoints: &mut Vec<Checkpoint>, keep: Option<&Path>) -> Result<(), MlError> {
        while checkpoints.len() > self.max_checkpoints {
            let Some(victim) = checkpoints
                .iter()
                .position(|c| keep.is_none_or(|k| c.path != k))
            else {
                break;
            };
            let removed = checkpoints.remove(victim);
            if removed.path.exists() {
                std::fs::remove_dir_all(&removed.path)?;
            }
            tracing::debug!(step = removed.step, "checkpoint rotated out");
        }
        Ok(())
    }
}
