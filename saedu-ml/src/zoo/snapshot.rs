//! Repository file selection and resolved model snapshots.

use crate::data::tokenize::{SPECIAL_TOKENS_FILE, TOKENIZER_CONFIG_FILE, TOKENIZER_FILE};
use crate::error::MlError;
use crate::model::config::{GENERATION_CONFIG_FILE, MODEL_CONFIG_FILE};
use crate::model::weights::{SINGLE_WEIGHTS_FILE, WEIGHTS_INDEX_FILE, is_weight_file};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Tokenizer files copied when the repository publishes them.
pub const TOKENIZER_FILES: &[&str] = &[TOKENIZER_FILE, TOKENIZER_CONFIG_FILE, SPECIAL_TOKENS_FILE];

/// The files of a repository needed to rebuild model and tokenizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoFiles {
    pub tokenizer: Vec<String>,
    pub config: Vec<String>,
    /// The shard index, when the weights are sharded.
    pub weight_index: Option<String>,
    pub weights: Vec<String>,
}

impl RepoFiles {
    /// Pick the needed files from a repository listing.
    ///
    /// Only top-level files are considered. `tokenizer.json`, `config.json`
    /// and safetensors weights are required.
    pub fn select<S: AsRef<str>>(model_id: &str, names: &[S]) -> Result<Self, MlError> {
        let top_level: Vec<&str> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|n| !n.contains('/'))
            .collect();
        let has = |name: &str| top_level.contains(&name);

        if !has(TOKENIZER_FILE) {
            return Err(MlError::not_found(format!("{TOKENIZER_FILE} in {model_id}")));
        }
        if !has(MODEL_CONFIG_FILE) {
            return Err(MlError::not_found(format!("{MODEL_CONFIG_FILE} in {model_id}")));
        }

        let tokenizer = TOKENIZER_FILES
            .iter()
            .filter(|f| has(f))
            .map(|f| f.to_string())
            .collect();
        let config = [MODEL_CONFIG_FILE, GENERATION_CONFIG_FILE]
            .iter()
            .filter(|f| has(f))
            .map(|f| f.to_string())
            .collect();

        let (weight_index, weights) = if has(WEIGHTS_INDEX_FILE) {
            let shards = top_level
                .iter()
                .filter(|n| is_weight_file(n) && **n != SINGLE_WEIGHTS_FILE)
                .map(|n| n.to_string())
                .collect();
            (Some(WEIGHTS_INDEX_FILE.to_string()), shards)
        } else if has(SINGLE_WEIGHTS_FILE) {
            (None, vec![SINGLE_WEIGHTS_FILE.to_string()])
        } else {
            let any: Vec<String> = top_level
                .iter()
                .filter(|n| is_weight_file(n))
                .map(|n| n.to_string())
                .collect();
            (None, any)
        };
        if weights.is_empty() {
            return Err(MlError::not_found(format!(
                "safetensors weights in {model_id} (pickle checkpoints are not supported)"
            )));
        }

        Ok(Self {
            tokenizer,
            config,
            weight_index,
            weights,
        })
    }

    /// Every selected file, tokenizer first and weights last.
    pub fn all(&self) -> Vec<&str> {
        self.tokenizer
            .iter()
            .chain(&self.config)
            .chain(&self.weight_index)
            .chain(&self.weights)
            .map(String::as_str)
            .collect()
    }
}

/// A model whose selected files are available on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSnapshot {
    pub model_id: String,
    pub files: RepoFiles,
    /// Repository file name to local path.
    pub paths: BTreeMap<String, PathBuf>,
}

impl ModelSnapshot {
    /// Snapshot of a local model directory.
    pub fn from_dir(dir: &Path) -> Result<Self, MlError> {
        if !dir.is_dir() {
            return Err(MlError::not_found(format!("model directory {}", dir.display())));
        }
        let names: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        let model_id = dir.display().to_string();
        let files = RepoFiles::select(&model_id, &names)?;
        let paths = files
            .all()
            .into_iter()
            .map(|f| (f.to_string(), dir.join(f)))
            .collect();
        Ok(Self {
            model_id,
            files,
            paths,
        })
    }

    pub fn path(&self, name: &str) -> Result<&Path, MlError> {
        self.paths
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| MlError::not_found(format!("{name} in snapshot of {}", self.model_id)))
    }

    /// Directory holding the snapshot's `config.json`.
    pub fn root(&self) -> Result<&Path, MlError> {
        self.path(MODEL_CONFIG_FILE)?
            .parent()
            .ok_or_else(|| MlError::model(format!("snapshot of {} has no root", self.model_id)))
    }
}
