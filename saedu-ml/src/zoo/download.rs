//! Model hub client and model source resolution.

use crate::error::MlError;
use crate::zoo::snapshot::{ModelSnapshot, RepoFiles};
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use saedu_core::HubConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where a base model comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSource {
    Hub { repo_id: String, revision: String },
    Local { path: PathBuf },
}

impl ModelSource {
    /// An existing directory is a local artifact; anything else is a hub id.
    pub fn parse(name: &str, revision: &str) -> Result<Self, MlError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(MlError::invalid_input("model identifier is empty"));
        }
        let path = Path::new(trimmed);
        if path.is_dir() {
            return Ok(Self::Local {
                path: path.to_path_buf(),
            });
        }
        if trimmed.starts_with('.') || trimmed.starts_with('/') || trimmed.split('/').count() > 2 {
            return Err(MlError::not_found(format!("model directory {trimmed}")));
        }
        Ok(Self::Hub {
            repo_id: trimmed.to_string(),
            revision: revision.to_string(),
        })
    }

    /// Last path component, used to name fine-tuned artifacts.
    pub fn basename(&self) -> String {
        let full = match self {
            Self::Hub { repo_id, .. } => repo_id.as_str(),
            Self::Local { path } => path.to_str().unwrap_or_default(),
        };
        let base = full
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(full);
        if base.is_empty() || base == "." {
            "model".to_string()
        } else {
            base.to_string()
        }
    }
}

/// Client for a Hugging Face compatible model hub.
pub struct HubClient {
    api: Api,
    revision: String,
}

impl HubClient {
    pub fn new(config: &HubConfig) -> Result<Self, MlError> {
        let mut builder = ApiBuilder::new()
            .with_progress(config.progress)
            .with_token(config.token.clone());
        if let Some(cache_dir) = &config.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        Ok(Self {
            api: builder.build()?,
            revision: config.revision.clone(),
        })
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// List the repository and download the files needed to rebuild the
    /// model. Files already in the hub cache are not fetched again.
    pub async fn snapshot(&self, repo_id: &str, revision: &str) -> Result<ModelSnapshot, MlError> {
        let repo = self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        let info = repo
            .info()
            .await
            .map_err(|e| MlError::hub(format!("cannot resolve {repo_id}@{revision}: {e}")))?;
        let listing: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
        let files = RepoFiles::select(repo_id, &listing)?;
        tracing::info!(
            repo_id,
            revision,
            sha = %info.sha,
            files = files.all().len(),
            "repository resolved"
        );

        let mut paths = BTreeMap::new();
        for name in files.all() {
            tracing::debug!(repo_id, file = name, "fetching");
            let path = repo
                .get(name)
                .await
                .map_err(|e| MlError::hub(format!("download of {name} from {repo_id} failed: {e}")))?;
            paths.insert(name.to_string(), path);
        }

        Ok(ModelSnapshot {
            model_id: repo_id.to_string(),
            files,
            paths,
        })
    }

    /// Make `source` available locally.
    pub async fn resolve(&self, source: &ModelSource) -> Result<ModelSnapshot, MlError> {
        match source {
            ModelSource::Local { path } => ModelSnapshot::from_dir(path),
            ModelSource::Hub { repo_id, revision } => self.snapshot(repo_id, revision).await,
        }
    }
}
