//! Shared plumbing for the `saedu-download` and `saedu-finetune` binaries.

pub mod args;
pub mod logging;

use anyhow::Context;
use saedu_core::{SaeduConfig, load_config};
use std::path::Path;

/// Load layered configuration with the current directory as workspace.
pub fn load(config_file: Option<&Path>) -> anyhow::Result<SaeduConfig> {
    let workspace = std::env::current_dir().context("cannot determine the current directory")?;
    load_config(Some(&workspace), config_file)
        .map_err(|e| anyhow::anyhow!("Configuration error: {e}"))
}
