//! Flags layered over configuration files.

use clap::Parser;
use pretty_assertions::assert_eq;
use saedu_cli::args::{DownloadCli, FinetuneCli};
use saedu_core::Quantization;

#[test]
fn test_config_file_then_flags() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("saedu.toml");
    std::fs::write(
        &config_path,
        r#"
[finetune]
num_epochs = 5
language = "xh"

[lora]
r = 8
"#,
    )
    .unwrap();

    let cli = FinetuneCli::try_parse_from([
        "saedu-finetune",
        "--config",
        config_path.to_str().unwrap(),
        "--dataset_path",
        "train.jsonl",
        "--language",
        "af",
    ])
    .unwrap();
    let mut config = saedu_cli::load(cli.common.config.as_deref()).unwrap();
    assert_eq!(config.finetune.num_epochs, 5);
    assert_eq!(config.lora.r, 8);

    cli.apply(&mut config);
    assert_eq!(config.finetune.num_epochs, 5);
    assert_eq!(config.finetune.language, "af");
}

#[test]
fn test_missing_config_file_is_an_error() {
    let cli = DownloadCli::try_parse_from([
        "saedu-download",
        "--config",
        "/nonexistent/saedu.toml",
        "--quantization",
        "int8",
    ])
    .unwrap();
    assert_eq!(cli.quantization, Some(Quantization::Int8));
    assert!(saedu_cli::load(cli.common.config.as_deref()).is_err());
}
