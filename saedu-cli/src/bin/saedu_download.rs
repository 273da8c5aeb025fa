//! saedu-download: fetch a base model and tokenizer into a local directory.

use anyhow::Context;
use clap::Parser;
use saedu_cli::args::DownloadCli;
use saedu_cli::logging;
use saedu_ml::zoo::{HubClient, acquire, group_digits};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = DownloadCli::parse();

    let mut config = saedu_cli::load(cli.common.config.as_deref())?;
    cli.apply(&mut config);

    let log_dir = config
        .runtime
        .log_dir
        .clone()
        .unwrap_or_else(logging::default_log_dir);
    let _guard = logging::init(cli.common.verbose, cli.common.quiet, &log_dir, "download.log");

    let settings = &config.download;
    println!("Downloading model: {}", settings.model);
    println!("Output directory: {}", settings.output.display());
    println!("Quantization: {}", settings.quantization);

    let client = HubClient::new(&config.hub).context("cannot set up the hub client")?;
    let report = acquire(&client, settings)
        .await
        .with_context(|| format!("failed to acquire {}", settings.model))?;

    println!();
    println!("Model saved to: {}", report.output.display());
    println!("Parameters: {}", group_digits(report.parameters));
    if report.quantized_tensors > 0 {
        println!("Quantized tensors: {}", report.quantized_tensors);
    }
    println!("Total size: {:.2} GB", report.size_gb());
    println!();
    println!("Next steps:");
    println!(
        "  saedu-finetune --model_name {} --dataset_path <data.jsonl> --language <lang>",
        report.output.display()
    );
    Ok(())
}
