//! saedu-finetune: train a LoRA adapter on an instruction dataset.

use anyhow::Context;
use clap::Parser;
use saedu_cli::args::FinetuneCli;
use saedu_cli::logging;
use saedu_ml::llm::{FineTuneJob, run};
use saedu_ml::zoo::HubClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = FinetuneCli::parse();

    let mut config = saedu_cli::load(cli.common.config.as_deref())?;
    cli.apply(&mut config);

    let log_dir = config
        .runtime
        .log_dir
        .clone()
        .unwrap_or_else(|| config.finetune.output_dir.join("logs"));
    let _guard = logging::init(cli.common.verbose, cli.common.quiet, &log_dir, "finetune.log");

    let job = FineTuneJob {
        settings: config.finetune.clone(),
        lora: config.lora.clone(),
        trainer: config.trainer.clone(),
        device: config.runtime.device,
    };
    println!("Base model: {}", job.settings.model_name);
    if let Some(dataset) = &job.settings.dataset_path {
        println!("Dataset: {}", dataset.display());
    }
    println!("Language: {}", job.settings.language);

    let client = HubClient::new(&config.hub).context("cannot set up the hub client")?;
    let outcome = run(&client, job).await.context("fine-tuning failed")?;

    println!();
    println!("Adapter saved to: {}", outcome.artifact_dir.display());
    if let Some(best) = &outcome.state.best_model_checkpoint {
        println!(
            "Best checkpoint: {} (eval_loss {:.4})",
            best.display(),
            outcome.state.best_metric.unwrap_or(f64::NAN)
        );
    }
    if let Some(merged) = &outcome.merged_dir {
        println!("Merged model saved to: {}", merged.display());
    }
    println!();
    println!("Next steps:");
    println!(
        "  Load with PEFT: PeftModel.from_pretrained(base, \"{}\")",
        outcome.artifact_dir.display()
    );
    println!("  Training logs: {}", log_dir.display());
    Ok(())
}
