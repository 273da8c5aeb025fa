//! Dataset pipeline: JSON-lines records, prompt formatting, fixed-length
//! tokenization, train/validation split and batching.

pub mod batch;
pub mod record;
pub mod split;
pub mod tokenize;

pub use batch::{Batch, Batcher};
pub use record::{InstructionRecord, RecordPolicy, format_instruction, load_jsonl};
pub use split::{DatasetSplit, Split, train_validation_split};
pub use tokenize::{TokenizedExample, TokenizerBundle};

use crate::error::MlError;
use tracing::info;

/// Format and tokenize records, then split them for training and evaluation.
///
/// `tokenizer` must already be configured for fixed-length encoding.
pub fn prepare_dataset(
    records: &[InstructionRecord],
    tokenizer: &TokenizerBundle,
    validation_fraction: f64,
    seed: u64,
) -> Result<DatasetSplit<TokenizedExample>, MlError> {
    let texts: Vec<String> = records.iter().map(InstructionRecord::format).collect();
    let tokenized = tokenizer.encode_fixed(&texts)?;
    let split = train_validation_split(tokenized, validation_fraction, seed)?;
    info!(
        train = split.train.len(),
        validation = split.validation.len(),
        "dataset prepared"
    );
    Ok(split)
}
