//! Instruction/response records and the prompt template.

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// Opening marker of every formatted training text.
pub const INSTRUCTION_MARKER: &str = "### Instruction:\n";
/// Marker separating the instruction from the expected response.
pub const RESPONSE_MARKER: &str = "### Response:\n";

/// How records missing `instruction` or `response` are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordPolicy {
    /// Missing or null fields become empty strings.
    #[default]
    Lenient,
    /// Missing or null fields are a dataset error naming the line.
    Strict,
}

/// One supervised example as read from the dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub instruction: String,
    pub response: String,
}

impl InstructionRecord {
    pub fn new(instruction: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            response: response.into(),
        }
    }

    /// Build a record from one decoded JSON object.
    ///
    /// Strings are taken verbatim, other JSON values use their JSON text, and
    /// missing or null fields follow `policy`.
    pub fn from_json(
        value: &serde_json::Value,
        line: usize,
        policy: RecordPolicy,
    ) -> Result<Self, MlError> {
        let object = value.as_object().ok_or_else(|| {
            MlError::dataset(format!("line {line}: expected a JSON object, got {value}"))
        })?;

        let field = |key: &str| -> Result<String, MlError> {
            match object.get(key) {
                Some(serde_json::Value::String(s)) => Ok(s.clone()),
                Some(serde_json::Value::Null) | None => match policy {
                    RecordPolicy::Lenient => Ok(String::new()),
                    RecordPolicy::Strict => Err(MlError::dataset(format!(
                        "line {line}: missing required field `{key}`"
                    ))),
                },
                Some(other) => Ok(other.to_string()),
            }
        };

        Ok(Self {
            instruction: field("instruction")?,
            response: field("response")?,
        })
    }

    /// Render the record into the single training text.
    pub fn format(&self) -> String {
        format_instruction(&self.instruction, &self.response)
    }
}

/// The fixed instruction-following template.
pub fn format_instruction(instruction: &str, response: &str) -> String {
    format!("{INSTRUCTION_MARKER}{instruction}\n\n{RESPONSE_MARKER}{response}")
}

/// Load a JSON-lines dataset. Blank lines are skipped.
///
/// A missing file or a line that is not a JSON object is fatal. How records
/// with missing fields are handled depends on `policy`.
pub fn load_jsonl(path: &Path, policy: RecordPolicy) -> Result<Vec<InstructionRecord>, MlError> {
    let file = std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MlError::not_found(format!("dataset {}", path.display()))
        } else {
            MlError::Io(e)
        }
    })?;

    let mut records = Vec::new();
    let mut degraded = 0usize;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| MlError::dataset(format!("line {}: invalid JSON: {e}", idx + 1)))?;

        if is_incomplete(&value) {
            degraded += 1;
        }
        records.push(InstructionRecord::from_json(&value, idx + 1, policy)?);
    }

    if degraded > 0 {
        warn!(
            count = degraded,
            "records missing instruction/response were filled with empty strings"
        );
    }
    debug!(path = %path.display(), records = records.len(), "dataset loaded");
    Ok(records)
}

fn is_incomplete(value: &serde_json::Value) -> bool {
    ["instruction", "response"]
        .iter()
        .any(|key| value.get(key).is_none_or(|v| v.is_null()))
}
