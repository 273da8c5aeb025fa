//! Tokenizer loading, pad-token setup and fixed-length encoding.

use crate::error::MlError;
use saedu_core::persistence::{atomic_write_json, write_atomically};
use serde_json::{Map, Value};
use std::path::Path;
use tokenizers::{
    PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams,
};
use tracing::{debug, info};

/// File names making up a persisted tokenizer.
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
pub const SPECIAL_TOKENS_FILE: &str = "special_tokens_map.json";

/// EOS spellings tried when neither tokenizer nor model config names one.
const EOS_CANDIDATES: &[&str] = &[
    "<|END_OF_TURN_TOKEN|>",
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<eos>",
];

/// A tokenized training example, exactly `max_length` long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl TokenizedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// A tokenizer together with the side files that describe its special tokens.
#[derive(Clone)]
pub struct TokenizerBundle {
    tokenizer: Tokenizer,
    tokenizer_config: Map<String, Value>,
    special_tokens: Map<String, Value>,
    eos_token: String,
    eos_id: u32,
    padding_side: PaddingDirection,
    max_length: Option<usize>,
}

impl std::fmt::Debug for TokenizerBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerBundle")
            .field("vocab_size", &self.vocab_size())
            .field("eos_token", &self.eos_token)
            .field("eos_id", &self.eos_id)
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl TokenizerBundle {
    /// Load `tokenizer.json` plus optional `tokenizer_config.json`,
    /// `special_tokens_map.json` and `config.json` from a model directory.
    pub fn load(dir: &Path) -> Result<Self, MlError> {
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        if !tokenizer_path.exists() {
            return Err(MlError::not_found(format!(
                "{} in {}",
                TOKENIZER_FILE,
                dir.display()
            )));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| MlError::tokenizer(format!("{}: {e}", tokenizer_path.display())))?;

        let tokenizer_config = read_object(&dir.join(TOKENIZER_CONFIG_FILE))?;
        let special_tokens = read_object(&dir.join(SPECIAL_TOKENS_FILE))?;
        let model_config = read_object(&dir.join("config.json"))?;

        let (eos_token, eos_id) =
            resolve_eos(&tokenizer, &tokenizer_config, &special_tokens, &model_config)?;

        let padding_side = match tokenizer_config.get("padding_side").and_then(Value::as_str) {
            Some("left") => PaddingDirection::Left,
            _ => PaddingDirection::Right,
        };

        debug!(
            eos = %eos_token,
            eos_id,
            vocab = tokenizer.get_vocab_size(true),
            "tokenizer loaded"
        );

        Ok(Self {
            tokenizer,
            tokenizer_config,
            special_tokens,
            eos_token,
            eos_id,
            padding_side,
            max_length: None,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    /// Padding uses the end-of-sequence token, so this is also the EOS id.
    pub fn pad_token_id(&self) -> u32 {
        self.eos_id
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    /// Set the pad token to the EOS token and enable truncation plus padding
    /// to exactly `max_length` tokens.
    pub fn configure_fixed_length(&mut self, max_length: usize) -> Result<(), MlError> {
        if max_length == 0 {
            return Err(MlError::invalid_input("max_length must be at least 1"));
        }
        self.tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| MlError::tokenizer(e.to_string()))?;
        self.tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_length),
            direction: self.padding_side,
            pad_id: self.eos_id,
            pad_token: self.eos_token.clone(),
            ..Default::default()
        }));
        self.max_length = Some(max_length);
        info!(max_length, pad = %self.eos_token, "fixed-length encoding enabled");
        Ok(())
    }

    /// Encode texts to fixed-length sequences.
    pub fn encode_fixed(&self, texts: &[String]) -> Result<Vec<TokenizedExample>, MlError> {
        let max_length = self.max_length.ok_or_else(|| {
            MlError::tokenizer("configure_fixed_length must be called before encoding")
        })?;

        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| MlError::tokenizer(e.to_string()))?;

        encodings
            .into_iter()
            .enumerate()
            .map(|(i, enc)| {
                let example = TokenizedExample {
                    input_ids: enc.get_ids().to_vec(),
                    attention_mask: enc.get_attention_mask().to_vec(),
                };
                if example.len() != max_length {
                    return Err(MlError::tokenizer(format!(
                        "example {i} encoded to {} tokens, expected {max_length}",
                        example.len()
                    )));
                }
                Ok(example)
            })
            .collect()
    }

    /// Persist the tokenizer with `pad_token` recorded as the EOS token.
    ///
    /// Truncation and padding are runtime settings and are not written into
    /// `tokenizer.json`.
    pub fn save(&self, dir: &Path) -> Result<(), MlError> {
        let mut plain = self.tokenizer.clone();
        plain.with_padding(None);
        plain
            .with_truncation(None)
            .map_err(|e| MlError::tokenizer(e.to_string()))?;

        let path = dir.join(TOKENIZER_FILE);
        write_atomically(&path, |tmp| {
            plain.save(tmp, false).map_err(std::io::Error::other)
        })?;

        let pad = Value::String(self.eos_token.clone());
        let mut config = self.tokenizer_config.clone();
        config.insert("pad_token".to_string(), pad.clone());
        if let Some(max_length) = self.max_length {
            config
                .entry("model_max_length")
                .or_insert_with(|| Value::from(max_length));
        }
        atomic_write_json(&dir.join(TOKENIZER_CONFIG_FILE), &config)?;

        let mut special = self.special_tokens.clone();
        special
            .entry("eos_token")
            .or_insert_with(|| pad.clone());
        special.insert("pad_token".to_string(), pad);
        atomic_write_json(&dir.join(SPECIAL_TOKENS_FILE), &special)?;

        debug!(dir = %dir.display(), "tokenizer saved");
        Ok(())
    }
}

fn read_object(path: &Path) -> Result<Map<String, Value>, MlError> {
    match saedu_core::persistence::load_json::<Value>(path)? {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(MlError::tokenizer(format!(
            "{} is not a JSON object",
            path.display()
        ))),
        None => Ok(Map::new()),
    }
}

/// Special tokens appear either as plain strings or as `{"content": ...}`.
fn token_content(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("content").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

fn resolve_eos(
    tokenizer: &Tokenizer,
    tokenizer_config: &Map<String, Value>,
    special_tokens: &Map<String, Value>,
    model_config: &Map<String, Value>,
) -> Result<(String, u32), MlError> {
    let named = token_content(tokenizer_config.get("eos_token"))
        .or_else(|| token_content(special_tokens.get("eos_token")));
    if let Some(token) = named {
        let id = tokenizer.token_to_id(&token).ok_or_else(|| {
            MlError::tokenizer(format!("eos token '{token}' is not in the vocabulary"))
        })?;
        return Ok((token, id));
    }

    let config_id = match model_config.get("eos_token_id") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::Array(ids)) => ids.first().and_then(Value::as_u64),
        _ => None,
    };
    if let Some(id) = config_id.and_then(|id| u32::try_from(id).ok()) {
        if let Some(token) = tokenizer.id_to_token(id) {
            return Ok((token, id));
        }
    }

    EOS_CANDIDATES
        .iter()
        .find_map(|token| tokenizer.token_to_id(token).map(|id| (token.to_string(), id)))
        .ok_or_else(|| MlError::tokenizer("could not determine the end-of-sequence token"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) const VOCAB: &[&str] = &[
        "<unk>",
        "</s>",
        "###",
        "Instruction",
        ":",
        "Response",
        "2",
        "+",
        "?",
        "4",
    ];

    /// Write a whitespace word-level tokenizer with `</s>` as EOS into `dir`.
    pub(crate) fn write_word_tokenizer(dir: &Path) {
        let vocab: Map<String, Value> = VOCAB
            .iter()
            .enumerate()
            .map(|(i, t)| (t.to_string(), json!(i)))
            .collect();
        let tokenizer = json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                {"id": 0, "content": "<unk>", "single_word": false, "lstrip": false,
                 "rstrip": false, "normalized": false, "special": true},
                {"id": 1, "content": "</s>", "single_word": false, "lstrip": false,
                 "rstrip": false, "normalized": false, "special": true}
            ],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
        });
        std::fs::write(dir.join(TOKENIZER_FILE), tokenizer.to_string()).unwrap();
        std::fs::write(
            dir.join(TOKENIZER_CONFIG_FILE),
            json!({"eos_token": "</s>", "padding_side": "right"}).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn test_load_resolves_eos_from_config() {
        let dir = tempfile::tempdir().unwrap();
        write_word_tokenizer(dir.path());
        let bundle = TokenizerBundle::load(dir.path()).unwrap();
        assert_eq!(bundle.eos_token(), "</s>");
        assert_eq!(bundle.pad_token_id(), 1);
        assert_eq!(bundle.vocab_size(), VOCAB.len());
    }

    #[test]
    fn test_eos_falls_back_to_model_config() {
        let dir = tempfile::tempdir().unwrap();
        write_word_tokenizer(dir.path());
        std::fs::remove_file(dir.path().join(TOKENIZER_CONFIG_FILE)).unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            json!({"eos_token_id": [1, 0]}).to_string(),
        )
        .unwrap();

        let bundle = TokenizerBundle::load(dir.path()).unwrap();
        assert_eq!(bundle.eos_token(), "</s>");
    }

    #[test]
    fn test_missing_tokenizer_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TokenizerBundle::load(dir.path()).unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }

    #[test]
    fn test_encode_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        write_word_tokenizer(dir.path());
        let bundle = TokenizerBundle::load(dir.path()).unwrap();
        assert!(bundle.encode_fixed(&["2 + 2".to_string()]).is_err());
    }

    #[test]
    fn test_encode_pads_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        write_word_tokenizer(dir.path());
        let mut bundle = TokenizerBundle::load(dir.path()).unwrap();
        bundle.configure_fixed_length(8).unwrap();

        let short = "### Instruction:\n2+2?\n\n### Response:\n4".to_string();
        let long = "2 + ".repeat(20);
        let encoded = bundle.encode_fixed(&[short, long]).unwrap();

        assert_eq!(encoded[0].len(), 8);
        assert_eq!(encoded[1].len(), 8);
        // Both inputs exceed eight tokens, so neither carries padding.
        assert!(encoded[0].attention_mask.iter().all(|&m| m == 1));
        assert!(encoded[1].attention_mask.iter().all(|&m| m == 1));

        let padded = bundle.encode_fixed(&["4".to_string()]).unwrap();
        assert_eq!(padded[0].input_ids[0], 9);
        assert!(padded[0].input_ids[1..].iter().all(|&id| id == 1));
        assert_eq!(padded[0].attention_mask.iter().sum::<u32>(), 1);
    }

    #[test]
    fn test_save_records_pad_token() {
        let src = tempfile::tempdir().unwrap();
        write_word_tokenizer(src.path());
        let mut bundle = TokenizerBundle::load(src.path()).unwrap();
        bundle.configure_fixed_length(16).unwrap();

        let out = tempfile::tempdir().unwrap();
        bundle.save(out.path()).unwrap();

        let config: Value =
            serde_json::from_str(&std::fs::read_to_string(out.path().join(TOKENIZER_CONFIG_FILE)).unwrap())
                .unwrap();
        assert_eq!(config["pad_token"], "</s>");

        let reloaded = TokenizerBundle::load(out.path()).unwrap();
        assert_eq!(reloaded.eos_token(), "</s>");
        assert!(reloaded.max_length().is_none());
    }
}
