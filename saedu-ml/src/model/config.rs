//! Decoder hyperparameters read from a model's `config.json`.

use crate::error::MlError;
use serde::Deserialize;
use std::path::Path;

pub const MODEL_CONFIG_FILE: &str = "config.json";
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// Supported decoder families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// `llama`, `mistral`, `qwen2`: RMSNorm, sequential residual,
    /// half-split rotary embedding.
    Llama,
    /// `cohere` (Command-R / Aya): bias-free LayerNorm, parallel residual,
    /// interleaved rotary embedding, tied embeddings and a logit scale.
    Cohere,
}

impl Architecture {
    pub fn from_model_type(model_type: &str) -> Result<Self, MlError> {
        match model_type {
            "llama" | "mistral" | "qwen2" => Ok(Self::Llama),
            "cohere" => Ok(Self::Cohere),
            other => Err(MlError::model(format!(
                "unsupported model_type `{other}` (expected llama, mistral, qwen2 or cohere)"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    model_type: String,
    vocab_size: usize,
    hidden_size: usize,
    intermediate_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    num_key_value_heads: Option<usize>,
    head_dim: Option<usize>,
    rms_norm_eps: Option<f64>,
    layer_norm_eps: Option<f64>,
    rope_theta: Option<f64>,
    max_position_embeddings: Option<usize>,
    tie_word_embeddings: Option<bool>,
    logit_scale: Option<f64>,
    attention_bias: Option<bool>,
    use_qk_norm: Option<bool>,
}

/// Resolved decoder configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub model_type: String,
    pub architecture: Architecture,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub norm_eps: f64,
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
    pub tie_word_embeddings: bool,
    pub logit_scale: f64,
    /// Bias on the q/k/v projections.
    pub qkv_bias: bool,
    /// Bias on the output projection.
    pub o_bias: bool,
}

impl ModelConfig {
    pub fn from_json(value: serde_json::Value) -> Result<Self, MlError> {
        let raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| MlError::model(format!("invalid {MODEL_CONFIG_FILE}: {e}")))?;
        Self::resolve(raw)
    }

    pub fn load(dir: &Path) -> Result<Self, MlError> {
        let path = dir.join(MODEL_CONFIG_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MlError::not_found(format!("{MODEL_CONFIG_FILE} in {}", dir.display()))
            } else {
                MlError::Io(e)
            }
        })?;
        Self::from_json(serde_json::from_str(&text)?)
    }

    fn resolve(raw: RawConfig) -> Result<Self, MlError> {
        let architecture = Architecture::from_model_type(&raw.model_type)?;
        if raw.use_qk_norm == Some(true) {
            return Err(MlError::model("cohere models with use_qk_norm are not supported"));
        }
        if raw.num_attention_heads == 0 {
            return Err(MlError::model("num_attention_heads must be > 0"));
        }
        let num_key_value_heads = raw.num_key_value_heads.unwrap_or(raw.num_attention_heads);
        if num_key_value_heads == 0 || raw.num_attention_heads % num_key_value_heads != 0 {
            return Err(MlError::model(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({num_key_value_heads})",
                raw.num_attention_heads
            )));
        }
        let head_dim = raw
            .head_dim
            .unwrap_or(raw.hidden_size / raw.num_attention_heads);
        if head_dim % 2 != 0 {
            return Err(MlError::model(format!("head_dim must be even, got {head_dim}")));
        }

        let (norm_eps, tie_default, qkv_bias, o_bias) = match architecture {
            Architecture::Llama => {
                let bias = raw.attention_bias.unwrap_or(false);
                // qwen2 always carries q/k/v bias and never an output bias
                let qkv = bias || raw.model_type == "qwen2";
                let o = bias && raw.model_type != "qwen2";
                (raw.rms_norm_eps.unwrap_or(1e-6), false, qkv, o)
            }
            Architecture::Cohere => {
                let bias = raw.attention_bias.unwrap_or(false);
                (raw.layer_norm_eps.unwrap_or(1e-5), true, bias, bias)
            }
        };

        Ok(Self {
            architecture,
            vocab_size: raw.vocab_size,
            hidden_size: raw.hidden_size,
            intermediate_size: raw.intermediate_size,
            num_hidden_layers: raw.num_hidden_layers,
            num_attention_heads: raw.num_attention_heads,
            num_key_value_heads,
            head_dim,
            norm_eps,
            rope_theta: raw.rope_theta.unwrap_or(10_000.0),
            max_position_embeddings: raw.max_position_embeddings.unwrap_or(4096),
            tie_word_embeddings: raw.tie_word_embeddings.unwrap_or(tie_default),
            logit_scale: raw.logit_scale.unwrap_or(1.0),
            qkv_bias,
            o_bias,
            model_type: raw.model_type,
        })
    }

    /// Query heads sharing one key/value head.
    pub fn kv_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Output width of a named attention projection.
    pub fn projection_dims(&self, module: &str) -> Option<(usize, usize)> {
        let q = self.num_attention_heads * self.head_dim;
        let kv = self.num_key_value_heads * self.head_dim;
        match module {
            "q_proj" => Some((self.hidden_size, q)),
            "k_proj" | "v_proj" => Some((self.hidden_size, kv)),
            "o_proj" => Some((q, self.hidden_size)),
            "gate_proj" | "up_proj" => Some((self.hidden_size, self.intermediate_size)),
            "down_proj" => Some((self.intermediate_size, self.hidden_size)),
            _ => None,
        }
    }
}
