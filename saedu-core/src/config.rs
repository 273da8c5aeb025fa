//! Configuration system for the saedu tools.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace
//! config -> explicit config file -> environment. CLI flags are applied on top by
//! the binaries. Defaults mirror the documented command-line defaults, so running
//! either tool without a config file behaves exactly like the bare flags.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Default base model on the hub.
pub const DEFAULT_MODEL: &str = "CohereForAI/aya-23-8B";

/// Top-level configuration for both tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaeduConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub finetune: FineTuneSettings,
    #[serde(default)]
    pub lora: LoraSettings,
    #[serde(default)]
    pub trainer: TrainerSettings,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Model hub access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Hub endpoint; `None` uses the client default (huggingface.co).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Access token for gated or private repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Download cache directory; `None` uses the shared hub cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Repository revision (branch, tag or commit).
    pub revision: String,
    /// Show per-file download progress bars.
    pub progress: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            cache_dir: None,
            revision: "main".to_string(),
            progress: true,
        }
    }
}

/// Weight precision policy applied when persisting a downloaded model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    /// Full precision, stored as 16-bit floats.
    #[default]
    None,
    /// 8-bit weights with per-row scales (~50% of F16 size).
    Int8,
    /// 4-bit weights with per-block scales (~25% of F16 size).
    Int4,
}

impl Quantization {
    pub fn bits(self) -> u8 {
        match self {
            Quantization::None => 16,
            Quantization::Int8 => 8,
            Quantization::Int4 => 4,
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantization::None => write!(f, "none"),
            Quantization::Int8 => write!(f, "int8"),
            Quantization::Int4 => write!(f, "int4"),
        }
    }
}

impl FromStr for Quantization {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Quantization::None),
            "int8" => Ok(Quantization::Int8),
            "int4" => Ok(Quantization::Int4),
            _ => Err(ConfigError::UnknownVariant {
                kind: "quantization",
                value: s.to_string(),
                expected: "none, int8, int4",
            }),
        }
    }
}

/// Floating point type used for frozen base weights during fine-tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F16,
    Bf16,
    F32,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::F16 => write!(f, "f16"),
            Precision::Bf16 => write!(f, "bf16"),
            Precision::F32 => write!(f, "f32"),
        }
    }
}

impl FromStr for Precision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f16" | "fp16" | "float16" => Ok(Precision::F16),
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "f32" | "fp32" | "float32" => Ok(Precision::F32),
            _ => Err(ConfigError::UnknownVariant {
                kind: "precision",
                value: s.to_string(),
                expected: "f16, bf16, f32",
            }),
        }
    }
}

/// Compute device selection. `Auto` defers to whatever accelerator was compiled in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Auto => write!(f, "auto"),
            DevicePreference::Cpu => write!(f, "cpu"),
            DevicePreference::Cuda => write!(f, "cuda"),
            DevicePreference::Metal => write!(f, "metal"),
        }
    }
}

impl FromStr for DevicePreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(ConfigError::UnknownVariant {
                kind: "device",
                value: s.to_string(),
                expected: "auto, cpu, cuda, metal",
            }),
        }
    }
}

/// Settings for the model acquisition tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub model: String,
    pub output: PathBuf,
    pub quantization: Quantization,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            output: PathBuf::from("./models/base/aya-23-8b"),
            quantization: Quantization::None,
        }
    }
}

/// Settings for the fine-tuning tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneSettings {
    /// Base model: hub identifier or local artifact directory.
    pub model_name: String,
    /// JSON-lines dataset with `instruction`/`response` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Language tag used in the output artifact name (en, zu, xh, af, ...).
    pub language: String,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub max_length: usize,
    /// Fraction of examples held out for evaluation.
    pub validation_fraction: f64,
    pub seed: u64,
    pub precision: Precision,
    /// Reject records missing `instruction` or `response` instead of
    /// substituting empty strings.
    pub strict_records: bool,
    /// Also write a full model with the adapter folded into the base weights.
    pub merge_weights: bool,
}

impl Default for FineTuneSettings {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL.to_string(),
            dataset_path: None,
            output_dir: PathBuf::from("./models/fine-tuned"),
            language: "en".to_string(),
            num_epochs: 3,
            batch_size: 4,
            learning_rate: 2e-4,
            max_length: 2048,
            validation_fraction: 0.1,
            seed: 42,
            precision: Precision::F16,
            strict_records: false,
            merge_weights: false,
        }
    }
}

impl FineTuneSettings {
    /// Check value ranges. Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_epochs == 0 {
            return Err(ConfigError::invalid("num_epochs", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        // next-token targets need at least one position after the first
        if self.max_length < 2 {
            return Err(ConfigError::invalid(
                "max_length",
                format!("must be at least 2, got {}", self.max_length),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid(
                "learning_rate",
                format!("must be a positive number, got {}", self.learning_rate),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(ConfigError::invalid(
                "validation_fraction",
                format!("must be in [0, 1), got {}", self.validation_fraction),
            ));
        }
        if self.language.trim().is_empty() {
            return Err(ConfigError::invalid("language", "must not be empty"));
        }
        Ok(())
    }
}

/// Low-rank adaptation hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSettings {
    pub r: usize,
    pub alpha: f64,
    pub dropout: f64,
    pub target_modules: Vec<String>,
    /// Bias policy; only "none" is supported.
    pub bias: String,
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: 16,
            alpha: 32.0,
            dropout: 0.05,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            bias: "none".to_string(),
        }
    }
}

impl LoraSettings {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.r == 0 {
            return Err(ConfigError::invalid("lora.r", "rank must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::invalid(
                "lora.dropout",
                format!("must be in [0, 1), got {}", self.dropout),
            ));
        }
        if self.target_modules.is_empty() {
            return Err(ConfigError::invalid(
                "lora.target_modules",
                "at least one module is required",
            ));
        }
        if self.bias != "none" {
            return Err(ConfigError::invalid(
                "lora.bias",
                format!("only \"none\" is supported, got \"{}\"", self.bias),
            ));
        }
        Ok(())
    }
}

/// Training loop schedule and optimizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSettings {
    pub gradient_accumulation_steps: usize,
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: usize,
    pub load_best_model_at_end: bool,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            gradient_accumulation_steps: 4,
            logging_steps: 10,
            eval_steps: 100,
            save_steps: 500,
            save_total_limit: 3,
            load_best_model_at_end: true,
            warmup_steps: 100,
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
        }
    }
}

impl TrainerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("trainer.gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("trainer.logging_steps", self.logging_steps),
            ("trainer.eval_steps", self.eval_steps),
            ("trainer.save_steps", self.save_steps),
            ("trainer.save_total_limit", self.save_total_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        if self.max_grad_norm < 0.0 {
            return Err(ConfigError::invalid(
                "trainer.max_grad_norm",
                "must not be negative",
            ));
        }
        Ok(())
    }
}

/// Process-level runtime settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub device: DevicePreference,
    /// Directory for JSON log files; each tool picks a default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `SAEDU_`, `__` for nesting)
/// 2. Explicit config file (`--config`)
/// 3. Workspace-local config (`.saedu/config.toml`)
/// 4. User config (`~/.config/saedu/config.toml`)
/// 5. Built-in defaults
///
/// When no hub token is configured, `HF_TOKEN` is used.
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<SaeduConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(SaeduConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("za", "saedu", "saedu") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".saedu").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::invalid(
                "config",
                format!("file not found: {}", path.display()),
            ));
        }
        figment = figment.merge(Toml::file(path));
    }

    // SAEDU_FINETUNE__NUM_EPOCHS, SAEDU_HUB__TOKEN, ...
    figment = figment.merge(Env::prefixed("SAEDU_").split("__"));

    let mut config: SaeduConfig = figment.extract().map_err(Box::new)?;

    if config.hub.token.is_none() {
        config.hub.token = ["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .find(|token| !token.trim().is_empty());
    }

    tracing::debug!(
        model = %config.download.model,
        base = %config.finetune.model_name,
        "configuration loaded"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_matches_cli_defaults() {
        let config = SaeduConfig::default();
        assert_eq!(config.download.model, "CohereForAI/aya-23-8B");
        assert_eq!(config.download.output, PathBuf::from("./models/base/aya-23-8b"));
        assert_eq!(config.download.quantization, Quantization::None);
        assert_eq!(config.finetune.output_dir, PathBuf::from("./models/fine-tuned"));
        assert_eq!(config.finetune.language, "en");
        assert_eq!(config.finetune.num_epochs, 3);
        assert_eq!(config.finetune.batch_size, 4);
        assert_eq!(config.finetune.learning_rate, 2e-4);
        assert_eq!(config.finetune.max_length, 2048);
        assert!(config.finetune.dataset_path.is_none());
    }

    #[test]
    fn test_lora_and_trainer_defaults() {
        let lora = LoraSettings::default();
        assert_eq!(lora.r, 16);
        assert_eq!(lora.alpha, 32.0);
        assert_eq!(lora.dropout, 0.05);
        assert_eq!(lora.target_modules, vec!["q_proj", "v_proj"]);
        assert_eq!(lora.scaling(), 2.0);

        let trainer = TrainerSettings::default();
        assert_eq!(trainer.gradient_accumulation_steps, 4);
        assert_eq!(trainer.logging_steps, 10);
        assert_eq!(trainer.eval_steps, 100);
        assert_eq!(trainer.save_steps, 500);
        assert_eq!(trainer.save_total_limit, 3);
        assert!(trainer.load_best_model_at_end);
    }

    #[test]
    fn test_quantization_parse_and_display() {
        assert_eq!("int8".parse::<Quantization>().unwrap(), Quantization::Int8);
        assert_eq!("INT4".parse::<Quantization>().unwrap(), Quantization::Int4);
        assert_eq!("none".parse::<Quantization>().unwrap(), Quantization::None);
        assert!("int2".parse::<Quantization>().is_err());
        assert_eq!(Quantization::Int4.to_string(), "int4");
        assert_eq!(Quantization::Int8.bits(), 8);
    }

    #[test]
    fn test_precision_and_device_parse() {
        assert_eq!("fp16".parse::<Precision>().unwrap(), Precision::F16);
        assert_eq!("bf16".parse::<Precision>().unwrap(), Precision::Bf16);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_finetune_validate() {
        let mut settings = FineTuneSettings::default();
        assert!(settings.validate().is_ok());

        settings.max_length = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("max_length"));

        settings.max_length = 1;
        let err = settings.validate().unwrap_err();
        assert!(
            matches!(&err, ConfigError::Invalid { field, .. } if field == "max_length"),
            "{err}"
        );

        settings.max_length = 2;
        assert!(settings.validate().is_ok());

        settings.max_length = 16;
        settings.learning_rate = -1.0;
        assert!(settings.validate().is_err());

        settings.learning_rate = 1e-4;
        settings.validation_fraction = 1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_lora_validate_rejects_bias() {
        let lora = LoraSettings {
            bias: "all".into(),
            ..Default::default()
        };
        assert!(lora.validate().is_err());
        assert!(LoraSettings::default().validate().is_ok());
    }

    #[test]
    fn test_trainer_validate_zero_interval() {
        let trainer = TrainerSettings {
            eval_steps: 0,
            ..Default::default()
        };
        let err = trainer.validate().unwrap_err();
        assert!(err.to_string().contains("eval_steps"));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let saedu_dir = dir.path().join(".saedu");
        std::fs::create_dir_all(&saedu_dir).unwrap();
        std::fs::write(
            saedu_dir.join("config.toml"),
            r#"
[download]
model = "CohereForAI/aya-23-35B"
output = "./models/base/aya-23-35b"
quantization = "int4"

[finetune]
model_name = "./models/base/aya-23-35b"
output_dir = "./out"
language = "zu"
num_epochs = 1
batch_size = 2
learning_rate = 0.0001
max_length = 512
validation_fraction = 0.1
seed = 7
precision = "bf16"
strict_records = true
merge_weights = false
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.download.model, "CohereForAI/aya-23-35B");
        assert_eq!(config.download.quantization, Quantization::Int4);
        assert_eq!(config.finetune.language, "zu");
        assert_eq!(config.finetune.precision, Precision::Bf16);
        assert!(config.finetune.strict_records);
        // Sections absent from the file keep their defaults.
        assert_eq!(config.lora.r, 16);
    }

    #[test]
    fn test_load_config_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config(None, Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("config"));
    }
}
