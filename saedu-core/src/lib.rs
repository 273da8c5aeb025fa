//! # saedu-core: shared configuration, errors and persistence
//!
//! Foundation crate for the `saedu-download` and `saedu-finetune` tools.
//! Holds the layered configuration records with their command-line defaults,
//! the configuration error type and atomic file-write helpers.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{
    DevicePreference, DownloadSettings, FineTuneSettings, HubConfig, LoraSettings, Precision,
    Quantization, RuntimeConfig, SaeduConfig, TrainerSettings, load_config,
};
pub use error::ConfigError;
