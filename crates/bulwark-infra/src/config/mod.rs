//! Configuration loading for Bulwark.
//!
//! Two [`ConfigSource`](bulwark_core::config::ConfigSource) implementations:
//! - [`env::EnvConfigSource`]: per-kind defaults overridden by `BULWARK_*` env vars
//! - [`file::FileConfigSource`]: `bulwark.toml` provider entries, env vars on top
//!
//! The TOML file also carries the resilience settings (breaker, retry,
//! health monitor, fallback) shared by every provider.

pub mod env;
pub mod file;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bulwark_types::error::RegistryError;
use bulwark_types::llm::SamplingParams;
use bulwark_types::resilience::ResilienceConfig;

/// Errors while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("missing {key} for provider kind '{kind}'")]
    MissingValue { kind: String, key: String },
}

impl From<ConfigError> for RegistryError {
    fn from(err: ConfigError) -> Self {
        RegistryError::Config(err.to_string())
    }
}

/// Top-level `bulwark.toml` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    #[serde(flatten)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

/// One `[[providers]]` entry. Unset fields fall back to per-kind defaults.
///
/// API keys are never stored in the file; `api_key_env` names the
/// environment variable that holds the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Registry name; defaults to the kind string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}
