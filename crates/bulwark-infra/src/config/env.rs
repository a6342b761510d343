//! Environment-variable configuration source.
//!
//! For a provider kind `K` (uppercased, `-` replaced by `_`) the recognised
//! variables are `BULWARK_K_ENDPOINT`, `BULWARK_K_MODEL`, `BULWARK_K_API_KEY`,
//! `BULWARK_K_TIMEOUT_SECS`, `BULWARK_K_MAX_RETRIES`, `BULWARK_K_TEMPERATURE`,
//! `BULWARK_K_TOP_P` and `BULWARK_K_MAX_TOKENS`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::config::ConfigSource;
use bulwark_types::error::RegistryError;
use bulwark_types::llm::{ProviderConfig, ProviderKind};

use super::ConfigError;
use crate::llm::ollama::OllamaAdapter;
use crate::llm::openai_compat::OPENAI_BASE_URL;

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads provider settings from environment variables.
#[derive(Clone)]
pub struct EnvConfigSource {
    lookup: Lookup,
}

impl EnvConfigSource {
    /// Source backed by the process environment.
    pub fn new() -> Self {
        Self {
            lookup: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Source backed by a fixed map, for tests and embedding.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            lookup: Arc::new(move |key| vars.get(key).cloned()),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    /// Built-in defaults for `kind`, before any overrides.
    pub fn defaults(kind: &ProviderKind) -> Option<ProviderConfig> {
        match kind {
            ProviderKind::Ollama => Some(ProviderConfig::new(
                ProviderKind::Ollama,
                OllamaAdapter::DEFAULT_ENDPOINT,
                "llama3.2",
            )),
            ProviderKind::OpenAiCompatible => Some(ProviderConfig::new(
                ProviderKind::OpenAiCompatible,
                OPENAI_BASE_URL,
                "gpt-4o-mini",
            )),
            ProviderKind::Custom(_) => None,
        }
    }

    /// Apply every `BULWARK_<KIND>_*` variable that is set on top of `config`.
    pub fn apply_overrides(&self, mut config: ProviderConfig) -> Result<ProviderConfig, ConfigError> {
        let prefix = env_prefix(&config.kind);
        let key = |suffix: &str| format!("{prefix}_{suffix}");

        if let Some(endpoint) = self.var(&key("ENDPOINT")) {
            config.endpoint = endpoint;
        }
        if let Some(model) = self.var(&key("MODEL")) {
            config.model = model;
        }
        if let Some(api_key) = self.var(&key("API_KEY")) {
            config.api_key = Some(api_key);
        } else if config.api_key.is_none() && config.kind == ProviderKind::OpenAiCompatible {
            config.api_key = self.var("OPENAI_API_KEY");
        }
        if let Some(secs) = self.parsed::<u64>(&key("TIMEOUT_SECS"))? {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(retries) = self.parsed::<u32>(&key("MAX_RETRIES"))? {
            config.max_retries = retries;
        }
        if let Some(temperature) = self.parsed::<f32>(&key("TEMPERATURE"))? {
            config.sampling.temperature = temperature;
        }
        if let Some(top_p) = self.parsed::<f32>(&key("TOP_P"))? {
            config.sampling.top_p = Some(top_p);
        }
        if let Some(max_tokens) = self.parsed::<u32>(&key("MAX_TOKENS"))? {
            config.sampling.max_tokens = max_tokens;
        }

        if config.endpoint.is_empty() {
            return Err(ConfigError::MissingValue {
                kind: config.kind.to_string(),
                key: key("ENDPOINT"),
            });
        }
        if config.model.is_empty() {
            return Err(ConfigError::MissingValue {
                kind: config.kind.to_string(),
                key: key("MODEL"),
            });
        }
        Ok(config)
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.var(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
        }
    }

    /// Resolve a full config for `kind`: defaults, then env overrides.
    pub fn resolve(&self, kind: &ProviderKind) -> Result<ProviderConfig, ConfigError> {
        let base = Self::defaults(kind)
            .unwrap_or_else(|| ProviderConfig::new(kind.clone(), "", ""));
        self.apply_overrides(base)
    }
}

impl Default for EnvConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for EnvConfigSource {
    fn provider_config(&self, kind: &ProviderKind) -> Result<ProviderConfig, RegistryError> {
        Ok(self.resolve(kind)?)
    }
}

/// `BULWARK_<KIND>` with the kind uppercased and `-` mapped to `_`.
pub fn env_prefix(kind: &ProviderKind) -> String {
    format!("BULWARK_{}", kind.as_str().to_uppercase().replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(vars: &[(&str, &str)]) -> EnvConfigSource {
        EnvConfigSource::from_map(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_without_env() {
        let config = source(&[]).resolve(&ProviderKind::Ollama).unwrap();
        assert_eq!(config.endpoint, "http://localhost:11434");
        assert_eq!(config.model, "llama3.2");
        assert_eq!(config.max_retries, 3);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_env_overrides_every_field() {
        let config = source(&[
            ("BULWARK_OLLAMA_ENDPOINT", "http://gpu-box:11434"),
            ("BULWARK_OLLAMA_MODEL", "qwen2.5"),
            ("BULWARK_OLLAMA_API_KEY", "proxy"),
            ("BULWARK_OLLAMA_TIMEOUT_SECS", "90"),
            ("BULWARK_OLLAMA_MAX_RETRIES", "5"),
            ("BULWARK_OLLAMA_TEMPERATURE", "0.2"),
            ("BULWARK_OLLAMA_TOP_P", "0.9"),
            ("BULWARK_OLLAMA_MAX_TOKENS", "256"),
        ])
        .resolve(&ProviderKind::Ollama)
        .unwrap();

        assert_eq!(config.endpoint, "http://gpu-box:11434");
        assert_eq!(config.model, "qwen2.5");
        assert_eq!(config.api_key.as_deref(), Some("proxy"));
        assert_eq!(config.timeout(), Duration::from_secs(90));
        assert_eq!(config.max_retries, 5);
        assert!((config.sampling.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.sampling.top_p, Some(0.9));
        assert_eq!(config.sampling.max_tokens, 256);
    }

    #[test]
    fn test_openai_key_fallback() {
        let config = source(&[("OPENAI_API_KEY", "sk-env")])
            .resolve(&ProviderKind::OpenAiCompatible)
            .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-env"));

        let config = source(&[
            ("OPENAI_API_KEY", "sk-env"),
            ("BULWARK_OPENAI_COMPATIBLE_API_KEY", "sk-bulwark"),
        ])
        .resolve(&ProviderKind::OpenAiCompatible)
        .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-bulwark"));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = source(&[("BULWARK_OLLAMA_MAX_RETRIES", "lots")])
            .resolve(&ProviderKind::Ollama)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BULWARK_OLLAMA_MAX_RETRIES"));
    }

    #[test]
    fn test_custom_kind_needs_endpoint_and_model() {
        let kind = ProviderKind::Custom("vllm-local".into());
        let err = source(&[]).resolve(&kind).unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue { ref key, .. } if key == "BULWARK_VLLM_LOCAL_ENDPOINT"));

        let config = source(&[
            ("BULWARK_VLLM_LOCAL_ENDPOINT", "http://10.0.0.5:8000/v1"),
            ("BULWARK_VLLM_LOCAL_MODEL", "mixtral"),
        ])
        .resolve(&kind)
        .unwrap();
        assert_eq!(config.kind, kind);
    }

    #[test]
    fn test_config_source_maps_to_registry_error() {
        let err = source(&[("BULWARK_OLLAMA_TIMEOUT_SECS", "-1")])
            .provider_config(&ProviderKind::Ollama)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }
}
