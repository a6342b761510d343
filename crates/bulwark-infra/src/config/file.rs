//! `bulwark.toml` loading.
//!
//! A missing file is normal (first run) and yields defaults. An unreadable
//! or malformed file is logged and also yields defaults so a bad edit never
//! keeps the CLI from starting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bulwark_core::config::ConfigSource;
use bulwark_types::error::RegistryError;
use bulwark_types::llm::{ProviderConfig, ProviderKind};

use super::env::EnvConfigSource;
use super::{BulwarkConfig, ConfigError, ProviderEntry};

/// File name looked up inside the config directory.
pub const CONFIG_FILE_NAME: &str = "bulwark.toml";

/// `~/.bulwark/bulwark.toml`, or `None` when no home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".bulwark").join(CONFIG_FILE_NAME))
}

/// Parse TOML content into a [`BulwarkConfig`].
pub fn parse_config(content: &str) -> Result<BulwarkConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Load the config file at `path`, falling back to defaults on any problem.
pub async fn load_config(path: &Path) -> BulwarkConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match parse_config(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed config file, using defaults");
                BulwarkConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            BulwarkConfig::default()
        }
        Err(e) => {
            let err = ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            };
            tracing::warn!(error = %err, "using defaults");
            BulwarkConfig::default()
        }
    }
}

/// Provider configs from `[[providers]]` entries with env overrides on top.
///
/// Kinds without a file entry resolve from the environment alone.
#[derive(Clone)]
pub struct FileConfigSource {
    config: BulwarkConfig,
    env: EnvConfigSource,
}

impl FileConfigSource {
    pub fn new(config: BulwarkConfig, env: EnvConfigSource) -> Self {
        Self { config, env }
    }

    pub fn config(&self) -> &BulwarkConfig {
        &self.config
    }

    /// Every configured provider as `(registry name, config)`, in file order.
    pub fn providers(&self) -> Result<Vec<(String, ProviderConfig)>, ConfigError> {
        self.config
            .providers
            .iter()
            .map(|entry| {
                let config = self.resolve_entry(entry)?;
                let name = entry
                    .name
                    .clone()
                    .unwrap_or_else(|| config.kind.to_string());
                Ok((name, config))
            })
            .collect()
    }

    fn resolve_entry(&self, entry: &ProviderEntry) -> Result<ProviderConfig, ConfigError> {
        let kind: ProviderKind = entry.kind.parse().map_err(|_| ConfigError::InvalidValue {
            key: "providers.kind".to_string(),
            value: entry.kind.clone(),
        })?;

        let mut config = EnvConfigSource::defaults(&kind)
            .unwrap_or_else(|| ProviderConfig::new(kind.clone(), "", ""));
        if let Some(endpoint) = &entry.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(model) = &entry.model {
            config.model = model.clone();
        }
        if let Some(var) = &entry.api_key_env {
            config.api_key = self.env.var(var);
            if config.api_key.is_none() {
                tracing::warn!(kind = %kind, var = %var, "api_key_env is set but the variable is empty");
            }
        }
        if let Some(sampling) = &entry.sampling {
            config.sampling = sampling.clone();
        }
        if let Some(secs) = entry.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(retries) = entry.max_retries {
            config.max_retries = retries;
        }

        self.env.apply_overrides(config)
    }
}

impl ConfigSource for FileConfigSource {
    fn provider_config(&self, kind: &ProviderKind) -> Result<ProviderConfig, RegistryError> {
        let entry = self.config.providers.iter().find(|entry| {
            entry
                .kind
                .parse::<ProviderKind>()
                .is_ok_and(|parsed| &parsed == kind)
        });
        match entry {
            Some(entry) => Ok(self.resolve_entry(entry)?),
            None => Ok(self.env.resolve(kind)?),
        }
    }
}
