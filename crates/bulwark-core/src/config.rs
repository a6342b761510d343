//! Configuration port for provider connection settings.
//!
//! The factory asks a `ConfigSource` for a provider's settings when it
//! creates an instance "from the environment". Concrete sources (env vars,
//! TOML file) live in bulwark-infra.

use std::collections::HashMap;

use bulwark_types::error::RegistryError;
use bulwark_types::llm::{ProviderConfig, ProviderKind};

/// Supplies a [`ProviderConfig`] for a provider kind.
pub trait ConfigSource: Send + Sync {
    fn provider_config(&self, kind: &ProviderKind) -> Result<ProviderConfig, RegistryError>;
}

/// Fixed set of configs, keyed by kind.
#[derive(Debug, Default, Clone)]
pub struct StaticConfigSource {
    configs: HashMap<ProviderKind, ProviderConfig>,
}

impl StaticConfigSource {
    pub fn new(configs: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|config| (config.kind.clone(), config))
                .collect(),
        }
    }
}

impl ConfigSource for StaticConfigSource {
    fn provider_config(&self, kind: &ProviderKind) -> Result<ProviderConfig, RegistryError> {
        self.configs
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::Config(format!("no configuration for provider kind '{kind}'")))
    }
}
