//! Shared state for CLI commands: the provider registry built from config.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use bulwark_core::audit::TracingAuditSink;
use bulwark_core::fallback::FallbackCoordinator;
use bulwark_core::health::monitor::HealthMonitor;
use bulwark_core::lifecycle::factory::ProviderFactory;
use bulwark_core::lifecycle::instance::ProviderInstance;
use bulwark_infra::config::env::EnvConfigSource;
use bulwark_infra::config::file::{
    CONFIG_FILE_NAME, FileConfigSource, default_config_path, load_config,
};
use bulwark_infra::llm::register_builtin_adapters;
use bulwark_types::llm::ProviderKind;
use bulwark_types::resilience::FallbackStrategy;

/// Registry, fallback coordinator and the providers that failed to start.
pub struct AppState {
    pub config_path: PathBuf,
    pub factory: Arc<ProviderFactory>,
    pub coordinator: FallbackCoordinator,
    /// Provider names in config order.
    pub provider_order: Vec<String>,
    /// `(name, error)` for providers that could not be created.
    pub failed: Vec<(String, String)>,
}

impl AppState {
    /// Load config and create every configured provider.
    ///
    /// Without `[[providers]]` entries a single Ollama provider is created
    /// from environment defaults. A provider that fails to start is
    /// recorded in `failed` rather than aborting.
    pub async fn init(config_path: Option<PathBuf>, check_interval: Option<Duration>) -> Result<Self> {
        let config_path = config_path
            .or_else(default_config_path)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        let mut config = load_config(&config_path).await;
        if let Some(interval) = check_interval {
            config.resilience.health.check_interval_ms = interval.as_millis() as u64;
        }

        let source = FileConfigSource::new(config.clone(), EnvConfigSource::new());
        let entries = source
            .providers()
            .with_context(|| format!("invalid provider entry in {}", config_path.display()))?;

        let monitor = Arc::new(HealthMonitor::new(config.resilience.health.clone()));
        let factory = Arc::new(ProviderFactory::new(
            monitor,
            config.resilience.clone(),
            Arc::new(source),
            Arc::new(TracingAuditSink),
        ));
        register_builtin_adapters(&factory);

        let mut provider_order = Vec::new();
        let mut failed = Vec::new();

        if entries.is_empty() {
            let name = ProviderKind::Ollama.to_string();
            match factory.create_from_environment(ProviderKind::Ollama, None).await {
                Ok(_) => provider_order.push(name),
                Err(e) => failed.push((name, e.to_string())),
            }
        } else {
            for (name, provider_config) in entries {
                match factory.create_provider(provider_config, Some(&name)).await {
                    Ok(_) => provider_order.push(name),
                    Err(e) => {
                        tracing::warn!(provider = %name, error = %e, "provider failed to start");
                        failed.push((name, e.to_string()));
                    }
                }
            }
        }

        let mut strategy = config.resilience.fallback.clone();
        if strategy.preference.is_empty() {
            strategy = FallbackStrategy::new(provider_order.clone(), strategy.max_fallback_depth);
        }
        let coordinator = FallbackCoordinator::new(Arc::clone(&factory), strategy);

        Ok(Self {
            config_path,
            factory,
            coordinator,
            provider_order,
            failed,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Named provider, or every live provider in config order.
    pub fn select(&self, name: Option<&str>) -> Result<Vec<Arc<ProviderInstance>>> {
        match name {
            Some(name) => {
                let instance = self
                    .factory
                    .get_provider(name)
                    .with_context(|| self.not_found_message(name))?;
                Ok(vec![instance])
            }
            None => Ok(self
                .provider_order
                .iter()
                .filter_map(|name| self.factory.get_provider(name))
                .collect()),
        }
    }

    /// Provider name to use when the user names none.
    pub fn default_provider(&self) -> Result<&str> {
        self.provider_order.first().map(String::as_str).with_context(|| {
            format!(
                "no provider started; check {} or the BULWARK_* environment",
                self.config_path.display()
            )
        })
    }

    fn not_found_message(&self, name: &str) -> String {
        match self.failed.iter().find(|(failed, _)| failed == name) {
            Some((_, error)) => format!("provider '{name}' failed to start: {error}"),
            None => format!("provider '{name}' is not configured"),
        }
    }

    /// Shut every provider down and stop background monitoring.
    pub async fn shutdown(&self) {
        self.factory.shutdown_all().await;
    }
}
