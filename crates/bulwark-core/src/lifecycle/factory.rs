//! Provider registry: a kind -> constructor table plus the live instances.
//!
//! The factory is an ordinary value. Callers construct one, register the
//! adapter kinds they support and share it behind an `Arc`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bulwark_types::error::RegistryError;
use bulwark_types::health::{HealthCheckResult, HealthStatusChange};
use bulwark_types::lifecycle::{FactoryStatus, LifecycleState};
use bulwark_types::llm::{LlmError, ProviderConfig, ProviderKind};
use bulwark_types::resilience::ResilienceConfig;

use super::instance::{InstanceSettings, ProviderInstance};
use crate::audit::AuditSink;
use crate::config::ConfigSource;
use crate::health::monitor::HealthMonitor;
use crate::llm::box_provider::BoxProviderAdapter;

/// Builds an adapter for one provider kind from its config.
pub type AdapterConstructor =
    Arc<dyn Fn(&ProviderConfig) -> Result<BoxProviderAdapter, LlmError> + Send + Sync>;

/// Registry of managed provider instances.
pub struct ProviderFactory {
    instances: DashMap<String, Arc<ProviderInstance>>,
    constructors: DashMap<ProviderKind, AdapterConstructor>,
    monitor: Arc<HealthMonitor>,
    resilience: ResilienceConfig,
    config_source: Arc<dyn ConfigSource>,
    audit_sink: Arc<dyn AuditSink>,
    sync: Mutex<Option<SyncTask>>,
}

struct SyncTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProviderFactory {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        resilience: ResilienceConfig,
        config_source: Arc<dyn ConfigSource>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            instances: DashMap::new(),
            constructors: DashMap::new(),
            monitor,
            resilience,
            config_source,
            audit_sink,
            sync: Mutex::new(None),
        }
    }

    pub fn resilience(&self) -> &ResilienceConfig {
        &self.resilience
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Register (or replace) the constructor for a provider kind.
    pub fn register_provider_type<F>(&self, kind: ProviderKind, constructor: F)
    where
        F: Fn(&ProviderConfig) -> Result<BoxProviderAdapter, LlmError> + Send + Sync + 'static,
    {
        info!(kind = %kind, "registered provider type");
        self.constructors.insert(kind, Arc::new(constructor));
    }

    pub fn registered_kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self
            .constructors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        kinds.sort();
        kinds
    }

    /// Construct, register, initialize and activate a provider.
    ///
    /// `name` defaults to the kind string. A taken name fails before anything
    /// is built. If initialization or activation fails the entry is removed
    /// again and the adapter closed.
    pub async fn create_provider(
        &self,
        config: ProviderConfig,
        name: Option<&str>,
    ) -> Result<Arc<ProviderInstance>, RegistryError> {
        let name = name.map_or_else(|| config.kind.to_string(), str::to_string);
        if self.instances.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        let constructor = self
            .constructors
            .get(&config.kind)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::UnsupportedKind(config.kind.to_string()))?;
        let adapter = constructor(&config)?;
        if adapter.kind() != &config.kind {
            let actual = adapter.kind().to_string();
            adapter.close().await;
            return Err(RegistryError::ContractViolation {
                expected: config.kind.to_string(),
                actual,
            });
        }

        let instance = Arc::new(ProviderInstance::new(
            name.clone(),
            config,
            adapter,
            self.instance_settings(),
            Arc::clone(&self.monitor),
            Arc::clone(&self.audit_sink),
        ));

        let inserted = match self.instances.entry(name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&instance));
                true
            }
        };
        if !inserted {
            instance.adapter().close().await;
            return Err(RegistryError::DuplicateName(name));
        }

        if let Err(e) = instance.initialize() {
            self.instances.remove(&name);
            instance.shutdown().await;
            return Err(e);
        }
        match instance.activate().await {
            Ok(state) => {
                info!(provider = %name, kind = %instance.config().kind, %state, "provider created");
                Ok(instance)
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "provider activation failed");
                self.instances.remove(&name);
                instance.shutdown().await;
                Err(e)
            }
        }
    }

    /// Create a provider using settings from the config source.
    pub async fn create_from_environment(
        &self,
        kind: ProviderKind,
        name: Option<&str>,
    ) -> Result<Arc<ProviderInstance>, RegistryError> {
        let config = self.config_source.provider_config(&kind)?;
        self.create_provider(config, name).await
    }

    /// Return the instance named after `kind`, creating it if absent.
    pub async fn get_or_create(
        &self,
        kind: ProviderKind,
    ) -> Result<Arc<ProviderInstance>, RegistryError> {
        if let Some(instance) = self.get_provider(kind.as_str()) {
            return Ok(instance);
        }
        match self.create_from_environment(kind, None).await {
            // Lost a creation race; the winner is registered now.
            Err(RegistryError::DuplicateName(name)) => self
                .get_provider(&name)
                .ok_or(RegistryError::DuplicateName(name)),
            other => other,
        }
    }

    pub fn get_provider(&self, name: &str) -> Option<Arc<ProviderInstance>> {
        self.instances
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All registered instances, sorted by name.
    pub fn list_providers(&self) -> Vec<Arc<ProviderInstance>> {
        let mut instances: Vec<Arc<ProviderInstance>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        instances.sort_by(|a, b| a.name().cmp(b.name()));
        instances
    }

    pub fn get_active_providers(&self) -> Vec<Arc<ProviderInstance>> {
        self.providers_in(&[LifecycleState::Active])
    }

    /// Instances that are Active or Degraded.
    pub fn get_healthy_providers(&self) -> Vec<Arc<ProviderInstance>> {
        self.providers_in(&[LifecycleState::Active, LifecycleState::Degraded])
    }

    fn providers_in(&self, states: &[LifecycleState]) -> Vec<Arc<ProviderInstance>> {
        self.list_providers()
            .into_iter()
            .filter(|instance| states.contains(&instance.state()))
            .collect()
    }

    /// Remove a provider from the registry and shut it down.
    pub async fn shutdown_provider(&self, name: &str) -> Result<(), RegistryError> {
        let (_, instance) = self
            .instances
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        instance.shutdown().await;
        Ok(())
    }

    /// Shut down every provider and stop health monitoring.
    /// Start background health checks and keep instance lifecycle states
    /// in step with the monitor's status changes.
    pub async fn start_monitoring(self: &Arc<Self>) {
        {
            let mut sync = self.sync.lock().await;
            if sync.is_none() {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(sync_lifecycle(
                    Arc::downgrade(self),
                    self.monitor.subscribe(),
                    cancel.clone(),
                ));
                *sync = Some(SyncTask { cancel, handle });
            }
        }
        self.monitor.start_monitoring().await;
    }

    pub async fn stop_monitoring(&self) {
        self.monitor.stop_monitoring().await;
        let Some(task) = self.sync.lock().await.take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "lifecycle sync task ended abnormally");
        }
    }

    /// Apply each instance's current monitor status to its lifecycle state.
    fn reconcile_health(&self) {
        for entry in self.instances.iter() {
            let instance = entry.value();
            let Some(metrics) = self.monitor.get_provider_health(instance.name()) else {
                continue;
            };
            if metrics.total_checks > 0 {
                instance.apply_health_status(metrics.status);
            }
        }
    }

    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self
            .instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Some((_, instance)) = self.instances.remove(&name) {
                instance.shutdown().await;
            }
        }
        self.stop_monitoring().await;
        info!("all providers shut down");
    }

    pub async fn refresh_provider_health(
        &self,
        name: &str,
    ) -> Result<HealthCheckResult, RegistryError> {
        let instance = self
            .get_provider(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        instance.refresh_health().await
    }

    pub fn get_factory_status(&self) -> FactoryStatus {
        let providers: Vec<_> = self
            .list_providers()
            .iter()
            .map(|instance| instance.summary())
            .collect();
        let mut states = BTreeMap::new();
        for summary in &providers {
            *states.entry(summary.state).or_insert(0) += 1;
        }
        FactoryStatus {
            total_providers: providers.len(),
            states,
            registered_kinds: self
                .registered_kinds()
                .iter()
                .map(ToString::to_string)
                .collect(),
            providers,
            health: self.monitor.get_health_summary(),
        }
    }

    fn instance_settings(&self) -> InstanceSettings {
        InstanceSettings {
            circuit_breaker: self.resilience.circuit_breaker.clone(),
            retry: self.resilience.retry.clone(),
            policy_tag: self.resilience.policy_tag.clone(),
            audit_retention: None,
        }
    }
}

async fn sync_lifecycle(
    factory: Weak<ProviderFactory>,
    mut changes: broadcast::Receiver<HealthStatusChange>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = changes.recv() => received,
        };
        let Some(factory) = factory.upgrade() else {
            break;
        };
        match received {
            Ok(change) => {
                if let Some(instance) = factory.get_provider(&change.provider) {
                    if let Some(state) = instance.apply_health_status(change.current) {
                        debug!(provider = %change.provider, %state, "lifecycle follows health status");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "health status events dropped, reconciling");
                factory.reconcile_health();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use bulwark_types::health::HealthMonitorConfig;

    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::config::StaticConfigSource;
    use crate::test_support::{Script, ScriptedAdapter, scripted_config};

    fn scripted_kind() -> ProviderKind {
        ProviderKind::Custom("scripted".into())
    }

    fn factory() -> ProviderFactory {
        let monitor = Arc::new(HealthMonitor::new(HealthMonitorConfig::default()));
        ProviderFactory::new(
            monitor,
            ResilienceConfig::default(),
            Arc::new(StaticConfigSource::new([scripted_config()])),
            Arc::new(TracingAuditSink),
        )
    }

    /// Registers the scripted kind; returns the shared script and a build counter.
    fn register_scripted(factory: &ProviderFactory) -> (Arc<Script>, Arc<AtomicU32>) {
        let script = Script::new();
        let builds = Arc::new(AtomicU32::new(0));
        let (s, b) = (Arc::clone(&script), Arc::clone(&builds));
        factory.register_provider_type(scripted_kind(), move |_config| {
            b.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedAdapter::boxed("scripted", Arc::clone(&s)))
        });
        (script, builds)
    }

    #[tokio::test]
    async fn test_create_provider_defaults_name_to_kind() {
        let factory = factory();
        register_scripted(&factory);

        let instance = factory.create_provider(scripted_config(), None).await.unwrap();
        assert_eq!(instance.name(), "scripted");
        assert!(instance.state().is_health_derived());
        assert!(factory.get_provider("scripted").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_name_has_no_side_effects() {
        let factory = factory();
        let (_, builds) = register_scripted(&factory);

        let first = factory
            .create_provider(scripted_config(), Some("main"))
            .await
            .unwrap();
        let err = factory
            .create_provider(scripted_config(), Some("main"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateName(name) if name == "main"));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(factory.list_providers().len(), 1);
        assert_eq!(factory.get_provider("main").unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_unregistered_kind_rejected() {
        let factory = factory();
        let err = factory
            .create_provider(scripted_config(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedKind(kind) if kind == "scripted"));
        assert!(factory.list_providers().is_empty());
    }

    #[tokio::test]
    async fn test_constructor_kind_mismatch_is_contract_violation() {
        let factory = factory();
        let script = Script::new();
        factory.register_provider_type(scripted_kind(), move |_config| {
            Ok(BoxProviderAdapter::new(ScriptedAdapter::new(
                "liar",
                ProviderKind::Ollama,
                Arc::clone(&script),
            )))
        });

        let err = factory
            .create_provider(scripted_config(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ContractViolation { ref expected, ref actual }
                if expected == "scripted" && actual == "ollama"
        ));
        assert!(factory.get_provider("scripted").is_none());
    }

    #[tokio::test]
    async fn test_constructor_error_propagates() {
        let factory = factory();
        factory.register_provider_type(scripted_kind(), |_config| {
            Err(LlmError::InvalidRequest("missing endpoint".into()))
        });
        let err = factory
            .create_provider(scripted_config(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Provider(LlmError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_create_from_environment_and_get_or_create() {
        let factory = factory();
        let (_, builds) = register_scripted(&factory);

        let a = factory.get_or_create(scripted_kind()).await.unwrap();
        let b = factory.get_or_create(scripted_kind()).await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let err = factory
            .create_from_environment(ProviderKind::Ollama, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }

    #[tokio::test]
    async fn test_active_and_healthy_views() {
        let factory = factory();
        let (script, _) = register_scripted(&factory);

        factory.create_provider(scripted_config(), Some("up")).await.unwrap();
        script.set_probe(false);
        factory.create_provider(scripted_config(), Some("down")).await.unwrap();

        // Default recovery threshold is 2, so one good probe reads as degraded.
        let healthy: Vec<String> = factory
            .get_healthy_providers()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(healthy, vec!["down".to_string(), "up".to_string()]);
        assert!(factory.get_active_providers().is_empty());

        script.set_probe(true);
        factory.refresh_provider_health("up").await.unwrap();
        let active: Vec<String> = factory
            .get_active_providers()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(active, vec!["up".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_provider_and_all() {
        let factory = factory();
        let (script, _) = register_scripted(&factory);
        let a = factory.create_provider(scripted_config(), Some("a")).await.unwrap();
        factory.create_provider(scripted_config(), Some("b")).await.unwrap();
        factory.health_monitor().start_monitoring().await;

        factory.shutdown_provider("a").await.unwrap();
        assert_eq!(a.state(), LifecycleState::Shutdown);
        assert!(factory.get_provider("a").is_none());
        assert!(matches!(
            factory.shutdown_provider("a").await,
            Err(RegistryError::NotFound(_))
        ));

        factory.shutdown_all().await;
        assert!(factory.list_providers().is_empty());
        assert!(!factory.health_monitor().is_monitoring());
        assert!(script.is_closed());
    }

    #[tokio::test]
    async fn test_factory_status_report() {
        let factory = factory();
        register_scripted(&factory);
        factory.create_provider(scripted_config(), Some("a")).await.unwrap();
        factory.create_provider(scripted_config(), Some("b")).await.unwrap();

        let status = factory.get_factory_status();
        assert_eq!(status.total_providers, 2);
        assert_eq!(status.states.get(&LifecycleState::Degraded), Some(&2));
        assert_eq!(status.registered_kinds, vec!["scripted".to_string()]);
        assert_eq!(status.providers[0].name, "a");
        assert_eq!(status.health.total_providers, 2);
    }

    #[tokio::test]
    async fn test_refresh_unknown_provider_not_found() {
        let factory = factory();
        let err = factory.refresh_provider_health("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_status_changes_drive_lifecycle() {
        let monitor = Arc::new(HealthMonitor::new(HealthMonitorConfig {
            check_interval_ms: 100,
            failure_threshold: 2,
            degraded_threshold: 0.5,
            recovery_threshold: 1,
            ..HealthMonitorConfig::default()
        }));
        let factory = Arc::new(ProviderFactory::new(
            monitor,
            ResilienceConfig::default(),
            Arc::new(StaticConfigSource::new([scripted_config()])),
            Arc::new(TracingAuditSink),
        ));
        let (script, _) = register_scripted(&factory);
        let instance = factory.create_provider(scripted_config(), None).await.unwrap();
        assert_eq!(instance.state(), LifecycleState::Active);

        script.set_probe(false);
        factory.start_monitoring().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(instance.state(), LifecycleState::Unhealthy);

        script.set_probe(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(instance.state(), LifecycleState::Active);

        factory.stop_monitoring().await;
        assert!(!factory.health_monitor().is_monitoring());
    }
}
