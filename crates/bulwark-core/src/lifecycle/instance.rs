//! A managed provider: one adapter wrapped with its breaker, retry handler,
//! lifecycle state and audit trail.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use bulwark_types::error::RegistryError;
use bulwark_types::health::{HealthCheckResult, HealthStatus};
use bulwark_types::lifecycle::{AuditOutcome, AuditRecord, InstanceSummary, LifecycleState};
use bulwark_types::llm::{ChatMessage, GenerationResponse, LlmError, ProviderConfig, ResponseAnnotations};
use bulwark_types::resilience::{CircuitBreakerConfig, CircuitState, ErrorMetrics, RetryStrategy};

use crate::audit::AuditSink;
use crate::health::monitor::HealthMonitor;
use crate::llm::box_provider::BoxProviderAdapter;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::ErrorHandler;

/// Audit records kept in memory per instance.
pub const DEFAULT_AUDIT_RETENTION: usize = 1_000;

/// Resilience settings an instance is built with.
#[derive(Debug, Clone, Default)]
pub struct InstanceSettings {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryStrategy,
    pub policy_tag: Option<String>,
    pub audit_retention: Option<usize>,
}

struct InstanceState {
    state: LifecycleState,
    breaker: Option<Arc<CircuitBreaker>>,
    handler: Option<Arc<ErrorHandler>>,
    last_health_check: Option<DateTime<Utc>>,
}

/// A provider adapter under lifecycle management.
///
/// Calls are only accepted in the health-derived states (Active, Degraded,
/// Unhealthy). Each call runs through the instance's [`ErrorHandler`].
pub struct ProviderInstance {
    id: Uuid,
    name: String,
    config: ProviderConfig,
    adapter: Arc<BoxProviderAdapter>,
    settings: InstanceSettings,
    monitor: Arc<HealthMonitor>,
    audit_sink: Arc<dyn AuditSink>,
    inner: Mutex<InstanceState>,
    audit: Mutex<VecDeque<AuditRecord>>,
}

impl ProviderInstance {
    pub fn new(
        name: impl Into<String>,
        config: ProviderConfig,
        adapter: BoxProviderAdapter,
        settings: InstanceSettings,
        monitor: Arc<HealthMonitor>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            config,
            adapter: Arc::new(adapter),
            settings,
            monitor,
            audit_sink,
            inner: Mutex::new(InstanceState {
                state: LifecycleState::Created,
                breaker: None,
                handler: None,
                last_health_check: None,
            }),
            audit: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<BoxProviderAdapter> {
        &self.adapter
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.inner.lock().expect("provider instance lock poisoned")
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.lock().last_health_check
    }

    pub fn breaker(&self) -> Option<Arc<CircuitBreaker>> {
        self.lock().breaker.clone()
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker().map(|breaker| breaker.state())
    }

    /// Retry and breaker counters, once the instance is initialized.
    pub fn error_metrics(&self) -> Option<ErrorMetrics> {
        self.lock()
            .handler
            .as_ref()
            .map(|handler| handler.get_error_metrics())
    }

    /// Created -> Initialized: build the breaker and retry handler and
    /// register with the health monitor.
    pub fn initialize(&self) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.state != LifecycleState::Created {
            return Err(self.invalid(inner.state, "initialize"));
        }

        let breaker = Arc::new(CircuitBreaker::new(
            self.name.clone(),
            self.settings.circuit_breaker.clone(),
        ));
        let retry = RetryStrategy {
            max_retries: self.config.max_retries,
            ..self.settings.retry.clone()
        };
        let handler = Arc::new(ErrorHandler::new(
            Arc::clone(&breaker),
            retry,
            self.config.timeout(),
        ));
        self.monitor.register_provider(
            self.name.clone(),
            Arc::clone(&self.adapter),
            Some(Arc::clone(&breaker)),
        );
        inner.breaker = Some(breaker);
        inner.handler = Some(handler);
        self.transition(&mut inner, LifecycleState::Initialized);
        Ok(())
    }

    /// Initialized -> Active | Degraded | Unhealthy from one forced probe.
    pub async fn activate(&self) -> Result<LifecycleState, RegistryError> {
        {
            let inner = self.lock();
            if inner.state != LifecycleState::Initialized {
                return Err(self.invalid(inner.state, "activate"));
            }
        }

        let result = self.monitor.force_health_check(&self.name).await?;
        let target = state_for_status(self.monitor_status(&result));

        let mut inner = self.lock();
        // A concurrent shutdown or activate may have won the race.
        if inner.state != LifecycleState::Initialized {
            return Err(self.invalid(inner.state, "activate"));
        }
        inner.last_health_check = Some(result.timestamp);
        self.transition(&mut inner, target);
        info!(provider = %self.name, state = %target, "provider activated");
        Ok(target)
    }

    /// Re-probe and move among the health-derived states.
    pub async fn refresh_health(&self) -> Result<HealthCheckResult, RegistryError> {
        {
            let inner = self.lock();
            if !inner.state.is_health_derived() {
                return Err(self.invalid(inner.state, "refresh health of"));
            }
        }

        let result = self.monitor.force_health_check(&self.name).await?;
        let target = state_for_status(self.monitor_status(&result));

        let mut inner = self.lock();
        if inner.state.is_health_derived() {
            inner.last_health_check = Some(result.timestamp);
            if inner.state != target {
                self.transition(&mut inner, target);
            }
        }
        Ok(result)
    }

    /// Move to Shutdown, unregister from monitoring and close the adapter.
    ///
    /// Idempotent; later calls are no-ops.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.lock();
            if inner.state == LifecycleState::Shutdown {
                return;
            }
            self.transition(&mut inner, LifecycleState::Shutdown);
        }
        self.monitor.unregister_provider(&self.name);
        self.adapter.close().await;
        info!(provider = %self.name, "provider shut down");
    }

    /// Derived status after a forced check, falling back to the raw probe.
    fn monitor_status(&self, result: &HealthCheckResult) -> HealthStatus {
        self.monitor
            .get_provider_health(&self.name)
            .map_or(result.status, |metrics| metrics.status)
    }

    pub async fn generate_text(&self, prompt: &str) -> Result<GenerationResponse, LlmError> {
        let response = self
            .execute("generate_text", |adapter| {
                let prompt = prompt.to_string();
                async move { adapter.generate_text(&prompt).await }
            })
            .await?;
        Ok(self.annotate(response))
    }

    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<GenerationResponse, LlmError> {
        let response = self
            .execute("chat_completion", |adapter| {
                let messages = messages.to_vec();
                async move { adapter.chat_completion(&messages).await }
            })
            .await?;
        Ok(self.annotate(response))
    }

    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        self.execute("list_models", |adapter| async move {
            adapter.list_models().await
        })
        .await
    }

    /// Run an arbitrary adapter operation through the retry handler.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, LlmError>
    where
        F: Fn(Arc<BoxProviderAdapter>) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let handler = self.call_handler()?;
        let started = Instant::now();
        let result = handler
            .execute_with_retry(|| operation(Arc::clone(&self.adapter)))
            .await;
        self.after_call(operation_name, &result, started.elapsed(), &handler);
        result
    }

    fn call_handler(&self) -> Result<Arc<ErrorHandler>, LlmError> {
        let inner = self.lock();
        match (&inner.handler, inner.state.is_health_derived()) {
            (Some(handler), true) => Ok(Arc::clone(handler)),
            _ => Err(LlmError::NotActive {
                provider: self.name.clone(),
                state: inner.state.to_string(),
            }),
        }
    }

    fn after_call<T>(
        &self,
        operation: &str,
        result: &Result<T, LlmError>,
        elapsed: Duration,
        handler: &ErrorHandler,
    ) {
        let outcome = match result {
            Ok(_) => AuditOutcome::Success,
            Err(err) => AuditOutcome::Failure {
                error: err.to_string(),
            },
        };
        self.audit(operation, outcome, Some(elapsed.as_millis() as u64));

        let circuit = handler.breaker().state();
        let monitor_healthy = self.monitor_reports(HealthStatus::Healthy);
        let mut inner = self.lock();
        match (circuit, inner.state) {
            (CircuitState::Open, LifecycleState::Active) => {
                debug!(provider = %self.name, "circuit open, marking provider degraded");
                self.transition(&mut inner, LifecycleState::Degraded);
            }
            // Undo a breaker demotion once calls succeed again.
            (CircuitState::Closed, LifecycleState::Degraded)
                if result.is_ok() && monitor_healthy =>
            {
                debug!(provider = %self.name, "circuit closed, marking provider active");
                self.transition(&mut inner, LifecycleState::Active);
            }
            _ => {}
        }
    }

    /// Move among the health-derived states to match a monitor status.
    ///
    /// Returns the new state when a transition happened. An open breaker
    /// caps the state at Degraded.
    pub fn apply_health_status(&self, status: HealthStatus) -> Option<LifecycleState> {
        let circuit = self.circuit_state();
        let mut target = state_for_status(status);
        if target == LifecycleState::Active && circuit == Some(CircuitState::Open) {
            target = LifecycleState::Degraded;
        }

        let mut inner = self.lock();
        if !inner.state.is_health_derived() || inner.state == target {
            return None;
        }
        debug!(provider = %self.name, %status, state = %target, "health status changed");
        self.transition(&mut inner, target);
        Some(target)
    }

    fn monitor_reports(&self, status: HealthStatus) -> bool {
        self.monitor
            .get_provider_health(&self.name)
            .is_some_and(|metrics| metrics.status == status)
    }

    fn annotate(&self, mut response: GenerationResponse) -> GenerationResponse {
        response.provider = self.name.clone();
        response.annotations = ResponseAnnotations {
            instance_id: Some(self.id),
            provider_kind: Some(self.config.kind.clone()),
            policy_tag: self.settings.policy_tag.clone(),
            ..ResponseAnnotations::default()
        };
        response
    }

    /// Apply a transition the caller has already validated, and audit it.
    fn transition(&self, inner: &mut InstanceState, to: LifecycleState) {
        let from = inner.state;
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
        inner.state = to;
        self.audit("transition", AuditOutcome::Transition { from, to }, None);
    }

    fn invalid(&self, state: LifecycleState, operation: &'static str) -> RegistryError {
        RegistryError::InvalidTransition {
            name: self.name.clone(),
            state,
            operation,
        }
    }

    fn audit(&self, operation: &str, outcome: AuditOutcome, latency_ms: Option<u64>) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            provider: self.name.clone(),
            model: self.config.model.clone(),
            outcome,
            latency_ms,
        };
        self.audit_sink.record(&record);

        let retention = self
            .settings
            .audit_retention
            .unwrap_or(DEFAULT_AUDIT_RETENTION);
        let mut trail = self.audit.lock().expect("audit trail lock poisoned");
        trail.push_back(record);
        while trail.len() > retention {
            trail.pop_front();
        }
    }

    /// Audit records, oldest first.
    pub fn audit_trail(&self) -> Vec<AuditRecord> {
        self.audit
            .lock()
            .expect("audit trail lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> InstanceSummary {
        let (state, last_health_check) = {
            let inner = self.lock();
            (inner.state, inner.last_health_check)
        };
        InstanceSummary {
            id: self.id,
            name: self.name.clone(),
            kind: self.config.kind.clone(),
            model: self.config.model.clone(),
            state,
            circuit_state: self.circuit_state(),
            last_health_check,
        }
    }
}

impl std::fmt::Debug for ProviderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.config.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Lifecycle state implied by a derived health status.
pub fn state_for_status(status: HealthStatus) -> LifecycleState {
    match status {
        HealthStatus::Healthy => LifecycleState::Active,
        HealthStatus::Degraded | HealthStatus::Unknown => LifecycleState::Degraded,
        HealthStatus::Unhealthy => LifecycleState::Unhealthy,
    }
}

#[cfg(test)]
mod tests {
    use bulwark_types::health::HealthMonitorConfig;

    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::test_support::{Script, ScriptedAdapter, scripted_config};

    struct Fixture {
        instance: ProviderInstance,
        script: Arc<Script>,
        monitor: Arc<HealthMonitor>,
        sink: Arc<MemoryAuditSink>,
    }

    fn fixture(settings: InstanceSettings) -> Fixture {
        let script = Script::new();
        let monitor = Arc::new(HealthMonitor::new(HealthMonitorConfig {
            recovery_threshold: 1,
            ..HealthMonitorConfig::default()
        }));
        let sink = Arc::new(MemoryAuditSink::new());
        let instance = ProviderInstance::new(
            "primary",
            scripted_config(),
            ScriptedAdapter::boxed("primary", Arc::clone(&script)),
            settings,
            Arc::clone(&monitor),
            sink.clone(),
        );
        Fixture {
            instance,
            script,
            monitor,
            sink,
        }
    }

    fn fast_settings(threshold: u32) -> InstanceSettings {
        InstanceSettings {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: 60_000,
            },
            retry: RetryStrategy {
                jitter: false,
                base_delay_ms: 10,
                ..RetryStrategy::default()
            },
            policy_tag: Some("eu-only".into()),
            audit_retention: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let f = fixture(fast_settings(5));
        assert_eq!(f.instance.state(), LifecycleState::Created);

        f.instance.initialize().unwrap();
        assert_eq!(f.instance.state(), LifecycleState::Initialized);
        assert!(f.monitor.get_provider_health("primary").is_some());

        let state = f.instance.activate().await.unwrap();
        assert_eq!(state, LifecycleState::Active);
        assert!(f.instance.last_health_check().is_some());

        f.instance.shutdown().await;
        assert_eq!(f.instance.state(), LifecycleState::Shutdown);
        assert!(f.script.is_closed());
        assert!(f.monitor.get_provider_health("primary").is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_transitions_rejected() {
        let f = fixture(fast_settings(5));
        let err = f.instance.activate().await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                state: LifecycleState::Created,
                ..
            }
        ));

        f.instance.initialize().unwrap();
        assert!(f.instance.initialize().is_err());
        f.instance.activate().await.unwrap();
        assert!(f.instance.activate().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_first_probe_activates_degraded() {
        let f = fixture(fast_settings(5));
        f.script.set_probe(false);
        f.instance.initialize().unwrap();
        let state = f.instance.activate().await.unwrap();
        // One failed probe: availability 0 but below the failure threshold.
        assert_eq!(state, LifecycleState::Degraded);
    }

    #[tokio::test]
    async fn test_calls_refused_outside_health_states() {
        let f = fixture(fast_settings(5));
        let err = f.instance.generate_text("hi").await.unwrap_err();
        assert!(matches!(err, LlmError::NotActive { ref state, .. } if state == "created"));

        f.instance.initialize().unwrap();
        f.instance.activate().await.unwrap();
        f.instance.shutdown().await;
        let err = f.instance.list_models().await.unwrap_err();
        assert!(matches!(err, LlmError::NotActive { ref state, .. } if state == "shutdown"));
        assert_eq!(f.script.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let f = fixture(fast_settings(5));
        f.instance.shutdown().await;
        f.instance.shutdown().await;
        assert_eq!(f.instance.state(), LifecycleState::Shutdown);
        let transitions = f
            .instance
            .audit_trail()
            .into_iter()
            .filter(|r| r.operation == "transition")
            .count();
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    async fn test_response_is_annotated() {
        let f = fixture(fast_settings(5));
        f.instance.initialize().unwrap();
        f.instance.activate().await.unwrap();

        let response = f.instance.generate_text("hello").await.unwrap();
        assert_eq!(response.content, "reply from primary");
        assert_eq!(response.provider, "primary");
        assert_eq!(response.annotations.instance_id, Some(f.instance.id()));
        assert_eq!(response.annotations.policy_tag.as_deref(), Some("eu-only"));
        assert!(response.annotations.provider_kind.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_degrades_active_instance() {
        let f = fixture(fast_settings(1));
        f.instance.initialize().unwrap();
        f.instance.activate().await.unwrap();
        assert_eq!(f.instance.state(), LifecycleState::Active);

        f.script.push(Err(LlmError::Connection("reset".into())));
        let err = f.instance.generate_text("hi").await.unwrap_err();
        assert!(matches!(err, LlmError::Connection(_)));
        assert_eq!(f.instance.circuit_state(), Some(CircuitState::Open));
        assert_eq!(f.instance.state(), LifecycleState::Degraded);

        // Degraded still accepts calls; the breaker rejects them.
        let err = f.instance.generate_text("hi").await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(f.script.generate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_demotion_recovers_to_active() {
        let mut settings = fast_settings(1);
        settings.circuit_breaker.reset_timeout_ms = 1_000;
        let f = fixture(settings);
        f.instance.initialize().unwrap();
        f.instance.activate().await.unwrap();
        assert_eq!(f.instance.state(), LifecycleState::Active);

        f.script.push(Err(LlmError::Connection("reset".into())));
        f.instance.generate_text("hi").await.unwrap_err();
        assert_eq!(f.instance.state(), LifecycleState::Degraded);

        tokio::time::advance(Duration::from_secs(2)).await;
        f.instance.generate_text("hi").await.unwrap();
        assert_eq!(f.instance.circuit_state(), Some(CircuitState::Closed));
        assert_eq!(f.instance.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_success_does_not_override_degraded_monitor_status() {
        let f = fixture(fast_settings(5));
        f.instance.initialize().unwrap();
        f.script.set_probe(false);
        f.instance.activate().await.unwrap();
        assert_eq!(f.instance.state(), LifecycleState::Degraded);

        f.instance.generate_text("hi").await.unwrap();
        assert_eq!(f.instance.state(), LifecycleState::Degraded);
    }

    #[tokio::test]
    async fn test_apply_health_status() {
        let f = fixture(fast_settings(5));
        assert_eq!(f.instance.apply_health_status(HealthStatus::Healthy), None);

        f.instance.initialize().unwrap();
        f.instance.activate().await.unwrap();
        assert_eq!(
            f.instance.apply_health_status(HealthStatus::Unhealthy),
            Some(LifecycleState::Unhealthy)
        );
        assert_eq!(f.instance.apply_health_status(HealthStatus::Unhealthy), None);
        assert_eq!(
            f.instance.apply_health_status(HealthStatus::Healthy),
            Some(LifecycleState::Active)
        );

        f.instance.shutdown().await;
        assert_eq!(f.instance.apply_health_status(HealthStatus::Degraded), None);
        assert_eq!(f.instance.state(), LifecycleState::Shutdown);
    }

    #[tokio::test]
    async fn test_refresh_health_moves_between_health_states() {
        let f = fixture(fast_settings(5));
        f.instance.initialize().unwrap();
        f.instance.activate().await.unwrap();

        f.script.set_probe(false);
        for _ in 0..3 {
            f.instance.refresh_health().await.unwrap();
        }
        assert_eq!(f.instance.state(), LifecycleState::Unhealthy);

        f.script.set_probe(true);
        f.instance.refresh_health().await.unwrap();
        // Availability 2/5 is below the degraded threshold.
        assert_eq!(f.instance.state(), LifecycleState::Degraded);
    }

    #[tokio::test]
    async fn test_audit_trail_records_operations_and_is_bounded() {
        let mut settings = fast_settings(5);
        settings.audit_retention = Some(3);
        let f = fixture(settings);
        f.instance.initialize().unwrap();
        f.instance.activate().await.unwrap();
        for _ in 0..4 {
            f.instance.generate_text("hi").await.unwrap();
        }

        let trail = f.instance.audit_trail();
        assert_eq!(trail.len(), 3);
        assert!(trail.iter().all(|r| r.operation == "generate_text"));
        assert!(trail.iter().all(|r| r.outcome == AuditOutcome::Success));
        assert!(trail.iter().all(|r| r.latency_ms.is_some()));

        // The sink sees everything: 2 transitions and 4 calls.
        assert_eq!(f.sink.records().len(), 6);
    }

    #[test]
    fn test_status_to_state_mapping() {
        assert_eq!(state_for_status(HealthStatus::Healthy), LifecycleState::Active);
        assert_eq!(state_for_status(HealthStatus::Degraded), LifecycleState::Degraded);
        assert_eq!(state_for_status(HealthStatus::Unknown), LifecycleState::Degraded);
        assert_eq!(
            state_for_status(HealthStatus::Unhealthy),
            LifecycleState::Unhealthy
        );
    }
}
