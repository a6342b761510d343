//! Multi-provider fallback.
//!
//! Routes a call to a primary provider and, when it fails, walks the
//! configured preference list. Each provider is tried at most once per call,
//! and each try goes through that provider's own retry handler and breaker.
//! Providers the health monitor reports as unhealthy are passed over while
//! any other candidate remains.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use bulwark_types::health::{HealthStatus, HealthSummary};
use bulwark_types::llm::{ChatMessage, GenerationResponse, LlmError};
use bulwark_types::resilience::{ErrorMetrics, FallbackStrategy};

use crate::lifecycle::factory::ProviderFactory;
use crate::lifecycle::instance::ProviderInstance;
use crate::llm::box_provider::BoxProviderAdapter;

/// Resilience metrics across every registered provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveMetrics {
    pub providers: BTreeMap<String, ErrorMetrics>,
    pub fallback_strategy: FallbackStrategy,
    pub health: HealthSummary,
}

/// Coordinates calls across providers registered in a [`ProviderFactory`].
pub struct FallbackCoordinator {
    factory: Arc<ProviderFactory>,
    strategy: FallbackStrategy,
}

impl FallbackCoordinator {
    pub fn new(factory: Arc<ProviderFactory>, strategy: FallbackStrategy) -> Self {
        Self { factory, strategy }
    }

    pub fn strategy(&self) -> &FallbackStrategy {
        &self.strategy
    }

    /// Run an adapter operation on `primary`, falling back on failure.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        primary: &str,
        operation: F,
    ) -> Result<T, LlmError>
    where
        F: Fn(Arc<BoxProviderAdapter>) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let operation = &operation;
        self.run_chain(primary, move |instance| async move {
            instance.execute("execute", operation).await
        })
        .await
    }

    pub async fn generate_text_with_fallback(
        &self,
        primary: &str,
        prompt: &str,
    ) -> Result<GenerationResponse, LlmError> {
        self.run_chain(primary, move |instance| async move {
            instance.generate_text(prompt).await
        })
        .await
    }

    pub async fn chat_completion_with_fallback(
        &self,
        primary: &str,
        messages: &[ChatMessage],
    ) -> Result<GenerationResponse, LlmError> {
        self.run_chain(primary, move |instance| async move {
            instance.chat_completion(messages).await
        })
        .await
    }

    /// Try `primary`, then alternates, invoking `call` at most
    /// `max_fallback_depth + 1` times and never on the same name twice.
    async fn run_chain<T, F, Fut>(&self, primary: &str, call: F) -> Result<T, LlmError>
    where
        F: Fn(Arc<ProviderInstance>) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempted = vec![primary.to_string()];
        let mut current = primary.to_string();
        let mut last_error;

        loop {
            let result = match self.factory.get_provider(&current) {
                Some(instance) => call(instance).await,
                None => Err(LlmError::ProviderUnavailable {
                    provider: current.clone(),
                    reason: "not registered".to_string(),
                }),
            };

            match result {
                Ok(value) => {
                    if current != primary {
                        tracing::warn!(
                            primary,
                            provider = %current,
                            attempts = attempted.len(),
                            "Failover occurred"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if !err.should_fall_back() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        provider = %current,
                        error = %err,
                        "Provider failed, trying next in chain"
                    );
                    last_error = err;
                }
            }

            if attempted.len() > self.strategy.max_fallback_depth {
                break;
            }
            match self.select_next(&current, &attempted) {
                Some(next) => {
                    attempted.push(next.clone());
                    current = next;
                }
                None => break,
            }
        }

        Err(LlmError::FallbackExhausted {
            attempted,
            last_error: Box::new(last_error),
        })
    }

    /// Next untried provider, preferring ones not reported unhealthy.
    fn select_next(&self, current: &str, attempted: &[String]) -> Option<String> {
        let monitor = self.factory.health_monitor();
        let untried = self
            .strategy
            .candidates_after(current)
            .filter(|name| !attempted.iter().any(|a| a == name));

        let mut first_unhealthy = None;
        for name in untried {
            let unhealthy = monitor
                .get_provider_health(name)
                .is_some_and(|metrics| metrics.status == HealthStatus::Unhealthy);
            if !unhealthy {
                return Some(name.to_string());
            }
            tracing::debug!(provider = %name, "Provider unhealthy, skipping");
            first_unhealthy.get_or_insert(name);
        }
        // Everything left is unhealthy; a long shot beats giving up.
        first_unhealthy.map(str::to_string)
    }

    /// Per-provider error metrics plus strategy and health summary.
    pub fn get_comprehensive_metrics(&self) -> ComprehensiveMetrics {
        let providers = self
            .factory
            .list_providers()
            .iter()
            .filter_map(|instance| {
                instance
                    .error_metrics()
                    .map(|metrics| (instance.name().to_string(), metrics))
            })
            .collect();
        ComprehensiveMetrics {
            providers,
            fallback_strategy: self.strategy.clone(),
            health: self.factory.health_monitor().get_health_summary(),
        }
    }
}
