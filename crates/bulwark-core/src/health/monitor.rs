//! Periodic provider health probing.
//!
//! The monitor owns one background task that probes every registered
//! provider each `check_interval`. Probes run through the provider's circuit
//! breaker when one is attached, so monitoring traffic and live traffic share
//! the same failure accounting. Results roll up into per-provider
//! [`HealthMetrics`] from which a [`HealthStatus`] is derived.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bulwark_types::error::RegistryError;
use bulwark_types::health::{
    HealthCheckResult, HealthMetrics, HealthMonitorConfig, HealthStatus, HealthStatusChange,
    HealthSummary,
};
use bulwark_types::llm::LlmError;

use crate::llm::box_provider::BoxProviderAdapter;
use crate::resilience::circuit_breaker::CircuitBreaker;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Shortest probe interval; smaller configured values are raised to this.
pub const MIN_CHECK_INTERVAL_MS: u64 = 10;

#[derive(Clone)]
struct MonitoredProvider {
    adapter: Arc<BoxProviderAdapter>,
    breaker: Option<Arc<CircuitBreaker>>,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks provider health and runs the periodic probe loop.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    providers: DashMap<String, MonitoredProvider>,
    metrics: DashMap<String, HealthMetrics>,
    changes: broadcast::Sender<HealthStatusChange>,
    task: Mutex<Option<MonitorTask>>,
    running: AtomicBool,
}

impl HealthMonitor {
    pub fn new(mut config: HealthMonitorConfig) -> Self {
        if config.check_interval_ms < MIN_CHECK_INTERVAL_MS {
            warn!(
                configured_ms = config.check_interval_ms,
                min_ms = MIN_CHECK_INTERVAL_MS,
                "health check interval too small, raising to minimum"
            );
            config.check_interval_ms = MIN_CHECK_INTERVAL_MS;
        }
        let (changes, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            config,
            providers: DashMap::new(),
            metrics: DashMap::new(),
            changes,
            task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Start tracking a provider. Re-registering a name resets its metrics.
    pub fn register_provider(
        &self,
        name: impl Into<String>,
        adapter: Arc<BoxProviderAdapter>,
        breaker: Option<Arc<CircuitBreaker>>,
    ) {
        let name = name.into();
        self.metrics
            .insert(name.clone(), HealthMetrics::new(name.clone()));
        self.providers
            .insert(name.clone(), MonitoredProvider { adapter, breaker });
        debug!(provider = %name, "registered provider for health monitoring");
    }

    /// Stop tracking a provider and drop its metrics.
    pub fn unregister_provider(&self, name: &str) -> bool {
        let removed = self.providers.remove(name).is_some();
        self.metrics.remove(name);
        if removed {
            debug!(provider = %name, "unregistered provider from health monitoring");
        }
        removed
    }

    /// Probe one provider now and fold the result into its metrics.
    pub async fn check_provider_health(
        &self,
        name: &str,
    ) -> Result<HealthCheckResult, RegistryError> {
        let provider = self
            .providers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let timeout = self.config.timeout();
        let started = Instant::now();
        let outcome = match &provider.breaker {
            Some(breaker) => breaker.execute(timeout, || probe(&provider.adapter, name)).await,
            None => match tokio::time::timeout(timeout, probe(&provider.adapter, name)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }),
            },
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let result = HealthCheckResult {
            provider: name.to_string(),
            status: if outcome.is_ok() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            latency_ms,
            error: outcome.err().map(|err| err.to_string()),
            timestamp: Utc::now(),
        };
        self.record(&result);
        Ok(result)
    }

    /// Out-of-band probe with the same bookkeeping as the periodic loop.
    pub async fn force_health_check(
        &self,
        name: &str,
    ) -> Result<HealthCheckResult, RegistryError> {
        self.check_provider_health(name).await
    }

    /// Probe every registered provider concurrently.
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let names: Vec<String> = self
            .providers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let checks = names.iter().map(|name| self.check_provider_health(name));
        join_all(checks)
            .await
            .into_iter()
            // A provider unregistered mid-round has nothing left to report.
            .filter_map(Result::ok)
            .collect()
    }

    fn record(&self, result: &HealthCheckResult) {
        let change = {
            let Some(mut metrics) = self.metrics.get_mut(&result.provider) else {
                return;
            };
            let previous = metrics.status;
            apply_check(&mut metrics, result, &self.config);
            (previous != metrics.status).then(|| HealthStatusChange {
                provider: result.provider.clone(),
                previous,
                current: metrics.status,
                timestamp: result.timestamp,
            })
        };

        if let Some(change) = change {
            match change.current {
                HealthStatus::Unhealthy => warn!(
                    provider = %change.provider,
                    from = %change.previous,
                    to = %change.current,
                    error = ?result.error,
                    "provider health changed"
                ),
                _ => info!(
                    provider = %change.provider,
                    from = %change.previous,
                    to = %change.current,
                    "provider health changed"
                ),
            }
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
    }

    /// Spawn the periodic probe loop. No-op if it is already running.
    pub async fn start_monitoring(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!("health monitoring already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::downgrade(self),
            self.config.check_interval(),
            cancel.clone(),
        ));
        *task = Some(MonitorTask { cancel, handle });
        self.running.store(true, Ordering::SeqCst);
        info!(
            interval_ms = self.config.check_interval_ms,
            "health monitoring started"
        );
    }

    /// Stop the probe loop, waiting for an in-flight round to finish.
    pub async fn stop_monitoring(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "health monitoring task ended abnormally");
        }
        self.running.store(false, Ordering::SeqCst);
        info!("health monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receive an event each time a provider's derived status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthStatusChange> {
        self.changes.subscribe()
    }

    pub fn get_provider_health(&self, name: &str) -> Option<HealthMetrics> {
        self.metrics.get(name).map(|entry| entry.value().clone())
    }

    /// Providers whose status is Healthy or Degraded.
    pub fn get_healthy_providers(&self) -> BTreeMap<String, HealthStatus> {
        self.metrics
            .iter()
            .filter(|entry| entry.status.is_usable())
            .map(|entry| (entry.key().clone(), entry.status))
            .collect()
    }

    pub fn get_all_health(&self) -> BTreeMap<String, HealthMetrics> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary {
            monitoring_active: self.is_monitoring(),
            ..HealthSummary::default()
        };
        let mut availability_sum = 0.0;
        let mut probed = 0usize;
        for entry in self.metrics.iter() {
            summary.total_providers += 1;
            match entry.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
            if entry.total_checks > 0 {
                availability_sum += entry.availability_rate;
                probed += 1;
            }
        }
        if probed > 0 {
            summary.average_availability = availability_sum / probed as f64;
        }
        summary
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

async fn probe(adapter: &BoxProviderAdapter, name: &str) -> Result<(), LlmError> {
    match adapter.health_probe().await? {
        true => Ok(()),
        false => Err(LlmError::Provider {
            message: format!("health probe for '{name}' reported not serving"),
        }),
    }
}

/// The loop holds only a weak handle so dropping the monitor ends it.
async fn run_loop(
    monitor: Weak<HealthMonitor>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        let results = monitor.check_all().await;
        debug!(checked = results.len(), "health check round complete");
    }
}

/// Fold one probe result into rolling metrics and re-derive the status.
fn apply_check(metrics: &mut HealthMetrics, result: &HealthCheckResult, config: &HealthMonitorConfig) {
    metrics.total_checks += 1;
    if result.status == HealthStatus::Healthy {
        metrics.successful_checks += 1;
        metrics.consecutive_failures = 0;
        let n = metrics.successful_checks as f64;
        metrics.average_latency_ms += (result.latency_ms as f64 - metrics.average_latency_ms) / n;
    } else {
        metrics.failed_checks += 1;
        metrics.consecutive_failures = metrics.consecutive_failures.saturating_add(1);
        metrics.last_error = result.error.clone();
    }
    metrics.availability_rate = metrics.successful_checks as f64 / metrics.total_checks as f64;
    metrics.last_check = Some(result.timestamp);
    metrics.status = derive_status(metrics, config);
}

fn derive_status(metrics: &HealthMetrics, config: &HealthMonitorConfig) -> HealthStatus {
    if metrics.consecutive_failures >= config.failure_threshold {
        HealthStatus::Unhealthy
    } else if metrics.availability_rate < config.degraded_threshold {
        HealthStatus::Degraded
    } else if metrics.consecutive_failures == 0
        && metrics.successful_checks >= config.recovery_threshold
    {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}
