//! Retry with bounded exponential backoff on top of a circuit breaker.
//!
//! Every attempt goes through the breaker, so the breaker's counters are the
//! per-attempt record. The handler's own counters track logical operations.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use bulwark_types::llm::LlmError;
use bulwark_types::resilience::{ErrorMetrics, RetryStrategy};

use super::circuit_breaker::CircuitBreaker;

#[derive(Debug, Default)]
struct OperationCounters {
    total_operations: u64,
    successful_operations: u64,
    failed_operations: u64,
    total_retries: u64,
    errors_by_kind: BTreeMap<String, u64>,
    last_error: Option<String>,
}

/// Runs operations through a breaker, retrying transient failures.
#[derive(Debug)]
pub struct ErrorHandler {
    breaker: Arc<CircuitBreaker>,
    strategy: RetryStrategy,
    call_timeout: Duration,
    counters: Mutex<OperationCounters>,
}

impl ErrorHandler {
    pub fn new(breaker: Arc<CircuitBreaker>, strategy: RetryStrategy, call_timeout: Duration) -> Self {
        Self {
            breaker,
            strategy,
            call_timeout,
            counters: Mutex::new(OperationCounters::default()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// Run `operation` with the handler's own retry budget.
    pub async fn execute_with_retry<T, F, Fut>(&self, operation: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        self.handle_operation(operation, None).await
    }

    /// Run `operation`, optionally overriding the attempt budget for this call only.
    ///
    /// Stops early on a circuit-open rejection or on any error that is not
    /// retryable. At least one attempt is always made.
    pub async fn handle_operation<T, F, Fut>(
        &self,
        mut operation: F,
        max_retries: Option<u32>,
    ) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = max_retries.unwrap_or(self.strategy.max_retries).max(1);
        let provider = self.breaker.name();
        let mut attempt = 0;

        loop {
            match self.breaker.execute(self.call_timeout, || operation()).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(provider, attempts = attempt + 1, "operation succeeded after retry");
                    }
                    self.finish(attempt, None);
                    return Ok(value);
                }
                Err(err) => {
                    let has_budget = attempt + 1 < max_attempts;
                    if err.is_circuit_open() || !err.is_retryable() || !has_budget {
                        self.finish(attempt, Some(&err));
                        return Err(err);
                    }
                    let Some(delay) = self.backoff_delay(attempt, &err) else {
                        debug!(provider, error = %err, "retry-after exceeds max delay, giving up");
                        self.finish(attempt, Some(&err));
                        return Err(err);
                    };
                    warn!(
                        provider,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Delay before the attempt following failed attempt `attempt`.
    ///
    /// A provider-supplied retry-after wins over the computed backoff, but
    /// only up to `max_delay`; a longer hint yields `None`.
    fn backoff_delay(&self, attempt: u32, error: &LlmError) -> Option<Duration> {
        if let Some(retry_after) = error.retry_after() {
            let max_delay = Duration::from_millis(self.strategy.max_delay_ms);
            return (retry_after <= max_delay).then_some(retry_after);
        }
        let delay = self.strategy.delay_for_attempt(attempt);
        if self.strategy.jitter {
            Some(apply_jitter(delay))
        } else {
            Some(delay)
        }
    }

    fn finish(&self, retries: u32, error: Option<&LlmError>) {
        let mut counters = self.counters.lock().expect("retry counters lock poisoned");
        counters.total_operations += 1;
        counters.total_retries += u64::from(retries);
        match error {
            None => counters.successful_operations += 1,
            Some(err) => {
                counters.failed_operations += 1;
                *counters
                    .errors_by_kind
                    .entry(err.kind_name().to_string())
                    .or_default() += 1;
                counters.last_error = Some(err.to_string());
            }
        }
    }

    /// Breaker metrics merged with operation counters.
    pub fn get_error_metrics(&self) -> ErrorMetrics {
        let circuit = self.breaker.get_metrics();
        let counters = self.counters.lock().expect("retry counters lock poisoned");
        ErrorMetrics {
            provider: self.breaker.name().to_string(),
            circuit,
            total_operations: counters.total_operations,
            successful_operations: counters.successful_operations,
            failed_operations: counters.failed_operations,
            total_retries: counters.total_retries,
            errors_by_kind: counters.errors_by_kind.clone(),
            last_error: counters.last_error.clone(),
            retry_strategy: self.strategy.clone(),
        }
    }
}

/// Scale `delay` by a random factor in `[0.5, 1.5]`.
pub fn apply_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.5..=1.5);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use bulwark_types::resilience::{CircuitBreakerConfig, CircuitState};
    use tokio::time::Instant;

    use super::*;

    fn handler(max_retries: u32, threshold: u32) -> ErrorHandler {
        let breaker = Arc::new(CircuitBreaker::new(
            "retry-test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: 60_000,
            },
        ));
        let strategy = RetryStrategy {
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
            jitter: false,
        };
        ErrorHandler::new(breaker, strategy, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds_with_backoff() {
        let handler = handler(3, 10);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let result = handler
            .execute_with_retry(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LlmError::Connection("reset".into()))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms after the first failure, 200ms after the second.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_millis(310));

        let metrics = handler.get_error_metrics();
        assert_eq!(metrics.total_operations, 1);
        assert_eq!(metrics.successful_operations, 1);
        assert_eq!(metrics.total_retries, 2);
        assert_eq!(metrics.circuit.total_requests, 3);
        assert_eq!(metrics.circuit.failed_requests, 2);
        assert_eq!(metrics.circuit.successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_after_one_attempt() {
        let handler = handler(3, 10);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = handler
            .execute_with_retry(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::AuthenticationFailed)
            })
            .await;

        assert!(matches!(result, Err(LlmError::AuthenticationFailed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = handler.get_error_metrics();
        assert_eq!(metrics.failed_operations, 1);
        assert_eq!(metrics.errors_by_kind.get("authentication"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_returns_last_error() {
        let handler = handler(3, 10);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = handler
            .execute_with_retry(move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::Provider {
                    message: format!("attempt {n}"),
                })
            })
            .await;

        match result {
            Err(LlmError::Provider { message }) => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.get_error_metrics().total_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_circuit_opens_mid_retry() {
        let handler = handler(5, 2);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = handler
            .execute_with_retry(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::Timeout { timeout_ms: 10 })
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.breaker().state(), CircuitState::Open);
        assert_eq!(handler.get_error_metrics().circuit.rejected_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_override_does_not_mutate_strategy() {
        let handler = handler(5, 10);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let _ = handler
            .handle_operation(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(LlmError::Connection("down".into()))
                },
                Some(2),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.strategy().max_retries, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_still_attempts_once() {
        let handler = handler(0, 10);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let _ = handler
            .execute_with_retry(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::Connection("down".into()))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retry_after_wins_over_backoff() {
        let handler = handler(2, 10);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let result = handler
            .execute_with_retry(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LlmError::RateLimited {
                        retry_after_ms: Some(800),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(800));
        assert!(waited < Duration::from_millis(810));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_beyond_max_delay_fails_fast() {
        let handler = handler(3, 10);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let err = handler
            .execute_with_retry(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::RateLimited {
                    retry_after_ms: Some(86_400_000),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(10));
        let metrics = handler.get_error_metrics();
        assert_eq!(metrics.failed_operations, 1);
        assert_eq!(metrics.total_retries, 0);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_millis(1_000);
        for _ in 0..200 {
            let jittered = apply_jitter(base);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= Duration::from_millis(1_500));
        }
    }
}
