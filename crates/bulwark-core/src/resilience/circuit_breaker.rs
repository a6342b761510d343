//! Circuit breaker guarding calls to a single provider.
//!
//! The breaker counts consecutive failures and opens once they reach the
//! configured threshold. While open every call is rejected without touching
//! the backend. After the reset timeout the breaker lets exactly one trial
//! call through (half-open); its outcome either closes the circuit or
//! reopens it with a fresh timer.
//!
//! The open -> half-open move is purely time driven, so queries compute it
//! from the clock instead of mutating state. The first call or outcome that
//! observes an elapsed timer commits the transition.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bulwark_types::llm::LlmError;
use bulwark_types::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};

/// Fail-fast gate for one provider.
///
/// All counters and the state live behind one mutex, so every admission
/// decision and outcome is applied atomically.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    changed_at: Instant,
    changed_at_utc: DateTime<Utc>,
    /// A half-open trial call is running.
    trial_in_flight: bool,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            changed_at: Instant::now(),
            changed_at_utc: Utc::now(),
            trial_in_flight: false,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            last_failure_time: None,
            last_success_time: None,
        }
    }

    /// State as seen right now, with an elapsed open timer read as half-open.
    fn effective_state(&self, reset_timeout: Duration) -> CircuitState {
        if self.state == CircuitState::Open && self.changed_at.elapsed() >= reset_timeout {
            CircuitState::HalfOpen
        } else {
            self.state
        }
    }

    fn transition(&mut self, provider: &str, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.changed_at = Instant::now();
        self.changed_at_utc = Utc::now();
        self.trial_in_flight = false;
        match to {
            CircuitState::Open => warn!(
                provider,
                %from,
                consecutive_failures = self.consecutive_failures,
                "circuit opened"
            ),
            CircuitState::HalfOpen => info!(provider, %from, "circuit half-open, allowing trial call"),
            CircuitState::Closed => info!(provider, %from, "circuit closed"),
        }
    }

    /// Commit a pending open -> half-open move.
    fn settle_timer(&mut self, provider: &str, reset_timeout: Duration) {
        if self.state == CircuitState::Open
            && self.effective_state(reset_timeout) == CircuitState::HalfOpen
        {
            self.transition(provider, CircuitState::HalfOpen);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().expect("circuit breaker lock poisoned")
    }

    /// Current state. Reports half-open once the reset timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        self.lock().effective_state(self.config.reset_timeout())
    }

    /// Whether a call issued now would be admitted. No side effects.
    pub fn can_execute(&self) -> bool {
        let inner = self.lock();
        match inner.effective_state(self.config.reset_timeout()) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            // A timer that only just elapsed has no trial running yet.
            CircuitState::HalfOpen => inner.state == CircuitState::Open || !inner.trial_in_flight,
        }
    }

    /// Run `operation` under the breaker with a per-call deadline.
    ///
    /// Rejected calls return [`LlmError::circuit_open`] without invoking
    /// `operation`. A deadline overrun is reported as [`LlmError::Timeout`]
    /// and counts as a failure.
    pub async fn execute<T, F, Fut>(&self, timeout: Duration, operation: F) -> Result<T, LlmError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let permit = self.admit()?;
        let outcome = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        match &outcome {
            Ok(_) => permit.succeeded(),
            Err(err) => permit.failed(err),
        }
        outcome
    }

    fn admit(&self) -> Result<Permit<'_>, LlmError> {
        let mut inner = self.lock();
        inner.settle_timer(&self.name, self.config.reset_timeout());
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.rejected_requests += 1;
                debug!(provider = %self.name, state = %inner.state, "call rejected by circuit breaker");
                return Err(LlmError::circuit_open(&self.name));
            }
        };
        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Record a successful call made outside [`execute`](Self::execute).
    pub fn record_success(&self) {
        self.apply_success(false);
    }

    /// Record a failed call made outside [`execute`](Self::execute).
    pub fn record_failure(&self) {
        self.apply_failure(false, None);
    }

    fn apply_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.settle_timer(&self.name, self.config.reset_timeout());
        inner.total_requests += 1;
        inner.successful_requests += 1;
        inner.last_success_time = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.transition(&self.name, CircuitState::Closed);
            }
            // A success reported while open does not shorten the timer.
            CircuitState::Open => {}
        }
        if trial {
            inner.trial_in_flight = false;
        }
    }

    fn apply_failure(&self, trial: bool, error: Option<&LlmError>) {
        let mut inner = self.lock();
        inner.settle_timer(&self.name, self.config.reset_timeout());
        inner.total_requests += 1;
        inner.failed_requests += 1;
        inner.last_failure_time = Some(Utc::now());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if let Some(err) = error {
            debug!(
                provider = %self.name,
                consecutive_failures = inner.consecutive_failures,
                error = %err,
                "call failed"
            );
        }
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.transition(&self.name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => inner.transition(&self.name, CircuitState::Open),
            CircuitState::Open => {}
        }
        if trial {
            inner.trial_in_flight = false;
        }
    }

    /// Snapshot of counters and state.
    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.lock();
        CircuitBreakerMetrics {
            provider: self.name.clone(),
            state: inner.effective_state(self.config.reset_timeout()),
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            rejected_requests: inner.rejected_requests,
            consecutive_failures: inner.consecutive_failures,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            last_state_change: inner.changed_at_utc,
        }
    }
}

/// Admission granted by [`CircuitBreaker::admit`].
///
/// Dropping an unsettled trial permit (the caller's future was cancelled)
/// frees the half-open slot so the breaker cannot wedge.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn succeeded(mut self) {
        self.settled = true;
        self.breaker.apply_success(self.trial);
    }

    fn failed(mut self, error: &LlmError) {
        self.settled = true;
        self.breaker.apply_failure(self.trial, Some(error));
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }
}
