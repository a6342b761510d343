//! Circuit breaker, retry and fallback settings plus their metric snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::HealthMonitorConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls proceed.
    Closed,
    /// Calls are rejected without a network attempt.
    Open,
    /// One trial call is allowed to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

/// Point-in-time view of a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub provider: String,
    pub state: CircuitState,
    /// Calls that reached the operation (rejections excluded).
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Calls refused while open (or while a half-open trial was in flight).
    pub rejected_requests: u64,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

impl CircuitBreakerMetrics {
    /// Fraction of attempted calls that failed, 0.0 when nothing ran yet.
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    /// Fraction of attempted calls that succeeded, 1.0 when nothing ran yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Total attempts per logical call (at least one is always made).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryStrategy {
    /// Un-jittered delay following failed attempt `attempt` (0-based):
    /// `min(base_delay * backoff_factor^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Merged breaker and retry counters for one provider.
///
/// The breaker counts attempts; the retry counters count logical
/// operations. A failed attempt is therefore counted once in each view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub provider: String,
    pub circuit: CircuitBreakerMetrics,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Attempts made beyond the first one, summed over all operations.
    pub total_retries: u64,
    /// Terminal failures keyed by [`crate::llm::LlmError::kind_name`].
    pub errors_by_kind: BTreeMap<String, u64>,
    pub last_error: Option<String>,
    pub retry_strategy: RetryStrategy,
}

/// Ordered provider preference for fallback chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackStrategy {
    /// Provider names in preference order.
    #[serde(default)]
    pub preference: Vec<String>,
    /// Alternates tried after the primary.
    #[serde(default = "default_max_fallback_depth")]
    pub max_fallback_depth: usize,
}

fn default_max_fallback_depth() -> usize {
    2
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        Self {
            preference: Vec::new(),
            max_fallback_depth: default_max_fallback_depth(),
        }
    }
}

impl FallbackStrategy {
    pub fn new(preference: Vec<String>, max_fallback_depth: usize) -> Self {
        Self {
            preference,
            max_fallback_depth,
        }
    }

    /// Next preferred provider after `current` that has not been attempted.
    ///
    /// Scans forward from `current`'s position and wraps around, so an
    /// alternate listed before the primary is still reachable. When
    /// `current` is not in the list the scan starts at the front.
    pub fn next_provider<'a>(&'a self, current: &str, attempted: &[String]) -> Option<&'a str> {
        self.candidates_after(current)
            .find(|name| !attempted.iter().any(|a| a == name))
    }

    /// All preference entries in scan order after `current`, excluding `current`.
    pub fn candidates_after<'a>(&'a self, current: &str) -> impl Iterator<Item = &'a str> + 'a {
        let len = self.preference.len();
        let start = self
            .preference
            .iter()
            .position(|name| name == current)
            .map_or(0, |idx| idx + 1);
        let current = current.to_string();
        (0..len)
            .map(move |offset| self.preference[(start + offset) % len].as_str())
            .filter(move |name| *name != current)
    }
}

/// All resilience settings applied to newly created provider instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryStrategy,
    #[serde(default)]
    pub health: HealthMonitorConfig,
    #[serde(default)]
    pub fallback: FallbackStrategy,
    /// Tag copied into every response's annotation block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_tag: Option<String>,
}
