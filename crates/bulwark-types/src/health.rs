//! Provider health types produced by the background health monitor.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived health of a provider, used for provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Whether a provider in this status may be selected for calls.
    pub fn is_usable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of a single health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub provider: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Rolling health aggregate for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub provider: String,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    /// `successful_checks / total_checks`, always in `[0, 1]`.
    pub availability_rate: f64,
    /// Mean latency over successful checks only.
    pub average_latency_ms: f64,
    pub consecutive_failures: u32,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl HealthMetrics {
    /// Metrics for a provider that has not been probed yet.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            total_checks: 0,
            successful_checks: 0,
            failed_checks: 0,
            availability_rate: 0.0,
            average_latency_ms: 0.0,
            consecutive_failures: 0,
            status: HealthStatus::Unknown,
            last_check: None,
            last_error: None,
        }
    }
}

/// Health monitor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    /// Time between background probe rounds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Deadline for a single probe.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failed probes that mark a provider unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Availability below this marks a provider degraded.
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f64,
    /// Successful probes needed before a provider counts as healthy.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u64,
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_degraded_threshold() -> f64 {
    0.8
}

fn default_recovery_threshold() -> u64 {
    2
}

impl HealthMonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            degraded_threshold: default_degraded_threshold(),
            recovery_threshold: default_recovery_threshold(),
        }
    }
}

/// Aggregate counts across every monitored provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total_providers: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    /// Mean availability over providers probed at least once.
    pub average_availability: f64,
    pub monitoring_active: bool,
}

/// Emitted when a provider's derived status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatusChange {
    pub provider: String,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_unknown() {
        let metrics = HealthMetrics::new("ollama");
        assert_eq!(metrics.status, HealthStatus::Unknown);
        assert_eq!(metrics.total_checks, 0);
        assert!(metrics.last_check.is_none());
    }

    #[test]
    fn test_usable_statuses() {
        assert!(HealthStatus::Healthy.is_usable());
        assert!(HealthStatus::Degraded.is_usable());
        assert!(!HealthStatus::Unhealthy.is_usable());
        assert!(!HealthStatus::Unknown.is_usable());
    }

    #[test]
    fn test_monitor_config_partial_toml() {
        let config: HealthMonitorConfig = toml::from_str("failure_threshold = 5").unwrap();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.check_interval(), Duration::from_secs(30));
        assert!((config.degraded_threshold - 0.8).abs() < f64::EPSILON);
    }
}
