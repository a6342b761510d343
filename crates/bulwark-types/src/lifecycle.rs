//! Managed provider lifecycle states, audit records and factory status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::health::HealthSummary;
use crate::llm::ProviderKind;
use crate::resilience::CircuitState;

/// Lifecycle of a managed provider instance.
///
/// `Created -> Initialized -> {Active | Degraded | Unhealthy} -> Shutdown`.
/// The three health-derived states cycle among themselves; `Shutdown` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Created,
    Initialized,
    Active,
    Degraded,
    Unhealthy,
    Shutdown,
}

impl LifecycleState {
    /// Whether the state is one of the three set from health checks.
    pub fn is_health_derived(&self) -> bool {
        matches!(
            self,
            LifecycleState::Active | LifecycleState::Degraded | LifecycleState::Unhealthy
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (Created, Initialized) => true,
            (Initialized, Active | Degraded | Unhealthy) => true,
            (Active | Degraded | Unhealthy, Active | Degraded | Unhealthy) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Initialized => write!(f, "initialized"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Degraded => write!(f, "degraded"),
            LifecycleState::Unhealthy => write!(f, "unhealthy"),
            LifecycleState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Outcome recorded in an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { error: String },
    Transition { from: LifecycleState, to: LifecycleState },
}

/// One structured audit entry: an operation or a state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub provider: String,
    pub model: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Compact view of one managed instance for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: Uuid,
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    pub state: LifecycleState,
    pub circuit_state: Option<CircuitState>,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Registry-wide status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryStatus {
    pub total_providers: usize,
    /// Instance count per lifecycle state.
    pub states: BTreeMap<LifecycleState, usize>,
    pub registered_kinds: Vec<String>,
    pub providers: Vec<InstanceSummary>,
    pub health: HealthSummary,
}
