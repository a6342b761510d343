//! Audit sinks for provider operations and lifecycle transitions.

use std::sync::Mutex;

use tracing::{info, warn};

use bulwark_types::lifecycle::{AuditOutcome, AuditRecord};

/// Destination for structured audit records.
///
/// Every managed instance keeps its own bounded in-memory trail and also
/// forwards each record to a sink.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Emits each record as a structured tracing event under `bulwark::audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        match &record.outcome {
            AuditOutcome::Success => info!(
                target: "bulwark::audit",
                operation = %record.operation,
                provider = %record.provider,
                model = %record.model,
                latency_ms = ?record.latency_ms,
                "operation succeeded"
            ),
            AuditOutcome::Failure { error } => warn!(
                target: "bulwark::audit",
                operation = %record.operation,
                provider = %record.provider,
                model = %record.model,
                latency_ms = ?record.latency_ms,
                error = %error,
                "operation failed"
            ),
            AuditOutcome::Transition { from, to } => info!(
                target: "bulwark::audit",
                provider = %record.provider,
                %from,
                %to,
                "lifecycle transition"
            ),
        }
    }
}

/// Collects records in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .expect("audit sink lock poisoned")
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records
            .lock()
            .expect("audit sink lock poisoned")
            .push(record.clone());
    }
}
