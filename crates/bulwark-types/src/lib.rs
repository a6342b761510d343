//! Shared domain types for Bulwark.
//!
//! This crate contains the data model used across the Bulwark workspace:
//! provider configuration, request/response shapes, the error taxonomy,
//! circuit breaker and retry settings, health metrics and lifecycle records.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod health;
pub mod lifecycle;
pub mod llm;
pub mod resilience;
