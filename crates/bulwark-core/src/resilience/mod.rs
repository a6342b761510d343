//! Per-provider failure containment.
//!
//! - `CircuitBreaker`: fail-fast gate around every backend call
//! - `ErrorHandler`: bounded retry with exponential backoff, layered on a breaker

pub mod circuit_breaker;
pub mod retry;
