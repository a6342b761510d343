//! Resilience and lifecycle layer for Bulwark.
//!
//! This crate defines the provider adapter port and everything that sits
//! between callers and unreliable backends: circuit breakers, retry with
//! backoff, background health monitoring, managed provider instances, the
//! provider registry, and multi-provider fallback. It depends only on
//! `bulwark-types` -- concrete adapters live in `bulwark-infra`.

pub mod audit;
pub mod config;
pub mod fallback;
pub mod health;
pub mod lifecycle;
pub mod llm;
pub mod resilience;

#[cfg(test)]
pub(crate) mod test_support;
