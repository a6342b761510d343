//! Concrete provider adapters and configuration sources for Bulwark.
//!
//! `bulwark-core` defines the resilience machinery against the
//! `ProviderAdapter` trait; this crate supplies the HTTP backends and the
//! env/file config that feed the provider factory.

pub mod config;
pub mod llm;
