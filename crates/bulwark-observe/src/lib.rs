//! Tracing setup for Bulwark binaries.

pub mod tracing_setup;
