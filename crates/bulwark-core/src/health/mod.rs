//! Background health monitoring of registered providers.

pub mod monitor;
