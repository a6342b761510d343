//! Managed provider instances and the registry that owns them.

pub mod factory;
pub mod instance;
