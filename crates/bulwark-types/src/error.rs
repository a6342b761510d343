use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::llm::LlmError;

/// Errors from the provider registry and instance lifecycle.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider '{0}' already exists")]
    DuplicateName(String),

    #[error("provider '{0}' not found")]
    NotFound(String),

    #[error("cannot {operation} provider '{name}' in state {state}")]
    InvalidTransition {
        name: String,
        state: LifecycleState,
        operation: &'static str,
    },

    #[error("no adapter registered for provider kind '{0}'")]
    UnsupportedKind(String),

    #[error("adapter constructor for '{expected}' produced a '{actual}' adapter")]
    ContractViolation { expected: String, actual: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Provider(#[from] LlmError),
}
