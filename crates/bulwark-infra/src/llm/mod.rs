//! Provider adapter implementations.
//!
//! Contains the concrete [`ProviderAdapter`](bulwark_core::llm::provider::ProviderAdapter)
//! implementations and the glue that registers them with a
//! [`ProviderFactory`].

pub(crate) mod http;
pub mod ollama;
pub mod openai_compat;

use bulwark_core::lifecycle::factory::ProviderFactory;
use bulwark_core::llm::box_provider::BoxProviderAdapter;
use bulwark_types::llm::{LlmError, ProviderConfig, ProviderKind};

use self::ollama::OllamaAdapter;
use self::openai_compat::OpenAiCompatibleAdapter;

/// Create a [`BoxProviderAdapter`] for one of the built-in kinds.
///
/// # Errors
///
/// Returns `InvalidRequest` for a kind with no built-in adapter.
pub fn create_adapter(config: &ProviderConfig) -> Result<BoxProviderAdapter, LlmError> {
    match &config.kind {
        ProviderKind::Ollama => Ok(BoxProviderAdapter::new(OllamaAdapter::new(config)?)),
        ProviderKind::OpenAiCompatible => {
            Ok(BoxProviderAdapter::new(OpenAiCompatibleAdapter::new(config)?))
        }
        ProviderKind::Custom(name) => Err(LlmError::InvalidRequest(format!(
            "no built-in adapter for provider kind '{name}'"
        ))),
    }
}

/// Register every built-in adapter kind with `factory`.
pub fn register_builtin_adapters(factory: &ProviderFactory) {
    for kind in [ProviderKind::Ollama, ProviderKind::OpenAiCompatible] {
        factory.register_provider_type(kind, create_adapter);
    }
}
