//! ProviderAdapter trait definition.
//!
//! This is the contract every backend kind implements. The resilience
//! layer only ever talks to backends through these five operations.

use std::future::Future;

use bulwark_types::llm::{ChatMessage, GenerationResponse, LlmError, ProviderKind};

/// Trait for language model backends (Ollama, OpenAI-compatible, etc.).
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Wrap an
/// implementation in [`super::box_provider::BoxProviderAdapter`] to hold it
/// behind dynamic dispatch.
///
/// Implementations live in bulwark-infra (e.g., `OllamaAdapter`).
pub trait ProviderAdapter: Send + Sync {
    /// Human-readable adapter name (e.g., "ollama").
    fn name(&self) -> &str;

    /// Backend kind this adapter speaks to.
    fn kind(&self) -> &ProviderKind;

    /// Default model identifier.
    fn model(&self) -> &str;

    /// Generate a completion for a single prompt.
    fn generate_text(
        &self,
        prompt: &str,
    ) -> impl Future<Output = Result<GenerationResponse, LlmError>> + Send;

    /// Generate the next assistant message for a conversation.
    fn chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> impl Future<Output = Result<GenerationResponse, LlmError>> + Send;

    /// Cheap reachability check. `Ok(false)` means reachable but not serving.
    fn health_probe(&self) -> impl Future<Output = Result<bool, LlmError>> + Send;

    /// Models the backend can serve.
    fn list_models(&self) -> impl Future<Output = Result<Vec<String>, LlmError>> + Send;

    /// Release connection resources. Called on shutdown; calls made after
    /// it fail with a connection error.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
