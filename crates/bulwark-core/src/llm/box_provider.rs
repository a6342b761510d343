//! BoxProviderAdapter -- object-safe dynamic dispatch wrapper for ProviderAdapter.
//!
//! 1. `ProviderAdapterDyn` is the object-safe twin with boxed futures
//! 2. Blanket impl of `ProviderAdapterDyn` for every `T: ProviderAdapter`
//! 3. `BoxProviderAdapter` wraps `Box<dyn ProviderAdapterDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use bulwark_types::llm::{ChatMessage, GenerationResponse, LlmError, ProviderKind};

use super::provider::ProviderAdapter;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`ProviderAdapter`] with boxed futures.
pub trait ProviderAdapterDyn: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &ProviderKind;

    fn model(&self) -> &str;

    fn generate_text_boxed<'a>(
        &'a self,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<GenerationResponse, LlmError>>;

    fn chat_completion_boxed<'a>(
        &'a self,
        messages: &'a [ChatMessage],
    ) -> BoxFuture<'a, Result<GenerationResponse, LlmError>>;

    fn health_probe_boxed(&self) -> BoxFuture<'_, Result<bool, LlmError>>;

    fn list_models_boxed(&self) -> BoxFuture<'_, Result<Vec<String>, LlmError>>;

    fn close_boxed(&self) -> BoxFuture<'_, ()>;
}

impl<T: ProviderAdapter> ProviderAdapterDyn for T {
    fn name(&self) -> &str {
        ProviderAdapter::name(self)
    }

    fn kind(&self) -> &ProviderKind {
        ProviderAdapter::kind(self)
    }

    fn model(&self) -> &str {
        ProviderAdapter::model(self)
    }

    fn generate_text_boxed<'a>(
        &'a self,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<GenerationResponse, LlmError>> {
        Box::pin(self.generate_text(prompt))
    }

    fn chat_completion_boxed<'a>(
        &'a self,
        messages: &'a [ChatMessage],
    ) -> BoxFuture<'a, Result<GenerationResponse, LlmError>> {
        Box::pin(self.chat_completion(messages))
    }

    fn health_probe_boxed(&self) -> BoxFuture<'_, Result<bool, LlmError>> {
        Box::pin(self.health_probe())
    }

    fn list_models_boxed(&self) -> BoxFuture<'_, Result<Vec<String>, LlmError>> {
        Box::pin(self.list_models())
    }

    fn close_boxed(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }
}

/// Type-erased provider adapter.
///
/// `ProviderAdapter` uses RPITIT and cannot be a trait object itself, so the
/// factory's constructor table produces these instead.
pub struct BoxProviderAdapter {
    inner: Box<dyn ProviderAdapterDyn>,
}

impl BoxProviderAdapter {
    /// Wrap a concrete adapter.
    pub fn new<T: ProviderAdapter + 'static>(adapter: T) -> Self {
        Self {
            inner: Box::new(adapter),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn kind(&self) -> &ProviderKind {
        self.inner.kind()
    }

    pub fn model(&self) -> &str {
        self.inner.model()
    }

    pub async fn generate_text(&self, prompt: &str) -> Result<GenerationResponse, LlmError> {
        self.inner.generate_text_boxed(prompt).await
    }

    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<GenerationResponse, LlmError> {
        self.inner.chat_completion_boxed(messages).await
    }

    pub async fn health_probe(&self) -> Result<bool, LlmError> {
        self.inner.health_probe_boxed().await
    }

    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        self.inner.list_models_boxed().await
    }

    pub async fn close(&self) {
        self.inner.close_boxed().await
    }
}

impl std::fmt::Debug for BoxProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxProviderAdapter")
            .field("name", &self.name())
            .field("kind", self.kind())
            .field("model", &self.model())
            .finish()
    }
}
