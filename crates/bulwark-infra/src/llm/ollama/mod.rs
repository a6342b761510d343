//! OllamaAdapter -- [`ProviderAdapter`] for a local or remote Ollama server.
//!
//! Talks to the non-streaming JSON endpoints (`/api/generate`, `/api/chat`,
//! `/api/tags`). An optional API key is sent as a bearer token for Ollama
//! instances behind an authenticating proxy; it lives in a [`SecretString`]
//! and never reaches logs.

pub mod types;

use std::time::Instant;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;

use bulwark_core::llm::provider::ProviderAdapter;
use bulwark_types::llm::{
    ChatMessage, GenerationResponse, LlmError, ProviderConfig, ProviderKind, ResponseAnnotations,
    SamplingParams, Usage,
};

use self::types::{
    ChatRequest, ChatResponse, GenerateRequest, GenerateResponse, OllamaMessage, OllamaOptions,
    TagsResponse,
};
use super::http::{ClientSlot, build_client, map_status, map_transport_error};

/// Ollama provider adapter.
///
/// Does not derive Debug; the optional API key stays out of debug output.
pub struct OllamaAdapter {
    client: ClientSlot<reqwest::Client>,
    kind: ProviderKind,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    sampling: SamplingParams,
    timeout_ms: u64,
}

impl OllamaAdapter {
    /// Default local endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "http://localhost:11434";

    pub fn new(config: &ProviderConfig) -> Result<Self, LlmError> {
        Ok(Self {
            client: ClientSlot::new(build_client(config.timeout())?),
            kind: ProviderKind::Ollama,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone().map(SecretString::from),
            sampling: config.sampling.clone(),
            timeout_ms: config.timeout_ms,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn options(&self) -> OllamaOptions {
        OllamaOptions {
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            num_predict: self.sampling.max_tokens,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    /// Send and decode. `model` is set for generation calls so a 404 reads
    /// as a missing model.
    async fn send<R: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        model: Option<&str>,
    ) -> Result<R, LlmError> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &headers, &body, model));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::Deserialization(format!("failed to parse response: {e}")))
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, LlmError> {
        let client = self.client.get()?;
        self.send(client.post(self.url(path)).json(body), Some(&self.model)).await
    }

    fn response(
        &self,
        content: String,
        model: String,
        done_reason: Option<String>,
        usage: Usage,
        started: Instant,
    ) -> GenerationResponse {
        GenerationResponse {
            content,
            model,
            provider: self.kind.to_string(),
            usage,
            finish_reason: done_reason,
            latency_ms: started.elapsed().as_millis() as u64,
            annotations: ResponseAnnotations::default(),
        }
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate_text(&self, prompt: &str) -> Result<GenerationResponse, LlmError> {
        let started = Instant::now();
        let body = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: self.options(),
        };
        let resp: GenerateResponse = self.post("/api/generate", &body).await?;
        Ok(self.response(
            resp.response,
            resp.model,
            resp.done_reason,
            Usage::new(resp.prompt_eval_count, resp.eval_count),
            started,
        ))
    }

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<GenerationResponse, LlmError> {
        if messages.is_empty() {
            return Err(LlmError::InvalidRequest(
                "chat completion needs at least one message".to_string(),
            ));
        }
        let started = Instant::now();
        let body = ChatRequest {
            model: self.model.clone(),
            messages: messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: false,
            options: self.options(),
        };
        let resp: ChatResponse = self.post("/api/chat", &body).await?;
        Ok(self.response(
            resp.message.content,
            resp.model,
            resp.done_reason,
            Usage::new(resp.prompt_eval_count, resp.eval_count),
            started,
        ))
    }

    /// Reachable and the configured model is pulled.
    async fn health_probe(&self) -> Result<bool, LlmError> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|name| {
            name == &self.model || name.split(':').next() == Some(self.model.as_str())
        }))
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let client = self.client.get()?;
        let tags: TagsResponse = self.send(client.get(self.url("/api/tags")), None).await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn close(&self) {
        if self.client.release() {
            tracing::debug!(endpoint = %self.base_url, "closed ollama adapter");
        }
    }
}
