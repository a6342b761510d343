//! OpenAI-compatible provider adapter.
//!
//! One [`OpenAiCompatibleAdapter`] serves any backend that speaks the OpenAI
//! chat completions protocol (OpenAI, Mistral, vLLM, LM Studio, gateways) via
//! a configurable base URL. Completions go through [`async_openai`]; the
//! models listing is a plain `GET {base}/models`.

use std::time::Instant;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest, FinishReason,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use bulwark_core::llm::provider::ProviderAdapter;
use bulwark_types::llm::{
    ChatMessage, GenerationResponse, LlmError, MessageRole, ProviderConfig, ProviderKind,
    ResponseAnnotations, SamplingParams, Usage,
};

use super::http::{ClientSlot, build_client, map_status, map_transport_error};

/// Base URL used when none is configured.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for any OpenAI-compatible API.
///
/// Does NOT derive Debug: the async-openai client holds the API key.
pub struct OpenAiCompatibleAdapter {
    client: ClientSlot<Client<OpenAIConfig>>,
    http: ClientSlot<reqwest::Client>,
    kind: ProviderKind,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    sampling: SamplingParams,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiCompatibleAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self, LlmError> {
        let base_url = if config.endpoint.trim().is_empty() {
            OPENAI_BASE_URL.to_string()
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };
        let api_key = config.api_key.clone().unwrap_or_default();
        let openai_config = OpenAIConfig::new()
            .with_api_key(&api_key)
            .with_api_base(&base_url);

        Ok(Self {
            client: ClientSlot::new(Client::with_config(openai_config)),
            http: ClientSlot::new(build_client(config.timeout())?),
            kind: ProviderKind::OpenAiCompatible,
            base_url,
            api_key: config.api_key.clone().map(SecretString::from),
            model: config.model.clone(),
            sampling: config.sampling.clone(),
            timeout_ms: config.timeout_ms,
        })
    }

    /// Build a [`CreateChatCompletionRequest`] from conversation messages.
    fn build_request(&self, messages: &[ChatMessage]) -> CreateChatCompletionRequest {
        let messages = messages
            .iter()
            .map(|msg| match msg.role {
                MessageRole::System => {
                    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                        content: ChatCompletionRequestSystemMessageContent::Text(
                            msg.content.clone(),
                        ),
                        name: None,
                    })
                }
                MessageRole::User => {
                    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                        content: ChatCompletionRequestUserMessageContent::Text(msg.content.clone()),
                        name: None,
                    })
                }
                MessageRole::Assistant => {
                    #[allow(deprecated)]
                    ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                        content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                            msg.content.clone(),
                        )),
                        refusal: None,
                        name: None,
                        audio: None,
                        tool_calls: None,
                        function_call: None,
                    })
                }
            })
            .collect();

        CreateChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_completion_tokens: Some(self.sampling.max_tokens),
            temperature: Some(self.sampling.temperature),
            top_p: self.sampling.top_p,
            ..Default::default()
        }
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<GenerationResponse, LlmError> {
        if messages.is_empty() {
            return Err(LlmError::InvalidRequest(
                "chat completion needs at least one message".to_string(),
            ));
        }
        let started = Instant::now();
        let response = self
            .client
            .get()?
            .chat()
            .create(self.build_request(messages))
            .await
            .map_err(|e| map_openai_error(e, self.timeout_ms))?;

        let choice = response.choices.first();
        let content = choice
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let finish_reason = choice
            .and_then(|c| c.finish_reason.as_ref())
            .map(|reason| {
                match reason {
                    FinishReason::Stop => "stop",
                    FinishReason::Length => "length",
                    FinishReason::ToolCalls => "tool_calls",
                    FinishReason::ContentFilter => "content_filter",
                    FinishReason::FunctionCall => "function_call",
                }
                .to_string()
            });
        let usage = response
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(GenerationResponse {
            content,
            model: response.model,
            provider: self.kind.to_string(),
            usage,
            finish_reason,
            latency_ms: started.elapsed().as_millis() as u64,
            annotations: ResponseAnnotations::default(),
        })
    }
}

impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate_text(&self, prompt: &str) -> Result<GenerationResponse, LlmError> {
        self.complete(&[ChatMessage::user(prompt)]).await
    }

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<GenerationResponse, LlmError> {
        self.complete(messages).await
    }

    async fn health_probe(&self) -> Result<bool, LlmError> {
        self.list_models().await.map(|_| true)
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let mut request = self.http.get()?.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &headers, &body, None));
        }
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| LlmError::Deserialization(format!("failed to parse model list: {e}")))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    async fn close(&self) {
        let released = self.client.release();
        if self.http.release() || released {
            tracing::debug!(endpoint = %self.base_url, "closed openai-compatible adapter");
        }
    }
}

/// Map an `async_openai::error::OpenAIError` to an [`LlmError`].
fn map_openai_error(err: async_openai::error::OpenAIError, timeout_ms: u64) -> LlmError {
    use async_openai::error::OpenAIError;

    match err {
        OpenAIError::ApiError(api_err) => {
            let code = api_err.code.as_deref().unwrap_or("");
            let error_type = api_err.r#type.as_deref().unwrap_or("");

            if code == "invalid_api_key"
                || error_type == "authentication_error"
                || api_err.message.contains("Incorrect API key")
                || api_err.message.contains("Invalid API key")
            {
                LlmError::AuthenticationFailed
            } else if code == "rate_limit_exceeded" || error_type == "rate_limit_error" {
                LlmError::RateLimited {
                    retry_after_ms: None,
                }
            } else if code == "model_not_found" {
                LlmError::ModelNotFound(api_err.message)
            } else if code == "context_length_exceeded" || error_type == "invalid_request_error" {
                LlmError::InvalidRequest(api_err.message)
            } else {
                LlmError::Provider {
                    message: api_err.message,
                }
            }
        }
        OpenAIError::Reqwest(reqwest_err) => match reqwest_err.status().map(|s| s.as_u16()) {
            Some(401 | 403) => LlmError::AuthenticationFailed,
            Some(429) => LlmError::RateLimited {
                retry_after_ms: None,
            },
            Some(_) => LlmError::Provider {
                message: reqwest_err.to_string(),
            },
            None if reqwest_err.is_timeout() => LlmError::Timeout { timeout_ms },
            None => LlmError::Connection(reqwest_err.to_string()),
        },
        OpenAIError::JSONDeserialize(_, content) => {
            LlmError::Deserialization(format!("failed to parse response: {content}"))
        }
        OpenAIError::InvalidArgument(msg) => LlmError::InvalidRequest(msg),
        other => LlmError::Provider {
            message: other.to_string(),
        },
    }
}
