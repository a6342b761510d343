//! LLM request/response types for Bulwark.
//!
//! These types model the data shapes crossing the provider adapter boundary:
//! chat messages, generation responses, usage tracking, provider
//! configuration, and the typed error taxonomy every call resolves to.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a message in an LLM conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// A single message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Token usage reported by a provider for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Audit annotations attached to every response handed back to callers.
///
/// Adapters leave this at its default; the managed provider instance fills
/// it in once the call has gone through the resilience layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseAnnotations {
    /// Unique id for this logical call.
    pub request_id: Uuid,
    /// Id of the managed instance that served the call.
    pub instance_id: Option<Uuid>,
    /// Backend kind that produced the content.
    pub provider_kind: Option<ProviderKind>,
    /// When the response was produced.
    pub generated_at: DateTime<Utc>,
    /// Policy tag configured for the deployment, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_tag: Option<String>,
}

impl Default for ResponseAnnotations {
    fn default() -> Self {
        Self {
            request_id: Uuid::now_v7(),
            instance_id: None,
            provider_kind: None,
            generated_at: Utc::now(),
            policy_tag: None,
        }
    }
}

/// Structured response from `generate_text` or `chat_completion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    /// Model id reported by the backend.
    pub model: String,
    /// Name of the provider that served the call.
    pub provider: String,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Wall-clock latency of the successful attempt.
    pub latency_ms: u64,
    #[serde(default)]
    pub annotations: ResponseAnnotations,
}

/// Backend kind identifier.
///
/// Built-in kinds have dedicated variants; anything else registered at
/// runtime through the factory's constructor table is `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderKind {
    Ollama,
    OpenAiCompatible,
    Custom(String),
}

impl ProviderKind {
    /// Identifier used in config files, env var prefixes and default names.
    pub fn as_str(&self) -> &str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "" => Err("provider kind must not be empty".to_string()),
            "ollama" => Ok(ProviderKind::Ollama),
            "openai_compatible" | "openai" => Ok(ProviderKind::OpenAiCompatible),
            other if other
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
            {
                Ok(ProviderKind::Custom(other.to_string()))
            }
            other => Err(format!("invalid provider kind: '{other}'")),
        }
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Sampling parameters forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Connection parameters for one provider.
///
/// Built once by a configuration source and never mutated afterwards.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend kind.
    pub kind: ProviderKind,
    /// Base URL of the backend API.
    pub endpoint: String,
    /// Model identifier to use.
    pub model: String,
    /// API key, if the backend needs one. Never logged.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub sampling: SamplingParams,
    /// Per-call deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum attempts for one logical call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

impl ProviderConfig {
    /// Create a config with default sampling, timeout and retry settings.
    pub fn new(kind: ProviderKind, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            sampling: SamplingParams::default(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Per-call deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// Hand-written so the API key never reaches logs through `{:?}`.
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("sampling", &self.sampling)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Errors from provider operations.
///
/// Every call resolves to either a response or exactly one of these.
/// Retry and fallback decisions branch on the variant, never on message text.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("all providers failed (attempted: {}): {last_error}", .attempted.join(", "))]
    FallbackExhausted {
        attempted: Vec<String>,
        last_error: Box<LlmError>,
    },

    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider '{provider}' is not accepting calls (state: {state})")]
    NotActive { provider: String, state: String },
}

impl LlmError {
    /// Create the error returned when a breaker rejects a call.
    pub fn circuit_open(provider: impl Into<String>) -> Self {
        LlmError::ProviderUnavailable {
            provider: provider.into(),
            reason: "circuit open".to_string(),
        }
    }

    /// Whether another attempt against the same provider may succeed.
    ///
    /// Transport failures, timeouts, throttling and backend-side errors are
    /// transient. Credentials, missing models, malformed requests and open
    /// circuits are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Connection(_)
                | LlmError::Timeout { .. }
                | LlmError::RateLimited { .. }
                | LlmError::Provider { .. }
        )
    }

    /// Whether this is a fail-fast rejection that made no network attempt.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, LlmError::ProviderUnavailable { .. })
    }

    /// Provider-supplied delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Whether trying a different provider could help.
    ///
    /// A malformed request fails the same way everywhere.
    pub fn should_fall_back(&self) -> bool {
        !matches!(self, LlmError::InvalidRequest(_))
    }

    /// Stable short name of the variant, used as a metrics key.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LlmError::Connection(_) => "connection",
            LlmError::Timeout { .. } => "timeout",
            LlmError::RateLimited { .. } => "rate_limited",
            LlmError::AuthenticationFailed => "authentication",
            LlmError::ModelNotFound(_) => "model_not_found",
            LlmError::ProviderUnavailable { .. } => "provider_unavailable",
            LlmError::FallbackExhausted { .. } => "fallback_exhausted",
            LlmError::Provider { .. } => "provider",
            LlmError::Deserialization(_) => "deserialization",
            LlmError::InvalidRequest(_) => "invalid_request",
            LlmError::NotActive { .. } => "not_active",
        }
    }
}
