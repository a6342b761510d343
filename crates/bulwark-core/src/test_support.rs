//! Scripted adapter shared by the unit tests in this crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bulwark_types::llm::{
    ChatMessage, GenerationResponse, LlmError, ProviderConfig, ProviderKind, ResponseAnnotations,
    Usage,
};

use crate::llm::box_provider::BoxProviderAdapter;
use crate::llm::provider::ProviderAdapter;

/// Shared handle that lets a test script an adapter after it has been boxed.
#[derive(Default)]
pub(crate) struct Script {
    generate: Mutex<VecDeque<Result<String, LlmError>>>,
    fail_all: Mutex<Option<LlmError>>,
    probe_healthy: AtomicBool,
    probe_error: Mutex<Option<LlmError>>,
    delay: Mutex<Option<Duration>>,
    generate_calls: AtomicU32,
    probe_calls: AtomicU32,
    closed: AtomicBool,
}

impl Script {
    pub fn new() -> Arc<Self> {
        let script = Self::default();
        script.probe_healthy.store(true, Ordering::SeqCst);
        Arc::new(script)
    }

    /// Queue one outcome for the next generate call.
    pub fn push(&self, outcome: Result<&str, LlmError>) {
        self.generate
            .lock()
            .unwrap()
            .push_back(outcome.map(str::to_string));
    }

    /// Fail every generate call that has no queued outcome.
    pub fn fail_with(&self, error: Option<LlmError>) {
        *self.fail_all.lock().unwrap() = error;
    }

    pub fn set_probe(&self, healthy: bool) {
        self.probe_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_probe_error(&self, error: Option<LlmError>) {
        *self.probe_error.lock().unwrap() = error;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn generate_calls(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> u32 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn delay(&self) -> Option<Duration> {
        *self.delay.lock().unwrap()
    }
}

pub(crate) struct ScriptedAdapter {
    name: String,
    kind: ProviderKind,
    model: String,
    script: Arc<Script>,
}

impl ScriptedAdapter {
    pub fn new(name: &str, kind: ProviderKind, script: Arc<Script>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            model: "scripted-model".to_string(),
            script,
        }
    }

    pub fn boxed(name: &str, script: Arc<Script>) -> BoxProviderAdapter {
        BoxProviderAdapter::new(Self::new(
            name,
            ProviderKind::Custom("scripted".into()),
            script,
        ))
    }

    fn respond(&self, content: String) -> GenerationResponse {
        GenerationResponse {
            content,
            model: self.model.clone(),
            provider: self.name.clone(),
            usage: Usage::new(3, 5),
            finish_reason: Some("stop".into()),
            latency_ms: 1,
            annotations: ResponseAnnotations::default(),
        }
    }

    async fn next_generate(&self) -> Result<GenerationResponse, LlmError> {
        self.script.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.script.delay() {
            tokio::time::sleep(delay).await;
        }
        let queued = self.script.generate.lock().unwrap().pop_front();
        let outcome = match queued {
            Some(outcome) => outcome,
            None => match self.script.fail_all.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(format!("reply from {}", self.name)),
            },
        };
        outcome.map(|content| self.respond(content))
    }
}

impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate_text(&self, _prompt: &str) -> Result<GenerationResponse, LlmError> {
        self.next_generate().await
    }

    async fn chat_completion(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<GenerationResponse, LlmError> {
        self.next_generate().await
    }

    async fn health_probe(&self) -> Result<bool, LlmError> {
        self.script.probe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.script.delay() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.script.probe_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.script.probe_healthy.load(Ordering::SeqCst))
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(vec![self.model.clone()])
    }

    async fn close(&self) {
        self.script.closed.store(true, Ordering::SeqCst);
    }
}

/// Config for the scripted kind with fast retries.
pub(crate) fn scripted_config() -> ProviderConfig {
    ProviderConfig::new(
        ProviderKind::Custom("scripted".into()),
        "http://scripted.invalid",
        "scripted-model",
    )
    .with_timeout(Duration::from_secs(5))
    .with_max_retries(1)
}
