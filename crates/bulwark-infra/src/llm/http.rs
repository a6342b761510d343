//! Shared HTTP status and transport error mapping for the adapters.

use std::sync::Mutex;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use bulwark_types::llm::LlmError;

/// Build the HTTP client every adapter uses, with the per-call deadline.
pub(crate) fn build_client(timeout: std::time::Duration) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LlmError::Connection(format!("failed to create HTTP client: {e}")))
}

/// An adapter's client, held until `close` drops it and with it the
/// connection pool. Calls made after that fail with a connection error.
pub(crate) struct ClientSlot<T>(Mutex<Option<T>>);

impl<T: Clone> ClientSlot<T> {
    pub(crate) fn new(client: T) -> Self {
        Self(Mutex::new(Some(client)))
    }

    pub(crate) fn get(&self) -> Result<T, LlmError> {
        self.0
            .lock()
            .expect("client slot lock poisoned")
            .clone()
            .ok_or_else(|| LlmError::Connection("adapter closed".to_string()))
    }

    /// Drop the client. Returns false if it was already released.
    pub(crate) fn release(&self) -> bool {
        self.0.lock().expect("client slot lock poisoned").take().is_some()
    }
}

/// Map a failed send (no response) to an [`LlmError`].
pub(crate) fn map_transport_error(err: reqwest::Error, timeout_ms: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout { timeout_ms }
    } else if err.is_decode() {
        LlmError::Deserialization(format!("failed to parse response: {err}"))
    } else {
        LlmError::Connection(format!("HTTP request failed: {err}"))
    }
}

/// Map a non-success status to an [`LlmError`].
///
/// `model` is set for calls that target a model; only those turn a 404 into
/// [`LlmError::ModelNotFound`]. A 404 anywhere else means a wrong endpoint.
pub(crate) fn map_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    model: Option<&str>,
) -> LlmError {
    match (status.as_u16(), model) {
        (400 | 422, _) => LlmError::InvalidRequest(format!("HTTP {status}: {body}")),
        (401 | 403, _) => LlmError::AuthenticationFailed,
        (404, Some(model)) => LlmError::ModelNotFound(model.to_string()),
        (429, _) => LlmError::RateLimited {
            retry_after_ms: retry_after_ms(headers),
        },
        _ => LlmError::Provider {
            message: format!("HTTP {status}: {body}"),
        },
    }
}

/// `Retry-After` in delay-seconds form, converted to milliseconds.
fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1_000))
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn test_status_mapping() {
        let headers = HeaderMap::new();
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, &headers, "", Some("m")),
            LlmError::AuthenticationFailed
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, &headers, "", Some("llama3")),
            LlmError::ModelNotFound(ref m) if m == "llama3"
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, &headers, "bad", Some("m")),
            LlmError::InvalidRequest(_)
        ));
        let err = map_status(StatusCode::BAD_GATEWAY, &headers, "upstream", Some("m"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_found_without_model_is_provider_error() {
        let err = map_status(StatusCode::NOT_FOUND, &HeaderMap::new(), "no route", None);
        assert!(matches!(err, LlmError::Provider { ref message } if message.contains("no route")));
    }

    #[test]
    fn test_released_client_slot_fails_calls() {
        let slot = ClientSlot::new(7_u32);
        assert_eq!(slot.get().unwrap(), 7);
        assert!(slot.release());
        assert!(!slot.release());
        assert!(matches!(slot.get(), Err(LlmError::Connection(_))));
    }

    #[test]
    fn test_rate_limit_reads_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, &headers, "", None),
            LlmError::RateLimited {
                retry_after_ms: Some(3_000)
            }
        ));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, &headers, "", None),
            LlmError::RateLimited {
                retry_after_ms: None
            }
        ));
    }
}
