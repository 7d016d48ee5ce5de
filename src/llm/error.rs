//! LLM error taxonomy with retry classification.
//!
//! Distinguishes between retryable errors (fail over to the next provider)
//! and terminal errors (surface to the caller unchanged).

use std::time::Duration;

use thiserror::Error;

use crate::chain::ProviderRole;

/// Error from LLM operations.
///
/// Cancellation is its own variant and is never reclassified as a provider
/// failure; the chain surfaces it without touching health state.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Upstream throttled the request (HTTP 429).
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        /// Suggested retry delay from the Retry-After header, if present.
        retry_after: Option<Duration>,
    },

    /// Transport failure or server error (5xx, 529, network).
    #[error("provider unavailable{}: {message}", fmt_status(.status))]
    ProviderDown {
        message: String,
        status: Option<u16>,
    },

    /// The request exceeds the model's context window.
    #[error("context length exceeded: {message}")]
    ContextLength { message: String },

    /// Bad or forbidden credentials (HTTP 401/403).
    #[error("authentication failed{}: {message}", fmt_status(.status))]
    Authentication {
        message: String,
        status: Option<u16>,
    },

    /// No chain entry is configured for the requested role.
    #[error("no provider configured for role '{role}'")]
    NoProvider { role: ProviderRole },

    /// Every candidate was tried (or unavailable) and none succeeded.
    #[error("all providers failed: {message}")]
    AllProviders {
        message: String,
        #[source]
        source: Option<Box<LlmError>>,
    },

    /// The summarizer failed during history compaction.
    #[error("compaction failed")]
    CompactionFailed {
        #[source]
        source: Box<LlmError>,
    },

    /// An auth profile was created with no keys.
    #[error("auth profile requires at least one key")]
    NoKeys,

    /// The caller cancelled the operation or its deadline elapsed.
    #[error("operation cancelled")]
    Cancelled,
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl LlmError {
    /// Create a rate limit error.
    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Create a provider-down error from an HTTP status.
    pub fn provider_down(status: u16, message: impl Into<String>) -> Self {
        Self::ProviderDown {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create a provider-down error for a network failure (no status).
    pub fn network(message: impl Into<String>) -> Self {
        Self::ProviderDown {
            message: message.into(),
            status: None,
        }
    }

    /// Create a context-length error.
    pub fn context_length(message: impl Into<String>) -> Self {
        Self::ContextLength {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn authentication(status: u16, message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Wrap the last failure after exhausting every candidate.
    pub fn all_providers(message: impl Into<String>, last: Option<LlmError>) -> Self {
        Self::AllProviders {
            message: message.into(),
            source: last.map(Box::new),
        }
    }

    /// Whether failing over to the next candidate can help.
    ///
    /// True exactly for `RateLimit` and `ProviderDown`. Everything else
    /// terminates failover: the error would reproduce on any provider
    /// (`ContextLength`), or retrying is pointless (`Authentication`), or
    /// the error is not a provider outcome at all.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::ProviderDown { .. })
    }

    /// Whether this error is a rate limit (triggers key rotation).
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimit { .. })
    }

    /// Whether this error is the cancellation passthrough.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Markers that identify a context-window overflow in a 400 response.
const CONTEXT_LENGTH_MARKERS: &[&str] = &[
    "context length",
    "context_length",
    "maximum context",
    "token limit",
    "prompt is too long",
];

/// Classify an HTTP error response into the taxonomy.
///
/// `body` is the raw response body. For 400s the structured error payload
/// (`error.message` / `error.code` / `error.type`) is checked for
/// context-length markers before falling back to the raw text, so a user
/// message that merely mentions "token limit" cannot misclassify an
/// unrelated validation error.
pub fn classify_http_error(status: u16, body: &str, retry_after: Option<Duration>) -> LlmError {
    match status {
        429 => LlmError::rate_limit(trimmed(body), retry_after),
        401 | 403 => LlmError::authentication(status, trimmed(body)),
        400 => {
            if is_context_length_body(body) {
                LlmError::context_length(trimmed(body))
            } else {
                // Other 400s are terminal request errors; keep the status
                // so callers can see what the upstream rejected.
                LlmError::Authentication {
                    message: trimmed(body),
                    status: Some(status),
                }
            }
        }
        s if s >= 500 => LlmError::provider_down(status, trimmed(body)),
        _ => LlmError::provider_down(status, trimmed(body)),
    }
}

/// Detect a context-window overflow in an error body.
///
/// Checks the structured payload first, then the raw text.
pub fn is_context_length_body(body: &str) -> bool {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let error = value.get("error").unwrap_or(&value);
        for field in ["message", "code", "type"] {
            if let Some(text) = error.get(field).and_then(|v| v.as_str()) {
                if contains_context_marker(text) {
                    return true;
                }
            }
        }
        return false;
    }
    contains_context_marker(body)
}

fn contains_context_marker(text: &str) -> bool {
    let lowered = text.to_lowercase();
    CONTEXT_LENGTH_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn trimmed(body: &str) -> String {
    const MAX_BODY: usize = 600;
    let body = body.trim();
    if body.len() <= MAX_BODY {
        body.to_string()
    } else {
        let mut end = MAX_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    }
}

/// Parse a Retry-After header value (seconds form only).
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Map a reqwest transport failure into the taxonomy.
pub(crate) fn map_transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::network(format!("request timeout: {e}"))
    } else if e.is_connect() {
        LlmError::network(format!("connection failed: {e}"))
    } else {
        LlmError::network(format!("request failed: {e}"))
    }
}

/// Map an event-source failure into the taxonomy. Reads the response body
/// on HTTP errors so 400s can be told apart from real outages.
pub(crate) async fn map_eventsource_error(err: reqwest_eventsource::Error) -> LlmError {
    use reqwest_eventsource::Error;
    match err {
        Error::InvalidStatusCode(status, response) => {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok()),
            );
            let body = response.text().await.unwrap_or_default();
            classify_http_error(status.as_u16(), &body, retry_after)
        }
        Error::Transport(e) => map_transport_error(e),
        Error::StreamEnded => LlmError::network("stream ended unexpectedly"),
        other => LlmError::network(format!("event stream error: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::rate_limit("slow down", None).is_retryable());
        assert!(LlmError::provider_down(503, "unavailable").is_retryable());
        assert!(LlmError::network("connection reset").is_retryable());
        assert!(!LlmError::context_length("too long").is_retryable());
        assert!(!LlmError::authentication(401, "bad key").is_retryable());
        assert!(!LlmError::NoKeys.is_retryable());
        assert!(!LlmError::Cancelled.is_retryable());
        assert!(!LlmError::all_providers("exhausted", None).is_retryable());
    }

    #[test]
    fn http_status_classification() {
        assert!(matches!(
            classify_http_error(429, "limit", None),
            LlmError::RateLimit { .. }
        ));
        assert!(matches!(
            classify_http_error(500, "boom", None),
            LlmError::ProviderDown {
                status: Some(500),
                ..
            }
        ));
        assert!(matches!(
            classify_http_error(529, "overloaded", None),
            LlmError::ProviderDown { .. }
        ));
        assert!(matches!(
            classify_http_error(401, "nope", None),
            LlmError::Authentication { .. }
        ));
        assert!(matches!(
            classify_http_error(403, "forbidden", None),
            LlmError::Authentication { .. }
        ));
    }

    #[test]
    fn context_length_detected_in_structured_payload() {
        let body = r#"{"error":{"message":"This model's maximum context length is 8192 tokens","type":"invalid_request_error","code":"context_length_exceeded"}}"#;
        assert!(matches!(
            classify_http_error(400, body, None),
            LlmError::ContextLength { .. }
        ));
    }

    #[test]
    fn plain_400_is_not_context_length() {
        let body = r#"{"error":{"message":"Invalid value for temperature","type":"invalid_request_error"}}"#;
        assert!(!matches!(
            classify_http_error(400, body, None),
            LlmError::ContextLength { .. }
        ));
    }

    #[test]
    fn structured_payload_wins_over_raw_text() {
        // The marker appears outside the error object; the structured
        // payload says this is a validation error, so it stays one.
        let body = r#"{"error":{"message":"bad request"},"echo":"user said token limit"}"#;
        assert!(!is_context_length_body(body));
    }

    #[test]
    fn raw_text_fallback_for_unstructured_bodies() {
        assert!(is_context_length_body("request exceeds the token limit"));
        assert!(!is_context_length_body("internal error"));
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after(Some("30")), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(Some(" 5 ")), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn all_providers_preserves_last_cause() {
        let err = LlmError::all_providers(
            "2 candidates tried",
            Some(LlmError::provider_down(502, "bad gateway")),
        );
        let LlmError::AllProviders { source, .. } = &err else {
            panic!("expected AllProviders");
        };
        assert!(matches!(
            source.as_deref(),
            Some(LlmError::ProviderDown { .. })
        ));
    }
}
