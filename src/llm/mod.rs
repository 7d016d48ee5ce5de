//! Neutral LLM types and the provider abstraction.
//!
//! This module defines the request/response/stream contract consumed by all
//! upstreams, with adapters for Anthropic, OpenAI-style hosts, and
//! OpenRouter.
//!
//! Supports multimodal content (text + images) for vision-capable models.

pub mod anthropic;
mod error;
pub mod openai;
pub mod openrouter;

pub use anthropic::AnthropicProvider;
pub use error::{classify_http_error, is_context_length_body, parse_retry_after, LlmError};
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bound on in-flight chunks per stream. Producers block (or select on
/// cancellation) when the consumer falls this far behind.
pub const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Cap on a single SSE event payload. Large enough for big tool-argument
/// fragments, small enough to bound memory on a misbehaving upstream.
pub const MAX_SSE_EVENT_BYTES: usize = 1024 * 1024;

/// Cap on tool-call buffers accumulating concurrently within one stream.
pub const MAX_TOOL_CALL_BUFFERS: usize = 100;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Content part for multimodal messages (text or image).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content
    Text { text: String },
    /// Image URL content (for vision models)
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

/// Image URL wrapper for vision content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageUrl {
    pub url: String,
    /// Optional detail level: "auto", "low", or "high"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ContentPart {
    /// Create a text content part.
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Create an image URL content part.
    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: None,
            },
        }
    }

    /// Create an image URL content part with a detail level.
    pub fn image_url_with_detail(url: impl Into<String>, detail: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: Some(detail.into()),
            },
        }
    }
}

/// A message in a chat conversation.
///
/// Either `content` or `content_parts` is populated; when both are present
/// `content` wins for display. `tool_id` links a `Tool` reply to the
/// assistant tool call it answers; `tool_calls` is non-empty only on
/// `Assistant` messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_parts: Option<Vec<ContentPart>>,
    /// Tool label, if this message carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// For `Tool` messages: the id of the tool call being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Marks a tool reply that reports a failure rather than a result.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: Some(content.into()),
            content_parts: None,
            name: None,
            tool_id: None,
            tool_calls: Vec::new(),
            is_error: false,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Message::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::new(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message {
            role: Role::Assistant,
            content,
            content_parts: None,
            name: None,
            tool_id: None,
            tool_calls,
            is_error: false,
        }
    }

    /// Create a tool reply answering the call with id `tool_id`.
    pub fn tool(tool_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: Some(content.into()),
            content_parts: None,
            name: None,
            tool_id: Some(tool_id.into()),
            tool_calls: Vec::new(),
            is_error: false,
        }
    }

    /// Create a multimodal user message from parts.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Message {
            role: Role::User,
            content: None,
            content_parts: Some(parts),
            name: None,
            tool_id: None,
            tool_calls: Vec::new(),
            is_error: false,
        }
    }

    /// Attach a tool label (builder style).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Mark this tool reply as an error report.
    pub fn as_error(mut self) -> Self {
        self.is_error = true;
        self
    }

    /// The message text for display: `content` when set, otherwise the
    /// first text part.
    pub fn display_text(&self) -> Option<&str> {
        if let Some(content) = &self.content {
            return Some(content);
        }
        self.content_parts.as_deref()?.iter().find_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// A tool call requested by the model. `arguments` is the raw JSON blob as
/// the upstream produced it; the core never parses it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// Tool definition, passed through to the upstream verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A completion request in neutral form.
///
/// `None` on the numeric options means "vendor default". Zero is a legal
/// explicit value only for `max_tokens`.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of turn.
    Stop,
    /// Output token budget exhausted.
    Length,
    /// The model wants tool results before continuing.
    ToolUse,
    /// Content filtering intervened.
    ContentFilter,
    /// Vendor-specific reason passed through unchanged.
    Other(String),
}

/// Token usage reported by the upstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Response from a full (non-streaming) completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
}

/// One piece of an in-flight completion.
///
/// Any subset of the fields may be populated. A stream terminates with a
/// chunk carrying `finish_reason` or `error`; no chunks follow it.
#[derive(Debug, Default)]
pub struct StreamChunk {
    pub content_delta: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
    pub error: Option<LlmError>,
}

impl StreamChunk {
    /// A chunk carrying a piece of assistant text.
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content_delta: Some(text.into()),
            ..Self::default()
        }
    }

    /// A terminal chunk carrying the finish reason and any final usage.
    pub fn finished(reason: FinishReason, usage: Option<TokenUsage>) -> Self {
        Self {
            finish_reason: Some(reason),
            usage,
            ..Self::default()
        }
    }

    /// A terminal error chunk.
    pub fn error(error: LlmError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Whether this chunk ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some() || self.error.is_some()
    }
}

/// The receiving end of a completion stream.
pub type ChunkStream = mpsc::Receiver<StreamChunk>;

/// An upstream inference provider.
///
/// `stream` returns immediately with either a lazy finite chunk sequence or
/// an initial-connection error; auth and 4xx failures surface synchronously
/// so the chain can fail over, mid-stream failures arrive as error chunks.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Blocking full-response call.
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError>;

    /// Start a streaming call.
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError>;

    /// The model's context window, in tokens. Constant per instance.
    fn context_window(&self) -> u32;

    /// Opaque model identifier, for logs.
    fn model_name(&self) -> &str;

    /// Optional liveness capability. Providers that can answer a cheap
    /// auth+connectivity probe return `Some`; the chain's background prober
    /// uses it to revive dead entries.
    fn health_probe(&self) -> Option<&dyn HealthProbe> {
        None
    }
}

/// Cheapest call that exercises auth and connectivity for a provider.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, cancel: &CancellationToken) -> Result<(), LlmError>;
}

/// Send a chunk, selecting on cancellation. Returns false when the
/// consumer is gone or the operation was cancelled.
pub(crate) async fn send_chunk(
    tx: &mpsc::Sender<StreamChunk>,
    cancel: &CancellationToken,
    chunk: StreamChunk,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        result = tx.send(chunk) => result.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_prefers_content() {
        let mut msg = Message::user("plain");
        msg.content_parts = Some(vec![ContentPart::text("from parts")]);
        assert_eq!(msg.display_text(), Some("plain"));
    }

    #[test]
    fn display_text_falls_back_to_first_text_part() {
        let msg = Message::user_parts(vec![
            ContentPart::image_url("https://example.com/a.png"),
            ContentPart::text("caption"),
        ]);
        assert_eq!(msg.display_text(), Some("caption"));
    }

    #[test]
    fn tool_reply_links_to_call() {
        let msg = Message::tool("call_1", "result").with_name("search");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("search"));
        assert!(!msg.is_error);
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn usage_total_is_consistent() {
        let usage = TokenUsage::new(100, 28);
        assert_eq!(usage.total_tokens, 128);
    }

    #[test]
    fn terminal_chunks() {
        assert!(!StreamChunk::content("hi").is_terminal());
        assert!(StreamChunk::finished(FinishReason::Stop, None).is_terminal());
        assert!(StreamChunk::error(LlmError::network("reset")).is_terminal());
    }

    #[test]
    fn message_roles_serialize_lowercase() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(json.contains(r#""role":"user""#));
    }
}
