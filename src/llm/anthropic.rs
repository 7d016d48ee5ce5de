//! Anthropic Messages API adapter.
//!
//! Anthropic's dialect differs from the OpenAI shape in three ways the
//! converter has to absorb: the system prompt is a dedicated top-level
//! field (only *leading* system messages qualify; later ones are dropped
//! with a warning), consecutive tool replies are grouped into a single
//! user message of `tool_result` blocks, and assistant turns mix text and
//! `tool_use` blocks in one content array.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{
    classify_http_error, map_eventsource_error, map_transport_error, parse_retry_after,
};
use super::{
    send_chunk, ChunkStream, CompletionRequest, CompletionResponse, ContentPart, FinishReason,
    HealthProbe, LlmError, Message, Provider, Role, StreamChunk, TokenUsage, ToolCall,
    ToolDefinition, MAX_SSE_EVENT_BYTES, MAX_TOOL_CALL_BUFFERS, STREAM_CHANNEL_CAPACITY,
};
use crate::auth::AuthProfile;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic requires an explicit output budget on every request.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages provider for a fixed model.
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    model: String,
    auth: Arc<AuthProfile>,
    context_window: u32,
}

impl AnthropicProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";

    pub fn new(model: impl Into<String>, auth: Arc<AuthProfile>, context_window: u32) -> Self {
        Self::with_base_url(Self::DEFAULT_BASE_URL, model, auth, context_window)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        model: impl Into<String>,
        auth: Arc<AuthProfile>,
        context_window: u32,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            auth,
            context_window,
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        self.client
            .post(self.messages_url())
            .header("x-api-key", self.auth.current())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn wire_request(&self, request: &CompletionRequest, stream: bool) -> WireRequest {
        let (system, messages) = translate_messages(&request.messages);
        WireRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            tools: translate_tools(&request.tools),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
            stream,
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        let body = self.wire_request(request, false);
        tracing::debug!(model = %self.model, "Sending Anthropic messages request");

        let send = self.request_builder().json(&body).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = send => result.map_err(map_transport_error)?,
        };

        let status = response.status();
        let retry_after = parse_retry_after(
            response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok()),
        );
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            text = response.text() => text.unwrap_or_default(),
        };
        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &text, retry_after));
        }

        let parsed: WireResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::network(format!("unparseable response: {e}")))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                WireResponseBlock::Text { text } => content.push_str(&text),
                WireResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                WireResponseBlock::Other => {}
            }
        }

        Ok(CompletionResponse {
            content: (!content.is_empty()).then_some(content),
            tool_calls,
            finish_reason: parse_stop_reason(parsed.stop_reason.as_deref()),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        let body = self.wire_request(request, true);
        let builder = self.request_builder().json(&body);
        let mut source = EventSource::new(builder)
            .map_err(|e| LlmError::network(format!("failed to build event source: {e}")))?;

        // First event decides synchronously between a live stream and an
        // initial-connection error.
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    source.close();
                    return Err(LlmError::Cancelled);
                }
                event = source.next() => event,
            };
            match event {
                Some(Ok(Event::Open)) => break,
                Some(Ok(Event::Message(_))) => break,
                Some(Err(err)) => {
                    source.close();
                    return Err(map_eventsource_error(err).await);
                }
                None => {
                    source.close();
                    return Err(LlmError::network("stream closed before opening"));
                }
            }
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_stream(source, tx, cancel).await;
        });
        Ok(rx)
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn health_probe(&self) -> Option<&dyn HealthProbe> {
        Some(self)
    }
}

#[async_trait]
impl HealthProbe for AnthropicProvider {
    /// A 1-token completion. Anthropic has no cheap listing endpoint that
    /// also exercises auth.
    async fn check(&self, cancel: &CancellationToken) -> Result<(), LlmError> {
        let body = json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        let send = self.request_builder().json(&body).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = send => result.map_err(map_transport_error)?,
        };
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify_http_error(status.as_u16(), &text, None))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Consume Anthropic stream events. Text deltas are forwarded as they
/// arrive; `tool_use` blocks accumulate their `input_json_delta` fragments
/// per block index and are emitted complete at `content_block_stop`. The
/// terminal chunk carries the stop reason and combined usage.
async fn run_stream(
    mut source: EventSource,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
) {
    let mut pending: BTreeMap<u32, PendingTool> = BTreeMap::new();
    let mut finish_reason: Option<FinishReason> = None;
    let mut input_tokens: u64 = 0;
    let mut output_tokens: u64 = 0;
    let mut saw_usage = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = source.next() => event,
        };
        let message = match event {
            Some(Ok(Event::Message(message))) => message,
            Some(Ok(Event::Open)) => continue,
            Some(Err(err)) => {
                let err = map_eventsource_error(err).await;
                send_chunk(&tx, &cancel, StreamChunk::error(err)).await;
                source.close();
                return;
            }
            None => break,
        };

        if message.data.len() > MAX_SSE_EVENT_BYTES {
            send_chunk(
                &tx,
                &cancel,
                StreamChunk::error(LlmError::network("oversized SSE event")),
            )
            .await;
            source.close();
            return;
        }

        let event: WireStreamEvent = match serde_json::from_str(&message.data) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable stream event");
                continue;
            }
        };

        match event {
            WireStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    input_tokens = usage.input_tokens.unwrap_or(0);
                    output_tokens = usage.output_tokens.unwrap_or(0);
                    saw_usage = true;
                }
            }
            WireStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if content_block.kind == "tool_use" {
                    if pending.len() >= MAX_TOOL_CALL_BUFFERS {
                        send_chunk(
                            &tx,
                            &cancel,
                            StreamChunk::error(LlmError::network(
                                "too many concurrent tool calls in stream",
                            )),
                        )
                        .await;
                        source.close();
                        return;
                    }
                    pending.insert(
                        index,
                        PendingTool {
                            id: content_block.id.unwrap_or_default(),
                            name: content_block.name.unwrap_or_default(),
                            arguments: String::new(),
                        },
                    );
                }
            }
            WireStreamEvent::ContentBlockDelta { index, delta } => match delta {
                WireBlockDelta::TextDelta { text } => {
                    if !text.is_empty()
                        && !send_chunk(&tx, &cancel, StreamChunk::content(text)).await
                    {
                        source.close();
                        return;
                    }
                }
                WireBlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = pending.get_mut(&index) {
                        tool.arguments.push_str(&partial_json);
                    }
                }
                WireBlockDelta::Other => {}
            },
            WireStreamEvent::ContentBlockStop { index } => {
                if let Some(tool) = pending.remove(&index) {
                    let chunk = StreamChunk {
                        tool_calls: vec![tool.into_tool_call()],
                        ..StreamChunk::default()
                    };
                    if !send_chunk(&tx, &cancel, chunk).await {
                        source.close();
                        return;
                    }
                }
            }
            WireStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    finish_reason = Some(parse_stop_reason(Some(reason)));
                }
                if let Some(usage) = usage {
                    if let Some(output) = usage.output_tokens {
                        output_tokens = output;
                        saw_usage = true;
                    }
                }
            }
            WireStreamEvent::MessageStop => break,
            WireStreamEvent::Error { error } => {
                let err = LlmError::provider_down(
                    529,
                    format!("{}: {}", error.kind, error.message),
                );
                send_chunk(&tx, &cancel, StreamChunk::error(err)).await;
                source.close();
                return;
            }
            WireStreamEvent::Ping => {}
        }
    }

    // Flush any tool blocks the upstream never closed, then terminate.
    let tool_calls: Vec<ToolCall> = std::mem::take(&mut pending)
        .into_values()
        .map(PendingTool::into_tool_call)
        .collect();
    let terminal = StreamChunk {
        tool_calls,
        finish_reason: Some(finish_reason.unwrap_or(FinishReason::Stop)),
        usage: saw_usage.then(|| TokenUsage::new(input_tokens, output_tokens)),
        ..StreamChunk::default()
    };
    send_chunk(&tx, &cancel, terminal).await;
    source.close();
}

struct PendingTool {
    id: String,
    name: String,
    arguments: String,
}

impl PendingTool {
    fn into_tool_call(self) -> ToolCall {
        ToolCall {
            id: self.id,
            name: self.name,
            arguments: if self.arguments.is_empty() {
                "{}".to_string()
            } else {
                self.arguments
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────────────────────────

fn parse_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        Some("refusal") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None => FinishReason::Stop,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message translation
// ─────────────────────────────────────────────────────────────────────────────

/// Split the neutral history into Anthropic's top-level system field and
/// user/assistant turns of content blocks.
fn translate_messages(messages: &[Message]) -> (Option<String>, Vec<WireMessage>) {
    let mut system_parts = Vec::new();
    let mut leading = true;
    let mut wire: Vec<WireMessage> = Vec::new();

    for message in messages {
        match message.role {
            Role::System => {
                if leading {
                    if let Some(text) = message.display_text() {
                        system_parts.push(text.to_string());
                    }
                } else {
                    tracing::warn!("Dropping non-leading system message for Anthropic upstream");
                }
            }
            Role::User => {
                leading = false;
                wire.push(WireMessage {
                    role: "user",
                    content: user_blocks(message),
                });
            }
            Role::Assistant => {
                leading = false;
                wire.push(WireMessage {
                    role: "assistant",
                    content: assistant_blocks(message),
                });
            }
            Role::Tool => {
                leading = false;
                let block = tool_result_block(message);
                // Consecutive tool replies share one user message.
                match wire.last_mut() {
                    Some(last) if last.role == "user" && last.is_tool_results() => {
                        last.content.push(block);
                    }
                    _ => wire.push(WireMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, wire)
}

fn user_blocks(message: &Message) -> Vec<WireBlock> {
    if let Some(content) = &message.content {
        return vec![WireBlock::Text {
            text: content.clone(),
        }];
    }
    message
        .content_parts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => WireBlock::Text { text: text.clone() },
            ContentPart::ImageUrl { image_url } => WireBlock::Image {
                source: json!({"type": "url", "url": image_url.url}),
            },
        })
        .collect()
}

fn assistant_blocks(message: &Message) -> Vec<WireBlock> {
    let mut blocks = Vec::new();
    if let Some(text) = message.display_text() {
        if !text.is_empty() {
            blocks.push(WireBlock::Text {
                text: text.to_string(),
            });
        }
    }
    for call in &message.tool_calls {
        let input = serde_json::from_str(&call.arguments)
            .unwrap_or_else(|_| json!({ "raw": call.arguments }));
        blocks.push(WireBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input,
        });
    }
    blocks
}

fn tool_result_block(message: &Message) -> WireBlock {
    WireBlock::ToolResult {
        tool_use_id: message.tool_id.clone().unwrap_or_default(),
        content: message.display_text().unwrap_or_default().to_string(),
        is_error: message.is_error.then_some(true),
    }
}

fn translate_tools(tools: &[ToolDefinition]) -> Option<Vec<WireTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| WireTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.parameters.clone(),
            })
            .collect(),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

impl WireMessage {
    fn is_tool_results(&self) -> bool {
        self.content
            .iter()
            .all(|block| matches!(block, WireBlock::ToolResult { .. }))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    Image {
        source: serde_json::Value,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
    MessageStart {
        message: WireStartMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: WireBlockStart,
    },
    ContentBlockDelta {
        index: u32,
        delta: WireBlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<WireStreamUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireStreamError,
    },
}

#[derive(Debug, Deserialize)]
struct WireStartMessage {
    #[serde(default)]
    usage: Option<WireStreamUsage>,
}

#[derive(Debug, Deserialize)]
struct WireBlockStart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireStreamError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}
