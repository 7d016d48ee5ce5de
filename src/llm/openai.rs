//! OpenAI-style chat completions adapter.
//!
//! Speaks the `/chat/completions` dialect against any OpenAI-compatible
//! base URL. Streaming accumulates incremental tool-call fragments per
//! index and emits complete calls with the terminal chunk.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{
    classify_http_error, map_eventsource_error, map_transport_error, parse_retry_after,
};
use super::{
    send_chunk, ChunkStream, CompletionRequest, CompletionResponse, FinishReason, HealthProbe,
    LlmError, Message, Provider, Role, StreamChunk, TokenUsage, ToolCall, ToolDefinition,
    MAX_SSE_EVENT_BYTES, MAX_TOOL_CALL_BUFFERS, STREAM_CHANNEL_CAPACITY,
};
use crate::auth::AuthProfile;

/// OpenAI-style provider for a fixed model on one base URL.
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    model: String,
    auth: Arc<AuthProfile>,
    context_window: u32,
    extra_headers: Vec<(&'static str, String)>,
}

impl OpenAiProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// Provider against the official OpenAI endpoint.
    pub fn new(model: impl Into<String>, auth: Arc<AuthProfile>, context_window: u32) -> Self {
        Self::with_base_url(Self::DEFAULT_BASE_URL, model, auth, context_window)
    }

    /// Provider against any OpenAI-compatible host.
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
            extra_headers: Vec::new(),
        }
    }

    /// Extra headers on every request (OpenRouter attribution).
    pub(crate) fn with_extra_headers(mut self, headers: Vec<(&'static str, String)>) -> Self {
        self.extra_headers = headers;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url.trim_end_matches('/'))
    }

    fn request_builder(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .bearer_auth(self.auth.current())
            .header("Content-Type", "application/json");
        for (name, value) in &self.extra_headers {
            builder = builder.header(*name, value);
        }
        builder
    }

    fn wire_request(&self, request: &CompletionRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            messages: to_wire_messages(&request.messages),
            tools: to_wire_tools(&request.tools),
            tool_choice: if request.tools.is_empty() {
                None
            } else {
                Some("auto".to_string())
            },
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stop: request.stop.clone(),
            stream,
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        let body = self.wire_request(request, false);
        tracing::debug!(model = %self.model, url = %self.completions_url(), "Sending completion request");

        let send = self.request_builder(&self.completions_url()).json(&body).send();
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
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::network("no choices in response"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect::<Vec<_>>();
        let finish_reason = parse_finish_reason(choice.finish_reason.as_deref(), !tool_calls.is_empty());

        Ok(CompletionResponse {
            content: choice.message.content,
            tool_calls,
            finish_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        let body = self.wire_request(request, true);
        let builder = self.request_builder(&self.completions_url()).json(&body);
        let mut source = EventSource::new(builder)
            .map_err(|e| LlmError::network(format!("failed to build event source: {e}")))?;

        // Drive to the first event so connection and auth failures surface
        // synchronously and the chain can fail over.
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
impl HealthProbe for OpenAiProvider {
    /// `GET /models`, the cheapest call exercising auth and connectivity.
    async fn check(&self, cancel: &CancellationToken) -> Result<(), LlmError> {
        let send = self
            .client
            .get(self.models_url())
            .bearer_auth(self.auth.current())
            .send();
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

/// Consume the event source, forwarding content deltas as they arrive and
/// accumulating tool-call fragments. The terminal chunk (finish reason,
/// flushed tool calls, trailing usage) is emitted when the upstream sends
/// `[DONE]` or closes. The source is closed on every exit path.
async fn run_stream(
    mut source: EventSource,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
) {
    let mut tools = ToolCallAccumulator::default();
    let mut finish_reason: Option<FinishReason> = None;
    let mut usage: Option<TokenUsage> = None;

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
        if message.data.trim() == "[DONE]" {
            break;
        }

        let event: WireStreamEvent = match serde_json::from_str(&message.data) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable stream event");
                continue;
            }
        };

        if let Some(wire_usage) = event.usage {
            usage = Some(TokenUsage::new(
                wire_usage.prompt_tokens,
                wire_usage.completion_tokens,
            ));
        }
        let Some(choice) = event.choices.into_iter().next() else {
            continue;
        };
        if let Some(reason) = choice.finish_reason.as_deref() {
            finish_reason = Some(parse_finish_reason(Some(reason), !tools.is_empty()));
        }
        if let Some(content) = choice.delta.content {
            if !content.is_empty()
                && !send_chunk(&tx, &cancel, StreamChunk::content(content)).await
            {
                source.close();
                return;
            }
        }
        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            if let Err(err) = tools.apply(fragment) {
                send_chunk(&tx, &cancel, StreamChunk::error(err)).await;
                source.close();
                return;
            }
        }
    }

    let tool_calls = tools.flush();
    let reason = finish_reason.unwrap_or(if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolUse
    });
    let terminal = StreamChunk {
        tool_calls,
        finish_reason: Some(reason),
        usage,
        ..StreamChunk::default()
    };
    send_chunk(&tx, &cancel, terminal).await;
    source.close();
}

/// Per-index accumulation of incremental tool-call fragments.
#[derive(Default)]
struct ToolCallAccumulator {
    buffers: BTreeMap<u32, PendingToolCall>,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn apply(&mut self, fragment: DeltaToolCall) -> Result<(), LlmError> {
        let index = fragment.index.unwrap_or(0);
        if !self.buffers.contains_key(&index) && self.buffers.len() >= MAX_TOOL_CALL_BUFFERS {
            return Err(LlmError::network("too many concurrent tool calls in stream"));
        }
        let pending = self.buffers.entry(index).or_default();
        if let Some(id) = fragment.id {
            pending.id = id;
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                pending.name = name;
            }
            if let Some(arguments) = function.arguments {
                pending.arguments.push_str(&arguments);
            }
        }
        Ok(())
    }

    /// Drain complete calls in index order.
    fn flush(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.buffers)
            .into_values()
            .map(|pending| ToolCall {
                id: pending.id,
                name: pending.name,
                arguments: pending.arguments,
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────────────────────────

fn parse_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolUse,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None if has_tool_calls => FinishReason::ToolUse,
        None => FinishReason::Stop,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Neutral messages in OpenAI form: system messages pass inline, assistant
/// tool calls become `tool_calls`, tool replies carry `tool_call_id`.
fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|message| {
            let content = if let Some(content) = &message.content {
                Some(serde_json::Value::String(content.clone()))
            } else {
                message
                    .content_parts
                    .as_ref()
                    .and_then(|parts| serde_json::to_value(parts).ok())
            };
            let tool_calls = if message.tool_calls.is_empty() {
                None
            } else {
                Some(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| WireToolCall {
                            id: call.id.clone(),
                            call_type: "function",
                            function: WireFunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect(),
                )
            };
            WireMessage {
                role: role_str(message.role),
                content,
                name: message.name.clone(),
                tool_call_id: message.tool_id.clone(),
                tool_calls,
            }
        })
        .collect()
}

fn to_wire_tools(tools: &[ToolDefinition]) -> Option<Vec<WireTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| WireTool {
                tool_type: "function",
                function: WireFunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireResponseToolCall {
    id: String,
    function: WireResponseFunction,
}

#[derive(Debug, Deserialize)]
struct WireResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireStreamEvent {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
