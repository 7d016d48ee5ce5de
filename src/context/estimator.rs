//! Approximate token estimation.
//!
//! The default estimator divides byte length by a per-language ratio and
//! rounds up. Real tokenizers diverge from it by up to ~20%, and the
//! mild over-estimate is deliberate: assembly must never produce a request
//! an upstream rejects for length. A BPE-based estimator can be swapped in
//! behind the same trait.

use crate::llm::{ContentPart, Message, ToolDefinition};

/// Framing cost per message (role tag + separators).
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Flat cost per image part, covering "auto" detail conservatively.
pub const IMAGE_PART_TOKENS: u32 = 765;

/// Pluggable text-to-token estimator.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Character-ratio estimator: `floor(bytes / ratio) + 1` for non-empty
/// input, `0` for empty.
#[derive(Debug, Clone)]
pub struct CharRatioEstimator {
    ratio: f32,
}

impl CharRatioEstimator {
    /// Ratio for mostly-English text (~4 bytes per token).
    pub const ENGLISH_RATIO: f32 = 4.0;
    /// Ratio for Latin languages with diacritics (~3 bytes per token).
    pub const LATIN_RATIO: f32 = 3.0;

    pub fn new(ratio: f32) -> Self {
        let ratio = if ratio > 0.0 {
            ratio
        } else {
            Self::ENGLISH_RATIO
        };
        Self { ratio }
    }

    pub fn english() -> Self {
        Self::new(Self::ENGLISH_RATIO)
    }

    pub fn latin() -> Self {
        Self::new(Self::LATIN_RATIO)
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::english()
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        (text.len() as f32 / self.ratio) as u32 + 1
    }
}

/// Estimate one message: framing overhead plus content, parts, tool label,
/// and tool-call names and argument blobs.
pub fn estimate_message(estimator: &dyn TokenEstimator, message: &Message) -> u32 {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS;
    if let Some(content) = &message.content {
        tokens = tokens.saturating_add(estimator.estimate(content));
    }
    if let Some(parts) = &message.content_parts {
        for part in parts {
            tokens = tokens.saturating_add(match part {
                ContentPart::Text { text } => estimator.estimate(text),
                ContentPart::ImageUrl { .. } => IMAGE_PART_TOKENS,
            });
        }
    }
    if let Some(name) = &message.name {
        tokens = tokens.saturating_add(estimator.estimate(name));
    }
    for call in &message.tool_calls {
        tokens = tokens
            .saturating_add(estimator.estimate(&call.name))
            .saturating_add(estimator.estimate(&call.arguments));
    }
    tokens
}

/// Estimate a whole history.
pub fn estimate_messages(estimator: &dyn TokenEstimator, messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_message(estimator, m))
        .fold(0, u32::saturating_add)
}

/// Estimate tool definitions from their JSON serialization, the form the
/// upstream actually sees on the wire.
pub fn estimate_tools(estimator: &dyn TokenEstimator, tools: &[ToolDefinition]) -> u32 {
    if tools.is_empty() {
        return 0;
    }
    match serde_json::to_string(tools) {
        Ok(json) => estimator.estimate(&json),
        Err(_) => 0,
    }
}

/// Join system prompt parts with a blank-line separator, skipping empties.
pub fn join_system_parts(parts: &[String]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
}
