//! Conversation compaction.
//!
//! Keeps history within reach of the context budget by summarizing (or
//! dropping) older turns, leaving a recent tail intact. The summary rides
//! in-band as a system message at index 0 with a fixed prefix; the
//! assembler recognizes and pins it during trimming.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmError, Message};

/// Literal prefix of the in-band summary message.
pub const SUMMARY_PREFIX: &str = "[Conversation Summary]\n";

/// Capability for turning old history into a short text summary.
///
/// Implemented by the agent loop over an `internal`-role provider; the
/// core only ever calls it from here.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, LlmError>;
}

/// Summarize-or-drop reduction of old history.
#[derive(Clone)]
pub struct Compactor {
    /// Message count above which `should_compact` fires.
    threshold: usize,
    /// Tail kept intact through normal compaction.
    retain_recent: usize,
    /// Tail kept through emergency truncation.
    emergency_retain: usize,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl Compactor {
    pub fn new(threshold: usize, retain_recent: usize, emergency_retain: usize) -> Self {
        Self {
            threshold,
            retain_recent,
            emergency_retain,
            summarizer: None,
        }
    }

    /// Attach a summarizer; without one, compaction drops old turns.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Cheap message-count trigger. The assembler still performs the final
    /// token check.
    pub fn should_compact(&self, history: &[Message]) -> bool {
        history.len() > self.threshold
    }

    /// Reduce `history` by summarizing (or dropping) everything before the
    /// retained tail. A summarizer failure surfaces as `CompactionFailed`;
    /// cancellation passes through unchanged.
    pub async fn compact(
        &self,
        history: &[Message],
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, LlmError> {
        if history.len() <= self.retain_recent {
            return Ok(history.to_vec());
        }
        let split = history.len() - self.retain_recent;
        let (old, recent) = history.split_at(split);

        match &self.summarizer {
            Some(summarizer) => {
                let summary = summarizer.summarize(old, cancel).await.map_err(|err| {
                    if err.is_cancelled() {
                        LlmError::Cancelled
                    } else {
                        LlmError::CompactionFailed {
                            source: Box::new(err),
                        }
                    }
                })?;
                tracing::debug!(
                    summarized = old.len(),
                    retained = recent.len(),
                    "Compacted history with summary"
                );
                let mut compacted = Vec::with_capacity(recent.len() + 1);
                compacted.push(Message::system(format!("{SUMMARY_PREFIX}{summary}")));
                compacted.extend_from_slice(recent);
                Ok(compacted)
            }
            None => {
                tracing::debug!(
                    dropped = old.len(),
                    retained = recent.len(),
                    "Compacted history by dropping old turns"
                );
                Ok(recent.to_vec())
            }
        }
    }

    /// Last-resort truncation to the emergency tail. No summarizer call;
    /// returns an owned copy so the caller's slice is never aliased.
    pub fn emergency_compact(&self, history: &[Message]) -> Vec<Message> {
        let start = history.len().saturating_sub(self.emergency_retain);
        history[start..].to_vec()
    }
}
