//! Token-budgeted prompt assembly.
//!
//! The assembler composes the system prompt (with an optional memory
//! section), accounts for fixed costs, compacts oversized history through
//! the [`Compactor`], and trims what remains to the history budget. It is
//! CPU-only except for the single summarizer call compaction may make.

pub mod budget;
pub mod compactor;
pub mod estimator;

pub use budget::ContextBudget;
pub use compactor::{Compactor, Summarizer, SUMMARY_PREFIX};
pub use estimator::{CharRatioEstimator, TokenEstimator};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::llm::{CompletionRequest, LlmError, Message, Role, ToolDefinition};

/// Heading of the memory section appended to the system prompt.
const MEMORY_HEADING: &str = "## Relevant Memory";

/// Caps for the context engine.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Hard window override; 0 means "use the request's window".
    pub max_context_tokens: u32,
    /// Tokens held back for the model's reply.
    pub reserved_for_reply: u32,
    /// Message count above which proactive compaction runs.
    pub compaction_threshold: usize,
    /// Tail kept intact through normal compaction.
    pub retain_recent: usize,
    /// Tail kept through emergency truncation.
    pub emergency_retain: usize,
    /// Token ceiling for the memory section.
    pub max_memory_tokens: u32,
    /// Maximum number of memory facts included.
    pub max_memory_facts: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 0,
            reserved_for_reply: 1024,
            compaction_threshold: 20,
            retain_recent: 20,
            emergency_retain: 5,
            max_memory_tokens: 2000,
            max_memory_facts: 10,
        }
    }
}

/// One assembly request from the agent loop.
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    /// The target model's context window.
    pub window_size: u32,
    /// System prompt parts, joined with blank lines.
    pub system_parts: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    pub history: Vec<Message>,
    /// Retrieved memory facts, most relevant first.
    pub memory_facts: Vec<String>,
}

/// The assembled prompt, ready to become a completion request.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub budget: ContextBudget,
    /// Whether proactive compaction ran during this assembly.
    pub compacted: bool,
}

impl AssembledContext {
    /// Turn the assembly into a neutral completion request, with the
    /// system prompt leading the message list.
    pub fn into_completion_request(self, max_tokens: Option<u32>) -> CompletionRequest {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(Message::system(self.system_prompt));
        }
        messages.extend(self.messages);
        CompletionRequest {
            messages,
            tools: self.tools,
            max_tokens,
            ..CompletionRequest::default()
        }
    }
}

/// System-prompt composition, budgeting, compaction, and trimming.
pub struct ContextAssembler {
    config: ContextConfig,
    estimator: Arc<dyn TokenEstimator>,
    compactor: Option<Compactor>,
}

impl ContextAssembler {
    /// Create an assembler with the default character-ratio estimator and
    /// no compactor.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            estimator: Arc::new(CharRatioEstimator::default()),
            compactor: None,
        }
    }

    /// Substitute the token estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Attach a summarizer, enabling summarize-compaction. Without one the
    /// compactor drops old turns instead.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        let compactor = self
            .compactor
            .take()
            .unwrap_or_else(|| self.default_compactor())
            .with_summarizer(summarizer);
        self.compactor = Some(compactor);
        self
    }

    /// Enable drop-compaction with the configured thresholds.
    pub fn with_compaction(mut self) -> Self {
        if self.compactor.is_none() {
            self.compactor = Some(self.default_compactor());
        }
        self
    }

    fn default_compactor(&self) -> Compactor {
        Compactor::new(
            self.config.compaction_threshold,
            self.config.retain_recent,
            self.config.emergency_retain,
        )
    }

    /// Assemble a prompt under the token budget.
    ///
    /// Fails only for `CompactionFailed` (and cancellation during the
    /// summarizer call); every other shortage is absorbed by trimming.
    pub async fn assemble(
        &self,
        request: &ContextRequest,
        cancel: &CancellationToken,
    ) -> Result<AssembledContext, LlmError> {
        let history = request.history.clone();
        self.assemble_with(request, history, true, cancel).await
    }

    /// Re-assembly path for `ContextLength` failures: truncate history to
    /// the emergency tail and assemble without proactive compaction (no
    /// summarizer call).
    pub async fn assemble_emergency(
        &self,
        request: &ContextRequest,
        cancel: &CancellationToken,
    ) -> Result<AssembledContext, LlmError> {
        let start = request
            .history
            .len()
            .saturating_sub(self.config.emergency_retain);
        let tail = request.history[start..].to_vec();
        self.assemble_with(request, tail, false, cancel).await
    }

    async fn assemble_with(
        &self,
        request: &ContextRequest,
        history: Vec<Message>,
        allow_compaction: bool,
        cancel: &CancellationToken,
    ) -> Result<AssembledContext, LlmError> {
        // 1. Effective window.
        let window = if self.config.max_context_tokens != 0 {
            self.config.max_context_tokens
        } else {
            request.window_size
        };

        // 2. System prompt: joined parts plus the capped memory section.
        let base_system = estimator::join_system_parts(&request.system_parts);
        let memory_section = self.memory_section(&request.memory_facts);
        let system_prompt = match &memory_section {
            Some(section) if base_system.is_empty() => section.clone(),
            Some(section) => format!("{base_system}\n\n{section}"),
            None => base_system.clone(),
        };

        // 3. Fixed costs and the history budget.
        let system_tokens = self.estimator.estimate(&base_system);
        let memory_tokens = memory_section
            .as_deref()
            .map(|s| self.estimator.estimate(s))
            .unwrap_or(0);
        let tools_tokens = estimator::estimate_tools(self.estimator.as_ref(), &request.tools);
        let history_budget = window
            .saturating_sub(system_tokens)
            .saturating_sub(memory_tokens)
            .saturating_sub(tools_tokens)
            .saturating_sub(self.config.reserved_for_reply);

        // 4. Proactive compaction.
        let mut compacted = false;
        let mut messages = history;
        if allow_compaction {
            if let Some(compactor) = &self.compactor {
                if compactor.should_compact(&messages) {
                    messages = compactor.compact(&messages, cancel).await?;
                    compacted = true;
                }
            }
        }

        // 5. Trim to fit.
        self.trim_history(&mut messages, history_budget);

        // 6. Final accounting.
        let history_tokens = estimator::estimate_messages(self.estimator.as_ref(), &messages);
        let budget = ContextBudget {
            window,
            system: system_tokens,
            tools: tools_tokens,
            memory: memory_tokens,
            history: history_tokens,
            reserved: self.config.reserved_for_reply,
        };

        Ok(AssembledContext {
            system_prompt,
            messages,
            tools: request.tools.clone(),
            budget,
            compacted,
        })
    }

    /// Format the memory section: facts as a Markdown list under the
    /// heading, capped by count first and then by estimated tokens
    /// (dropping trailing facts until the section fits).
    fn memory_section(&self, facts: &[String]) -> Option<String> {
        if facts.is_empty() {
            return None;
        }
        let mut kept: Vec<&String> = facts.iter().take(self.config.max_memory_facts).collect();
        while !kept.is_empty() {
            let section = format_memory(&kept);
            if self.estimator.estimate(&section) <= self.config.max_memory_tokens {
                if kept.len() < facts.len() {
                    tracing::debug!(
                        kept = kept.len(),
                        total = facts.len(),
                        "Dropped trailing memory facts to fit the memory budget"
                    );
                }
                return Some(section);
            }
            kept.pop();
        }
        None
    }

    /// Drop history from the head until it fits the budget.
    ///
    /// A system-role message at index 0 is a compaction summary and is
    /// pinned; trimming then removes from index 1. At least one message
    /// survives whenever the history was non-empty, even if it alone
    /// exceeds the budget (the caller's emergency path handles that).
    /// History that already fits is left alone; trimming never
    /// re-summarizes.
    fn trim_history(&self, messages: &mut Vec<Message>, budget: u32) {
        if messages.is_empty() {
            return;
        }
        let estimator = self.estimator.as_ref();
        if estimator::estimate_messages(estimator, messages) <= budget {
            return;
        }

        let pinned = messages[0].role == Role::System;
        let drop_index = usize::from(pinned);
        let mut dropped = 0usize;
        while messages.len() > drop_index + 1
            && estimator::estimate_messages(estimator, messages) > budget
        {
            messages.remove(drop_index);
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(
                dropped,
                retained = messages.len(),
                pinned_summary = pinned,
                "Trimmed history to fit the token budget"
            );
        }
    }
}

fn format_memory(facts: &[&String]) -> String {
    let mut section = String::from(MEMORY_HEADING);
    for fact in facts {
        section.push_str("\n- ");
        section.push_str(fact);
    }
    section
}
