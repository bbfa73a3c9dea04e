//! Windows a growing conversation into a token-budgeted slice for each
//! model call, and decides when the oldest turns need folding into a
//! summary instead of being dropped outright.
//!
//! A precomputed-inputs struct feeds a pure assembly function, kept separate
//! from the async work that gathers those inputs; ranking/selection helpers
//! live colocated with the data they operate on.

use std::path::Path;

use orc_core::Message;
use orc_estimator::TokenEstimator;

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub ctx_size: usize,
    pub response_budget: usize,
    pub tools_budget: usize,
}

impl ContextConfig {
    pub fn new(ctx_size: usize, response_budget: usize, tools_budget: usize) -> Self {
        Self {
            ctx_size,
            response_budget,
            tools_budget,
        }
    }
}

/// Snapshot of how many tokens are spoken for before conversation history
/// gets a turn, and how much is left over for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    pub ctx_size: usize,
    pub system_tokens: usize,
    pub response_budget: usize,
    pub tools_budget: usize,
    pub memory_tokens: usize,
    pub summary_tokens: usize,
}

impl Budget {
    /// `ctxSize - systemTokens - responseBudget - toolsBudget - memoryTokens
    /// - summaryTokens`, floored at zero.
    pub fn available_for_history(&self) -> usize {
        self.ctx_size
            .saturating_sub(self.system_tokens)
            .saturating_sub(self.response_budget)
            .saturating_sub(self.tools_budget)
            .saturating_sub(self.memory_tokens)
            .saturating_sub(self.summary_tokens)
    }
}

/// Holds the pinned messages (system prompt, loaded context files, memory
/// digest, running summary) plus the growing conversational history, and
/// produces the windowed slice that actually goes upstream.
pub struct ContextManager {
    config: ContextConfig,
    estimator: TokenEstimator,
    system_message: Option<Message>,
    /// One synthetic system message per `add_context_file` call, in
    /// insertion order.
    context_files: Vec<Message>,
    /// Replaced wholesale by `set_memories`, never appended to incrementally.
    memories: Vec<Message>,
    summary_message: Option<Message>,
    history: Vec<Message>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, estimator: TokenEstimator) -> Self {
        Self {
            config,
            estimator,
            system_message: None,
            context_files: Vec::new(),
            memories: Vec::new(),
            summary_message: None,
            history: Vec::new(),
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_message = Some(Message::system(prompt));
    }

    /// Appends one more pinned context-file message, formatted as
    /// `"[File: <path>]\n<content>"`.
    pub fn add_context_file(&mut self, path: impl AsRef<str>, content: impl AsRef<str>) {
        self.context_files
            .push(Message::system(format!("[File: {}]\n{}", path.as_ref(), content.as_ref())));
    }

    pub fn clear_context_files(&mut self) {
        self.context_files.clear();
    }

    /// Wholesale-replaces the pinned memory messages.
    pub fn set_memories(&mut self, messages: Vec<Message>) {
        self.memories = messages;
    }

    pub fn clear_memories(&mut self) {
        self.memories.clear();
    }

    pub fn push(&mut self, msg: Message) {
        self.history.push(msg);
    }

    pub fn append_many(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.history.extend(messages);
    }

    /// Resets history and the running summary only; the system prompt,
    /// context files, and memory messages survive.
    pub fn clear(&mut self) {
        self.history.clear();
        self.summary_message = None;
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary_message.as_ref().map(|m| m.content.as_str())
    }

    /// Sets the running summary directly, formatted as the synthetic
    /// `"[Conversation summary] <summary>"` system message. Does not touch
    /// history; [`Self::apply_summary`] is the operation that also evicts
    /// the summarized prefix.
    pub fn set_summary(&mut self, summary: impl AsRef<str>) {
        self.summary_message = Some(Message::system(format!("[Conversation summary] {}", summary.as_ref())));
    }

    /// Overwrites the growing history wholesale — used by the agent loop's
    /// budget-gated tool-result truncation, which operates on a copy and
    /// writes the result back only once it no longer overflows.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        self.history = history;
    }

    fn pinned_tokens(&self) -> (usize, usize, usize) {
        let system = self
            .system_message
            .as_ref()
            .map(|m| self.estimator.estimate_messages(std::slice::from_ref(m)))
            .unwrap_or(0)
            + self.estimator.estimate_messages(&self.context_files);
        let memory = self.estimator.estimate_messages(&self.memories);
        let summary = self
            .summary_message
            .as_ref()
            .map(|m| self.estimator.estimate_messages(std::slice::from_ref(m)))
            .unwrap_or(0);
        (system, memory, summary)
    }

    pub fn budget(&self) -> Budget {
        let (system_tokens, memory_tokens, summary_tokens) = self.pinned_tokens();
        Budget {
            ctx_size: self.config.ctx_size,
            system_tokens,
            response_budget: self.config.response_budget,
            tools_budget: self.config.tools_budget,
            memory_tokens,
            summary_tokens,
        }
    }

    /// The pinned messages followed by as much recent history as the
    /// available budget allows, oldest-first.
    pub fn messages(&self) -> Vec<Message> {
        let available = self.budget().available_for_history();
        let mut out = Vec::new();
        if let Some(m) = &self.system_message {
            out.push(m.clone());
        }
        out.extend(self.context_files.iter().cloned());
        out.extend(self.memories.iter().cloned());
        if let Some(m) = &self.summary_message {
            out.push(m.clone());
        }
        out.extend(self.window_history(available));
        out
    }

    /// Walk the history from most-recent backward, keeping whole messages
    /// while they fit; stop at the first message that would overflow. The
    /// kept suffix is returned oldest-first.
    fn window_history(&self, available: usize) -> Vec<Message> {
        let mut used = 0usize;
        let mut kept = Vec::new();
        for msg in self.history.iter().rev() {
            let cost = self.estimator.estimate_messages(std::slice::from_ref(msg));
            if used + cost > available {
                break;
            }
            used += cost;
            kept.push(msg.clone());
        }
        kept.reverse();
        kept
    }

    /// True when the full (unwindowed) history no longer fits the budget —
    /// i.e. the next `messages()` call would have to drop turns rather than
    /// include them all.
    pub fn needs_summary(&self) -> bool {
        let available = self.budget().available_for_history();
        self.estimator.estimate_messages(&self.history) > available
    }

    /// Select a prefix of the oldest history to fold into a summary, capped
    /// at half of `ctx_size` worth of estimated tokens, and the remaining
    /// suffix that should stay verbatim. Does not call the model — callers
    /// summarize the returned prefix and pass the result to
    /// [`Self::apply_summary`].
    pub fn plan_summary(&self) -> (Vec<Message>, Vec<Message>) {
        let cap = self.config.ctx_size / 2;
        let mut used = 0usize;
        let mut split = 0usize;
        for (i, msg) in self.history.iter().enumerate() {
            let cost = self.estimator.estimate_messages(std::slice::from_ref(msg));
            if used + cost > cap {
                break;
            }
            used += cost;
            split = i + 1;
        }
        (self.history[..split].to_vec(), self.history[split..].to_vec())
    }

    /// Replace the running summary and drop the history prefix it now
    /// covers, keeping the untouched suffix verbatim. `summary` is the raw
    /// text returned by the summarization completion; it is wrapped in the
    /// same `"[Conversation summary] ..."` framing `set_summary` uses.
    pub fn apply_summary(&mut self, summary: impl AsRef<str>, remaining_history: Vec<Message>) {
        self.set_summary(summary);
        self.history = remaining_history;
    }
}

/// Loads a context file from disk and wraps it as a pinned system-role
/// message, or returns `None` if the path doesn't exist (not configuring one
/// is a normal deployment, not an error).
pub async fn load_context_file(path: &Path) -> anyhow::Result<Option<Message>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(Message::system(content))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
