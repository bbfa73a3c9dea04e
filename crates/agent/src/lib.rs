//! The agentic tool-use loop: sends the windowed context to the inference
//! subprocess, streams the reply, executes any requested tools, and repeats
//! until the model produces a final answer.
//!
//! Round-based tool-call loop with a `MAX_TOOL_ROUNDS` force-text-answer
//! fallback, and streaming tool-call delta accumulation keyed by index
//! (`HashMap<usize, (id, name, arguments)>`, latch-name-once /
//! append-arguments). Tool calls within one assistant turn are dispatched
//! **serially**, not concurrently — a deliberate scope reduction rather than
//! an oversight.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use orc_context::ContextManager;
use orc_core::{AgentError, ChatRequest, Message, ToolCall, ToolCallFunction};
use orc_estimator::TokenEstimator;
use orc_inference::{InferenceClient, StreamEvent};
use orc_tools::{ToolRegistry, ToolResult};

/// The orchestrator's only dependency on how a completion is actually
/// produced. `run` is otherwise a pure function of (messages, config, this):
/// tests inject a scripted implementation instead of a real subprocess.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>>;
}

#[async_trait]
impl CompletionClient for InferenceClient {
    async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>> {
        InferenceClient::chat_completion_stream(self, request).await
    }
}

const DEFAULT_MAX_ITERATIONS: usize = 25;
const DEFAULT_MAX_RESPONSE_TOKENS: u32 = 4096;
const STUCK_THRESHOLD: u32 = 3;
const MAX_NUDGES: u32 = 3;
const TOOL_RESULT_TRUNCATE_CHARS: usize = 200;
const TOOL_RESULT_TRUNCATE_TOKEN_THRESHOLD: usize = 50;

const NUDGE_MESSAGE: &str =
    "Do not guess or speculate. Use your tools to gather the actual information, then answer.";

const CONTINUATION_INTENT_PREFIXES: &[&str] = &[
    "let's ",
    "let me ",
    "i'll ",
    "i will ",
    "i'm going to ",
    "next,",
    "next ",
    "now,",
    "now ",
    "please wait",
    "here are the function calls",
    "here are the tool calls",
];

const CONTINUATION_SPECULATION_WORDS: &[&str] = &[
    "typically",
    "likely",
    "might be",
    "may be",
    "could be",
    "probably",
    "presumably",
    "unknown",
    "unclear",
    "further investigation",
    "would need to",
    "need to check",
    "need to verify",
];

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    /// `0` means effectively unbounded.
    pub max_iterations: usize,
    pub max_response_tokens: u32,
    /// When set, tool-result truncation runs at the start of every
    /// iteration once the full message list estimates above this budget.
    pub max_tokens: Option<usize>,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Lifecycle callbacks the orchestrator invokes as the loop runs. All
/// methods have no-op defaults so callers only override what they need.
pub trait Hooks: Send + Sync {
    fn on_content_delta(&self, _text: &str) {}
    fn on_thinking_done(&self) {}
    fn on_tool_call(&self, _call: &ToolCall) {}
    fn on_tool_result(&self, _call: &ToolCall, _result: &ToolResult) {}
    fn on_assistant_message(&self, _content: &str) {}
}

pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// Tracks consecutive failures per call fingerprint (`name:arguments`)
/// across the whole run: counts persist across iterations and only reset
/// to zero on a success.
#[derive(Default)]
struct StuckTracker {
    error_counts: HashMap<String, u32>,
}

impl StuckTracker {
    /// Records one call's outcome and returns its new consecutive-error
    /// count (0 after a success).
    fn record(&mut self, fingerprint: &str, is_error: bool) -> u32 {
        if !is_error {
            self.error_counts.remove(fingerprint);
            return 0;
        }
        let count = self.error_counts.entry(fingerprint.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// True once every call made this iteration has hit at least the
    /// threshold and at least one has exceeded it.
    fn is_stuck(&self, iteration_counts: &[u32]) -> bool {
        !iteration_counts.is_empty()
            && iteration_counts.iter().all(|&c| c >= STUCK_THRESHOLD)
            && iteration_counts.iter().any(|&c| c > STUCK_THRESHOLD)
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    r#type: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Run the agentic loop to completion and return the final assistant text.
/// The full message sequence (including tool calls and results) is visible
/// afterward via `context.history()`.
pub async fn run(
    client: &dyn CompletionClient,
    config: &AgentConfig,
    context: &mut ContextManager,
    tools: &ToolRegistry,
    hooks: &dyn Hooks,
    cancel: CancellationToken,
) -> Result<String, AgentError> {
    let estimator = TokenEstimator::new();
    let mut stuck = StuckTracker::default();
    let mut nudges_used = 0u32;
    let api_tools = tools.api_tools();
    let tools_json = if api_tools.is_empty() {
        None
    } else {
        Some(serde_json::to_value(&api_tools).expect("tool definitions are always serializable"))
    };

    let max_iterations = if config.max_iterations == 0 {
        usize::MAX
    } else {
        config.max_iterations
    };

    for _iteration in 0..max_iterations {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        if let Some(max_tokens) = config.max_tokens {
            truncate_context_in_place(context, &estimator, max_tokens);
        }

        let mut request = ChatRequest::new(config.model.clone(), context.messages());
        request.tools = tools_json.clone();
        request.max_tokens = Some(config.max_response_tokens);
        let (content, tool_calls, finish_reason) =
            stream_one_turn(client, &request, hooks, &cancel).await?;

        if finish_reason.as_deref() == Some("length") && tool_calls.is_empty() {
            // Truncated mid-generation; loop again without recording this
            // partial content as a turn.
            continue;
        }

        if !tool_calls.is_empty() {
            context.push(Message::assistant_tool_calls(tool_calls.clone()));

            let mut iteration_counts = Vec::with_capacity(tool_calls.len());

            for call in &tool_calls {
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }

                hooks.on_tool_call(call);
                let fingerprint = format!("{}:{}", call.function.name, call.function.arguments);

                let result = match tools.get(&call.function.name) {
                    None => ToolResult::error(format!("unknown tool: {}", call.function.name)),
                    Some(tool) => tool
                        .execute(cancel.clone(), &call.function.arguments)
                        .await
                        .map_err(AgentError::ToolInfrastructure)?,
                };
                hooks.on_tool_result(call, &result);

                let count = stuck.record(&fingerprint, result.is_error);
                iteration_counts.push(count);

                let output = if count >= STUCK_THRESHOLD {
                    format!(
                        "{}\n\n[This exact call has now failed repeatedly. Try different arguments \
                         or a different approach before calling it again.]",
                        result.output
                    )
                } else {
                    result.output.clone()
                };

                context.push(Message::tool_result(&call.id, &call.function.name, output));
            }

            if stuck.is_stuck(&iteration_counts) {
                return Err(AgentError::AgentStuck);
            }

            continue;
        }

        // Not a tool-calls finish: either a genuine final answer or a
        // continuation that trailed off without invoking a tool.
        hooks.on_assistant_message(&content);
        if looks_like_continuation(&content) && nudges_used < MAX_NUDGES {
            context.push(Message::assistant(content));
            context.push(Message::user(NUDGE_MESSAGE));
            nudges_used += 1;
            continue;
        }
        context.push(Message::assistant(content.clone()));
        return Ok(content);
    }

    Err(AgentError::MaxIterations(config.max_iterations))
}

/// Send one request and accumulate its streamed response into final
/// content, any reassembled tool calls, and the terminating finish reason.
/// Tool-call fragments are latched (id/type/name on first non-empty value)
/// and concatenated (`arguments`), keyed by the stable `index` the server
/// assigns each tool-call slot.
async fn stream_one_turn(
    client: &dyn CompletionClient,
    request: &ChatRequest,
    hooks: &dyn Hooks,
    cancel: &CancellationToken,
) -> Result<(String, Vec<ToolCall>, Option<String>), AgentError> {
    use futures::StreamExt;

    let mut stream = client
        .chat_completion_stream(request)
        .await
        .map_err(|err| AgentError::UpstreamUnavailable(err.to_string()))?;

    let mut content = String::new();
    let mut pending: BTreeMap<usize, PendingToolCall> = BTreeMap::new();
    let mut finish_reason = None;
    let mut saw_content = false;

    while let Some(event) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        match event {
            Ok(StreamEvent::Done) => break,
            Ok(StreamEvent::Chunk(chunk)) => {
                for choice in &chunk.choices {
                    if let Some(text) = &choice.delta.content {
                        if !text.is_empty() {
                            content.push_str(text);
                            saw_content = true;
                            hooks.on_content_delta(&content);
                        }
                    }
                    for delta in &choice.delta.tool_calls {
                        let entry = pending.entry(delta.index).or_default();
                        if let Some(id) = &delta.id {
                            if entry.id.is_none() && !id.is_empty() {
                                entry.id = Some(id.clone());
                            }
                        }
                        if let Some(ty) = &delta.r#type {
                            if entry.r#type.is_none() && !ty.is_empty() {
                                entry.r#type = Some(ty.clone());
                            }
                        }
                        if let Some(func) = &delta.function {
                            if let Some(name) = &func.name {
                                if entry.name.is_none() && !name.is_empty() {
                                    entry.name = Some(name.clone());
                                }
                            }
                            if let Some(args) = &func.arguments {
                                entry.arguments.push_str(args);
                            }
                        }
                    }
                    if choice.finish_reason.is_some() {
                        finish_reason = choice.finish_reason.clone();
                    }
                }
            }
            Err(err) => return Err(AgentError::UpstreamUnavailable(err.to_string())),
        }
    }

    if !saw_content {
        hooks.on_thinking_done();
    }

    let tool_calls = pending
        .into_iter()
        .map(|(index, call)| ToolCall {
            id: call.id.unwrap_or_else(|| format!("call_{index}")),
            r#type: call.r#type.unwrap_or_else(|| "function".to_string()),
            function: ToolCallFunction {
                name: call.name.unwrap_or_default(),
                arguments: call.arguments,
            },
        })
        .collect();

    Ok((content, tool_calls, finish_reason))
}

fn looks_like_continuation(content: &str) -> bool {
    let lower = content.to_lowercase();
    if CONTINUATION_INTENT_PREFIXES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    let speculation_hits = CONTINUATION_SPECULATION_WORDS
        .iter()
        .filter(|w| lower.contains(*w))
        .count();
    speculation_hits >= 2
}

/// Tool-result truncation: only runs when the full message
/// list overflows `max_tokens`; walks oldest-to-newest and cuts any
/// tool-role message whose content estimates above the threshold down to
/// ~200 characters plus a marker, stopping as soon as the total fits.
fn truncate_context_in_place(context: &mut ContextManager, estimator: &TokenEstimator, max_tokens: usize) {
    let messages = context.history().to_vec();
    if estimator.estimate_messages(&messages) <= max_tokens {
        return;
    }

    let mut truncated = messages;
    for msg in truncated.iter_mut() {
        if msg.role == orc_core::Role::Tool && estimator.estimate(&msg.content) > TOOL_RESULT_TRUNCATE_TOKEN_THRESHOLD {
            msg.content = truncate_tool_text(&msg.content);
        }
        if estimator.estimate_messages(&truncated) <= max_tokens {
            break;
        }
    }

    context.replace_history(truncated);
}

fn truncate_tool_text(output: &str) -> String {
    let cut = output
        .char_indices()
        .nth(TOOL_RESULT_TRUNCATE_CHARS)
        .map(|(idx, _)| idx)
        .unwrap_or(output.len());
    format!("{}... [truncated, {} chars omitted]", &output[..cut], output.len() - cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_tracker_resets_on_success() {
        let mut tracker = StuckTracker::default();
        assert_eq!(tracker.record("a:1", true), 1);
        assert_eq!(tracker.record("a:1", false), 0);
    }

    #[test]
    fn stuck_tracker_counts_consecutive_failures_per_key() {
        let mut tracker = StuckTracker::default();
        assert_eq!(tracker.record("search:q", true), 1);
        assert_eq!(tracker.record("search:q", true), 2);
        assert_eq!(tracker.record("search:q", true), 3);
        assert_eq!(tracker.record("search:q", true), 4);
    }

    #[test]
    fn is_stuck_requires_all_at_threshold_and_one_over() {
        let tracker = StuckTracker::default();
        assert!(!tracker.is_stuck(&[3, 3, 3]));
        assert!(tracker.is_stuck(&[3, 4]));
        assert!(!tracker.is_stuck(&[2, 4]));
        assert!(!tracker.is_stuck(&[]));
    }

    #[test]
    fn looks_like_continuation_matches_intent_prefix() {
        assert!(looks_like_continuation("Let me check that for you."));
        assert!(!looks_like_continuation("The capital of France is Paris."));
    }

    #[test]
    fn looks_like_continuation_requires_two_speculation_words() {
        assert!(!looks_like_continuation("The answer is likely correct."));
        assert!(looks_like_continuation(
            "The answer is likely correct, but it's unclear without further investigation."
        ));
    }

    #[test]
    fn truncate_tool_text_cuts_long_output_with_marker() {
        let long = "x".repeat(5000);
        let truncated = truncate_tool_text(&long);
        assert!(truncated.contains("[truncated"));
        assert!(truncated.len() < long.len());
    }

    #[test]
    fn tool_call_accumulation_latches_name_once_and_appends_arguments() {
        let mut pending: BTreeMap<usize, PendingToolCall> = BTreeMap::new();
        let entry = pending.entry(0).or_default();
        entry.name = Some("search".to_string());
        entry.arguments.push_str("{\"q\":");
        if entry.name.is_none() {
            entry.name = Some("other".to_string());
        }
        entry.arguments.push_str("\"rust\"}");
        assert_eq!(entry.name.as_deref(), Some("search"));
        assert_eq!(entry.arguments, "{\"q\":\"rust\"}");
    }

    // --- end-to-end scenarios, run against a scripted CompletionClient ---

    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use orc_context::{ContextConfig, ContextManager};
    use orc_core::wire::{ToolCallDelta, ToolCallFunctionDelta};
    use orc_core::{MessageDelta, Role, StreamChoice, StreamChunk};
    use orc_tools::Tool;

    fn content_event(text: &str, finish_reason: Option<&str>) -> StreamEvent {
        StreamEvent::Chunk(StreamChunk {
            id: "1".to_string(),
            model: String::new(),
            choices: vec![StreamChoice {
                index: 0,
                delta: MessageDelta {
                    role: None,
                    content: Some(text.to_string()),
                    tool_calls: vec![],
                },
                finish_reason: finish_reason.map(|s| s.to_string()),
            }],
        })
    }

    fn tool_call_event(id: &str, name: &str, arguments: &str, finish_reason: Option<&str>) -> StreamEvent {
        StreamEvent::Chunk(StreamChunk {
            id: "1".to_string(),
            model: String::new(),
            choices: vec![StreamChoice {
                index: 0,
                delta: MessageDelta {
                    role: None,
                    content: None,
                    tool_calls: vec![ToolCallDelta {
                        index: 0,
                        id: Some(id.to_string()),
                        r#type: Some("function".to_string()),
                        function: Some(ToolCallFunctionDelta {
                            name: Some(name.to_string()),
                            arguments: Some(arguments.to_string()),
                        }),
                    }],
                },
                finish_reason: finish_reason.map(|s| s.to_string()),
            }],
        })
    }

    /// Replays one scripted stream of events per call, in order, so a test
    /// can pin down exactly what each completion request returns.
    struct ScriptedClient {
        responses: StdMutex<VecDeque<Vec<StreamEvent>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                responses: StdMutex::new(responses.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn chat_completion_stream(
            &self,
            _request: &ChatRequest,
        ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>> {
            let events = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted client called more times than responses were queued");
            Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echoes its arguments back"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }

        async fn execute(&self, _cancel: CancellationToken, arguments: &str) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::ok(format!("echo: {arguments}")))
        }
    }

    struct AlwaysFailingTool;

    #[async_trait]
    impl Tool for AlwaysFailingTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always reports a tool-level error"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }

        async fn execute(&self, _cancel: CancellationToken, _arguments: &str) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::error("still broken"))
        }
    }

    fn test_context() -> ContextManager {
        ContextManager::new(ContextConfig::new(100_000, 1024, 512), TokenEstimator::new())
    }

    #[tokio::test]
    async fn plain_streamed_reply_appends_final_assistant_message() {
        let client = ScriptedClient::new(vec![vec![
            content_event("Hello", None),
            content_event("!", Some("stop")),
        ]]);
        let mut context = test_context();
        context.push(Message::user("Hi"));
        let config = AgentConfig::new("local");

        let result = run(
            &client,
            &config,
            &mut context,
            &ToolRegistry::new(),
            &NoopHooks,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result, "Hello!");
        let history = context.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "Hi");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello!");
    }

    #[tokio::test]
    async fn single_tool_call_executes_and_feeds_result_back() {
        let client = ScriptedClient::new(vec![
            vec![tool_call_event("call_1", "echo", "{\"text\":\"hello\"}", Some("tool_calls"))],
            vec![content_event("Done!", Some("stop"))],
        ]);
        let mut context = test_context();
        context.push(Message::user("echo hello"));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(EchoTool)).unwrap();
        let config = AgentConfig::new("local");

        let result = run(&client, &config, &mut context, &tools, &NoopHooks, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, "Done!");
        let history = context.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert!(history[1].content.is_empty());
        assert_eq!(history[1].tool_calls.len(), 1);
        assert_eq!(history[2].role, Role::Tool);
        assert_eq!(history[2].content, "echo: {\"text\":\"hello\"}");
        assert_eq!(history[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(history[3].role, Role::Assistant);
        assert_eq!(history[3].content, "Done!");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_an_error_result_instead_of_aborting() {
        let client = ScriptedClient::new(vec![
            vec![tool_call_event("call_1", "nonexistent", "{}", Some("tool_calls"))],
            vec![content_event("Couldn't find that tool.", Some("stop"))],
        ]);
        let mut context = test_context();
        context.push(Message::user("do the thing"));
        let config = AgentConfig::new("local");

        let result = run(
            &client,
            &config,
            &mut context,
            &ToolRegistry::new(),
            &NoopHooks,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result, "Couldn't find that tool.");
        let history = context.history();
        assert_eq!(history[2].role, Role::Tool);
        assert_eq!(history[2].content, "unknown tool: nonexistent");
    }

    #[tokio::test]
    async fn repeated_identical_failing_tool_call_triggers_agent_stuck() {
        let responses: Vec<Vec<StreamEvent>> = (0..4)
            .map(|_| vec![tool_call_event("call_1", "broken", "{}", Some("tool_calls"))])
            .collect();
        let client = ScriptedClient::new(responses);
        let mut context = test_context();
        context.push(Message::user("try the broken tool"));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(AlwaysFailingTool)).unwrap();
        let config = AgentConfig::new("local");

        let err = run(&client, &config, &mut context, &tools, &NoopHooks, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::AgentStuck));
        // The 3rd identical failure should have carried the hint suffix.
        let history = context.history();
        let third_failure = history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .nth(2)
            .unwrap();
        assert!(third_failure.content.contains("failed repeatedly"));
    }

    #[tokio::test]
    async fn max_iterations_aborts_when_tool_calls_never_stop() {
        let responses: Vec<Vec<StreamEvent>> = (0..3)
            .map(|i| vec![tool_call_event("call_1", "echo", &format!("{{\"n\":{i}}}"), Some("tool_calls"))])
            .collect();
        let client = ScriptedClient::new(responses);
        let mut context = test_context();
        context.push(Message::user("keep going"));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(EchoTool)).unwrap();
        let mut config = AgentConfig::new("local");
        config.max_iterations = 3;

        let err = run(&client, &config, &mut context, &tools, &NoopHooks, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::MaxIterations(3)));
    }
}
