//! Reasoning Loop
//!
//! Implements the ReAct (Reason + Act) pattern: the model thinks, calls a
//! tool, observes the result, and repeats until it signals completion.
//! The loop reports each step through a callback and signals its terminal
//! state with the sentinel markers from [`crate::protocol`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::message::Message;
use crate::protocol::{
    FAILURE_REPORTED, STATELESS_ERROR, STATELESS_SUCCESS, STRATEGIC_INTERRUPT, TASK_COMPLETE_TOOL,
};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::tool::{ToolCall, ToolRegistry};

/// One observable step of the loop
#[derive(Clone, Debug, PartialEq)]
pub enum StepEvent {
    /// Iteration `n` (1-based) is starting
    LoopStart(usize),
    /// A tool call was issued
    Tool { name: String, args: Value },
    /// A tool call returned
    ToolResult { name: String, result: String },
}

/// Step callback handed to [`ReasoningLoop::run`]
pub type StepCallback<'a> = &'a mut (dyn FnMut(&StepEvent) + Send);

/// Everything one loop run needs
pub struct LoopRequest {
    /// The single instruction the loop works on
    pub instruction: String,
    /// Prior messages; empty for isolated ops
    pub history: Vec<Message>,
    pub tools: Arc<ToolRegistry>,
    pub provider: Arc<dyn LlmProvider>,
    pub max_iterations: usize,
    pub generation: GenerationOptions,
}

/// Counters reported by the loop
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    pub iterations: usize,
    pub total_tokens: u64,
    pub tools_used: Vec<String>,
    pub success: bool,
}

/// A reasoning loop drives a provider and a tool set to a final transcript
#[async_trait]
pub trait ReasoningLoop: Send + Sync {
    async fn run(
        &self,
        request: LoopRequest,
        on_step: StepCallback<'_>,
    ) -> Result<(String, LoopMetrics)>;
}

/// Loop configuration
#[derive(Clone, Debug)]
pub struct ReactConfig {
    /// System prompt template; tool descriptions are appended
    pub system_prompt: String,

    /// Ceiling for a single tool call
    pub tool_timeout: Duration,

    /// Consecutive repeats of an identical call before interrupting
    pub repeat_limit: usize,

    /// Consecutive identical failures of one tool before interrupting
    pub failure_limit: usize,

    /// Treat a plain answer (no tool call) as an executor error
    pub require_tool_calls: bool,
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            tool_timeout: Duration::from_secs(60),
            repeat_limit: 5,
            failure_limit: 3,
            require_tool_calls: false,
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a task executor. You receive one objective and a fixed set of tools.

When you need to use a tool, respond with a JSON block in this exact format:
```tool
{"tool": "tool_name", "arguments": {"arg1": "value1"}}
```

Call exactly one tool per response and wait for its result.
When the objective is met, call system_task_complete with {"summary": "..."}.
If it cannot be met, call system_report_failure with {"reason": "..."}.
Never claim progress you did not observe in a tool result."#;

/// Default ReAct loop
#[derive(Clone, Debug, Default)]
pub struct ReactLoop {
    config: ReactConfig,
}

impl ReactLoop {
    pub const fn new(config: ReactConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &ReactConfig {
        &self.config
    }

    /// Build the full system prompt including tool descriptions
    fn build_system_prompt(&self, tools: &ToolRegistry) -> String {
        let mut prompt = self.config.system_prompt.clone();
        if !tools.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&tools.generate_prompt_section());
        }
        prompt
    }

    /// Format tool result for the conversation
    fn format_tool_result(name: &str, result: &str) -> String {
        if is_error_output(result) {
            format!("[Tool '{name}' failed]\n{result}")
        } else {
            format!("[Tool '{name}' returned]\n{result}")
        }
    }
}

fn is_error_output(result: &str) -> bool {
    let head: String = result.trim_start().chars().take(5).collect();
    head.eq_ignore_ascii_case("error")
}

/// Parse a tool call from an LLM response
pub fn parse_tool_call(content: &str) -> Option<ToolCall> {
    // Look for ```tool ... ``` blocks
    let tool_start = "```tool";
    let tool_end = "```";

    let parsed = content.find(tool_start).and_then(|start_idx| {
        let after_marker = &content[start_idx + tool_start.len()..];
        let end_idx = after_marker.find(tool_end)?;
        serde_json::from_str::<ToolCall>(after_marker[..end_idx].trim()).ok()
    });

    // Fallback: raw JSON with a "tool" key
    let mut call = parsed.or_else(|| parse_inline_tool_call(content))?;
    if call.id.is_none() {
        call.id = Some(uuid::Uuid::new_v4().to_string());
    }
    Some(call)
}

fn parse_inline_tool_call(content: &str) -> Option<ToolCall> {
    if !content.contains(r#""tool""#) {
        return None;
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str::<ToolCall>(&content[start..=end]).ok()
}

#[async_trait]
impl ReasoningLoop for ReactLoop {
    async fn run(
        &self,
        request: LoopRequest,
        on_step: StepCallback<'_>,
    ) -> Result<(String, LoopMetrics)> {
        let LoopRequest {
            instruction,
            history,
            tools,
            provider,
            max_iterations,
            generation,
        } = request;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.build_system_prompt(&tools)));
        messages.extend(history);
        messages.push(Message::user(instruction));

        let mut metrics = LoopMetrics::default();
        let mut last_call: Option<String> = None;
        let mut repeats = 0usize;
        let mut tool_errors: HashMap<String, Vec<String>> = HashMap::new();

        for iteration in 1..=max_iterations {
            metrics.iterations = iteration;
            on_step(&StepEvent::LoopStart(iteration));
            debug!(iteration, max_iterations, "Reasoning step");

            let completion = provider.chat(&messages, &generation).await?;
            metrics.total_tokens += completion.total_tokens();
            let content = completion.content;
            messages.push(Message::assistant(&content));

            let Some(call) = parse_tool_call(&content) else {
                if self.config.require_tool_calls {
                    let preview: String = content.chars().take(200).collect();
                    return Ok((
                        format!("{STATELESS_ERROR} The executor answered without calling a tool: {preview}"),
                        metrics,
                    ));
                }
                // No tool call - this is the final response
                metrics.success = true;
                return Ok((content, metrics));
            };

            let fingerprint = format!("{}:{}", call.tool, call.arguments);
            if last_call.as_deref() == Some(fingerprint.as_str()) {
                repeats += 1;
                if repeats >= self.config.repeat_limit {
                    warn!(call = %fingerprint, "Strategic interrupt: repeated identical tool call");
                    return Ok((
                        format!(
                            "{STRATEGIC_INTERRUPT} Caught in a loop executing: {fingerprint}. Stopping execution to request a new strategy."
                        ),
                        metrics,
                    ));
                }
            } else {
                repeats = 0;
            }
            last_call = Some(fingerprint);

            if call.tool == TASK_COMPLETE_TOOL {
                let summary = call
                    .arguments
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                info!("Task marked complete by executor");
                metrics.tools_used.push(call.tool);
                metrics.success = true;
                return Ok((
                    format!("{STATELESS_SUCCESS} Task execution finished. Summary: {summary}"),
                    metrics,
                ));
            }

            on_step(&StepEvent::Tool {
                name: call.tool.clone(),
                args: call.arguments.clone(),
            });
            metrics.tools_used.push(call.tool.clone());

            let result = match tokio::time::timeout(
                self.config.tool_timeout,
                tools.execute(&call.tool, call.arguments),
            )
            .await
            {
                Ok(output) => output,
                Err(_) => {
                    warn!(tool = %call.tool, "Tool call timed out");
                    format!(
                        "Error: tool '{}' did not return within {}s and was cancelled. Run long-lived work in the background.",
                        call.tool,
                        self.config.tool_timeout.as_secs()
                    )
                }
            };

            messages.push(Message::tool(
                Self::format_tool_result(&call.tool, &result),
                call.id,
            ));
            on_step(&StepEvent::ToolResult {
                name: call.tool.clone(),
                result: result.clone(),
            });

            if result.contains(FAILURE_REPORTED) {
                info!(tool = %call.tool, "Executor reported failure");
                return Ok((result, metrics));
            }

            if is_error_output(&result) {
                let errors = tool_errors.entry(call.tool.clone()).or_default();
                if errors.last().is_some_and(|last| *last != result) {
                    errors.clear();
                }
                errors.push(result);
                if errors.len() >= self.config.failure_limit {
                    warn!(tool = %call.tool, failures = errors.len(), "Strategic interrupt: identical tool failures");
                    return Ok((
                        format!(
                            "{STRATEGIC_INTERRUPT} Tool {} failed {} times in a row with the exact same error. Stopping to replan.",
                            call.tool,
                            errors.len()
                        ),
                        metrics,
                    ));
                }
            } else {
                tool_errors.remove(&call.tool);
            }
        }

        let mut report = format!("Iteration limit reached ({max_iterations}) without completion.");
        for (tool, errors) in &tool_errors {
            if let Some(last) = errors.last() {
                report.push_str(&format!("\n- {tool}: {last}"));
            }
        }
        if repeats > 0 {
            report.push_str(&format!("\n- Repeated identical tool calls ({repeats} times)"));
        }
        Ok((report, metrics))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::provider::{Completion, TokenUsage};
    use crate::tool::tests::EchoTool;
    use std::sync::Mutex;

    /// Replays a fixed list of responses, repeating the last one
    pub(crate) struct ScriptedProvider {
        responses: Vec<String>,
        pub(crate) seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: responses.iter().map(ToString::to_string).collect(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, messages: &[Message], _o: &GenerationOptions) -> Result<Completion> {
            let mut seen = self.seen.lock().unwrap();
            let idx = seen.len().min(self.responses.len().saturating_sub(1));
            seen.push(messages.to_vec());
            let content = self
                .responses
                .get(idx)
                .cloned()
                .ok_or_else(|| AgentError::Provider("no scripted response".into()))?;
            Ok(Completion {
                content,
                model: "scripted".into(),
                usage: Some(TokenUsage { prompt_tokens: 7, completion_tokens: 3, total_tokens: 10 }),
                finish_reason: None,
            })
        }
    }

    fn request(provider: Arc<ScriptedProvider>, max_iterations: usize) -> LoopRequest {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool("echo"));
        LoopRequest {
            instruction: "do it".into(),
            history: Vec::new(),
            tools: Arc::new(tools),
            provider,
            max_iterations,
            generation: GenerationOptions::default(),
        }
    }

    async fn run(provider: Arc<ScriptedProvider>, max: usize) -> (String, LoopMetrics, Vec<StepEvent>) {
        let mut events = Vec::new();
        let mut record = |e: &StepEvent| events.push(e.clone());
        let (text, metrics) = ReactLoop::default()
            .run(request(provider, max), &mut record)
            .await
            .unwrap();
        (text, metrics, events)
    }

    #[test]
    fn test_parse_tool_call() {
        let content = r#"Let me check that for you.
```tool
{"tool": "echo", "arguments": {"text": "2 + 2"}}
```"#;
        let call = parse_tool_call(content).unwrap();
        assert_eq!(call.tool, "echo");
        assert_eq!(call.arguments["text"], "2 + 2");
        assert!(call.id.is_some());

        let inline = parse_tool_call(r#"Sure: {"tool": "echo", "arguments": {"text": "x"}}"#).unwrap();
        assert_eq!(inline.tool, "echo");

        assert!(parse_tool_call("just text").is_none());
    }

    #[tokio::test]
    async fn test_task_complete_ends_with_success_marker() {
        let provider = ScriptedProvider::new(&[
            r#"{"tool": "echo", "arguments": {"text": "hi"}}"#,
            r#"{"tool": "system_task_complete", "arguments": {"summary": "echoed"}}"#,
        ]);
        let (text, metrics, events) = run(provider, 5).await;

        assert_eq!(text, "[STATELESS_EXECUTOR_SUCCESS] Task execution finished. Summary: echoed");
        assert!(metrics.success);
        assert_eq!(metrics.total_tokens, 20);
        assert_eq!(
            events,
            vec![
                StepEvent::LoopStart(1),
                StepEvent::Tool { name: "echo".into(), args: serde_json::json!({"text": "hi"}) },
                StepEvent::ToolResult { name: "echo".into(), result: "echo: hi".into() },
                StepEvent::LoopStart(2),
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_call_triggers_interrupt() {
        let provider = ScriptedProvider::new(&[r#"{"tool": "echo", "arguments": {"text": "same"}}"#]);
        let (text, metrics, _) = run(provider, 20).await;
        assert!(text.starts_with(STRATEGIC_INTERRUPT));
        assert!(!metrics.success);
        assert_eq!(metrics.iterations, 6);
    }

    #[tokio::test]
    async fn test_identical_failures_trigger_interrupt() {
        let provider = ScriptedProvider::new(&[
            r#"{"tool": "missing", "arguments": {"n": 1}}"#,
            r#"{"tool": "missing", "arguments": {"n": 2}}"#,
            r#"{"tool": "missing", "arguments": {"n": 3}}"#,
        ]);
        let (text, _, _) = run(provider, 10).await;
        assert_eq!(
            text,
            "[STRATEGIC_INTERRUPT] Tool missing failed 3 times in a row with the exact same error. Stopping to replan."
        );
    }

    #[tokio::test]
    async fn test_plain_answer_is_final() {
        let provider = ScriptedProvider::new(&["The answer is 4."]);
        let (text, metrics, _) = run(provider, 3).await;
        assert_eq!(text, "The answer is 4.");
        assert!(metrics.success);
    }

    #[tokio::test]
    async fn test_iteration_limit_reports_failure() {
        let provider = ScriptedProvider::new(&[
            r#"{"tool": "echo", "arguments": {"text": "a"}}"#,
            r#"{"tool": "echo", "arguments": {"text": "b"}}"#,
        ]);
        let mut events = Vec::new();
        let mut record = |e: &StepEvent| events.push(e.clone());
        let mut req = request(provider, 2);
        req.generation.max_tokens = 64;
        let (text, metrics) = ReactLoop::default().run(req, &mut record).await.unwrap();
        assert!(text.starts_with("Iteration limit reached (2)"));
        assert!(!metrics.success);
    }

    #[tokio::test]
    async fn test_history_is_forwarded_after_system_prompt() {
        let provider = ScriptedProvider::new(&["ok"]);
        let mut req = request(Arc::clone(&provider), 1);
        req.history = vec![Message::user("earlier")];
        let mut noop = |_: &StepEvent| {};
        ReactLoop::default().run(req, &mut noop).await.unwrap();

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].len(), 3);
        assert_eq!(seen[0][1].content, "earlier");
    }
}
