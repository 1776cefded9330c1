//! Op Executor
//!
//! Runs one [`OpSpec`] in isolation and reduces the loop transcript to an
//! [`OpResult`].
//!
//! Isolation guarantees:
//! - the loop sees a fresh [`ToolRegistry`] holding only `spec.tool_ids`
//!   (missing names are skipped, never fabricated) plus
//!   `system_report_failure`
//! - the loop starts with zero prior messages
//!
//! `execute` never returns an error and never lets a panic escape: loop
//! errors, panics, and the wall-clock ceiling all become a failed result.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::contract::{OpResult, OpSpec, ToolOutput};
use crate::error::{AgentError, Result};
use crate::protocol::{
    FAILURE_REPORTED, LoopSignal, REPORT_FAILURE_TOOL, ResultParser, SentinelParser,
    TASK_COMPLETE_TOOL,
};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::reasoning::{LoopRequest, ReasoningLoop, StepEvent};
use crate::tool::{Tool, ToolRegistry};

/// Default wall-clock ceiling for one op
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Lets the model end an op with a reason instead of inventing progress
#[derive(Debug, Default)]
pub struct ReportFailureTool;

#[async_trait]
impl Tool for ReportFailureTool {
    fn name(&self) -> &str {
        REPORT_FAILURE_TOOL
    }

    fn description(&self) -> &str {
        "Report that the task cannot be completed and explain why."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Why the task cannot be completed"
                }
            },
            "required": ["reason"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String> {
        let reason = args.get("reason").and_then(Value::as_str).unwrap_or("unknown");
        Ok(format!("{FAILURE_REPORTED} {reason}"))
    }
}

/// Executes isolated ops against a shared provider
pub struct OpExecutor {
    full_registry: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    reasoning: Arc<dyn ReasoningLoop>,
    parser: Arc<dyn ResultParser>,
    generation: GenerationOptions,
    timeout: Duration,
}

impl OpExecutor {
    pub fn new(
        full_registry: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        reasoning: Arc<dyn ReasoningLoop>,
    ) -> Self {
        Self {
            full_registry,
            provider,
            reasoning,
            parser: Arc::new(SentinelParser::default()),
            generation: GenerationOptions::default(),
            timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Override the wall-clock ceiling
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a different sentinel vocabulary
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn ResultParser>) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn with_generation(mut self, generation: GenerationOptions) -> Self {
        self.generation = generation;
        self
    }

    /// Execute one op
    pub async fn execute(&self, spec: &OpSpec) -> OpResult {
        self.execute_with_observer(spec, &mut |_: &StepEvent| {}).await
    }

    /// Execute one op, forwarding every step event to `observer`
    pub async fn execute_with_observer(
        &self,
        spec: &OpSpec,
        observer: &mut (dyn FnMut(&StepEvent) + Send),
    ) -> OpResult {
        let preview: String = spec.objective().chars().take(60).collect();
        info!(
            attempt = spec.attempt_number(),
            tools = ?spec.tool_ids(),
            objective = %preview,
            "OpExecutor starting op"
        );

        let request = LoopRequest {
            instruction: format_instruction(spec),
            history: Vec::new(),
            tools: Arc::new(self.build_isolated_registry(spec.tool_ids())),
            provider: Arc::clone(&self.provider),
            max_iterations: spec.max_iterations(),
            generation: self.generation.clone(),
        };

        let mut ledger: Vec<ToolOutput> = Vec::new();
        let mut on_step = |event: &StepEvent| {
            record_step(&mut ledger, event);
            observer(event);
        };

        let run = AssertUnwindSafe(self.reasoning.run(request, &mut on_step)).catch_unwind();
        let outcome = tokio::time::timeout(self.timeout, run).await;

        match outcome {
            Ok(Ok(Ok((transcript, metrics)))) => self.parser.parse(
                &transcript,
                LoopSignal {
                    success: metrics.success,
                    total_tokens: metrics.total_tokens,
                },
                spec.attempt_number(),
                ledger,
            ),
            Ok(Ok(Err(e))) => {
                error!(error = %e, "OpExecutor loop crashed");
                OpResult::crashed(spec.attempt_number(), ledger, e.to_string())
            }
            Ok(Err(panic)) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "reasoning loop panicked".into());
                error!(panic = %msg, "OpExecutor loop panicked");
                OpResult::crashed(spec.attempt_number(), ledger, msg)
            }
            Err(_) => {
                let e = AgentError::Timeout(self.timeout);
                error!(error = %e, "OpExecutor hit wall-clock ceiling");
                OpResult::crashed(spec.attempt_number(), ledger, e.to_string())
            }
        }
    }

    /// New registry holding only the requested tools plus the failure reporter
    pub fn build_isolated_registry(&self, tool_ids: &[String]) -> ToolRegistry {
        let mut isolated = ToolRegistry::new();

        for name in tool_ids {
            match self.full_registry.get(name) {
                Some(tool) => {
                    isolated.register_arc(tool);
                }
                None => warn!(tool = %name, "Tool not found in registry, skipping"),
            }
        }

        isolated.register(ReportFailureTool);
        isolated
    }
}

/// Append on `Tool`; back-fill the most recent unfilled entry of the same
/// tool on `ToolResult`
fn record_step(ledger: &mut Vec<ToolOutput>, event: &StepEvent) {
    match event {
        StepEvent::Tool { name, args } => ledger.push(ToolOutput {
            tool: name.clone(),
            args: args.clone(),
            result: None,
        }),
        StepEvent::ToolResult { name, result } => {
            if let Some(entry) = ledger
                .iter_mut()
                .rev()
                .find(|e| e.tool == *name && e.result.is_none())
            {
                entry.result = Some(result.clone());
            }
        }
        StepEvent::LoopStart(_) => {}
    }
}

/// Render an op as the single instruction handed to the loop
pub fn format_instruction(spec: &OpSpec) -> String {
    let facts = if spec.context_facts().is_empty() {
        "  (none)".to_string()
    } else {
        spec.context_facts()
            .iter()
            .map(|f| format!("  - {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let schema = serde_json::to_string(spec.output_schema()).unwrap_or_else(|_| "{}".into());

    format!(
        "OBJECTIVE: {objective}\n\
         \n\
         AVAILABLE TOOLS: {tools}\n\
         \n\
         CONTEXT FACTS:\n{facts}\n\
         \n\
         STRATEGY: {strategy}\n\
         \n\
         OUTPUT FORMAT REQUIRED: {schema}\n\
         SUCCESS CRITERION: {expected}\n\
         \n\
         Use the available tools to complete the objective. \
         When done, call {TASK_COMPLETE_TOOL} with a summary. \
         If you cannot complete it, call {REPORT_FAILURE_TOOL} with a reason.",
        objective = spec.objective(),
        tools = spec.tool_ids().join(", "),
        strategy = spec.strategy_hint(),
        expected = spec.expected_output(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StubProvider;
    use crate::reasoning::{LoopMetrics, ReactLoop, StepCallback};
    use crate::reasoning::tests::ScriptedProvider;
    use crate::tool::tests::EchoTool;

    fn full_registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool("shell"));
        registry.register(EchoTool("browser"));
        registry.register(EchoTool("web_search"));
        Arc::new(registry)
    }

    fn executor(provider: Arc<dyn LlmProvider>) -> OpExecutor {
        OpExecutor::new(full_registry(), provider, Arc::new(ReactLoop::default()))
    }

    /// Loop that emits a fixed event script and returns a fixed outcome
    struct FakeLoop {
        events: Vec<StepEvent>,
        outcome: fn() -> Result<(String, LoopMetrics)>,
    }

    #[async_trait]
    impl ReasoningLoop for FakeLoop {
        async fn run(&self, _r: LoopRequest, on_step: StepCallback<'_>) -> Result<(String, LoopMetrics)> {
            for e in &self.events {
                on_step(e);
            }
            (self.outcome)()
        }
    }

    fn fake(events: Vec<StepEvent>, outcome: fn() -> Result<(String, LoopMetrics)>) -> OpExecutor {
        OpExecutor::new(
            full_registry(),
            Arc::new(StubProvider::new()),
            Arc::new(FakeLoop { events, outcome }),
        )
    }

    fn tool(name: &str, n: u64) -> StepEvent {
        StepEvent::Tool { name: name.into(), args: json!({"n": n}) }
    }

    fn result(name: &str, text: &str) -> StepEvent {
        StepEvent::ToolResult { name: name.into(), result: text.into() }
    }

    #[test]
    fn test_isolated_registry_contains_only_requested_tools() {
        let exec = executor(Arc::new(StubProvider::new()));
        let isolated = exec.build_isolated_registry(&["shell".to_string()]);
        assert_eq!(isolated.list(), vec!["shell", REPORT_FAILURE_TOOL]);
    }

    #[test]
    fn test_unknown_tool_ids_are_skipped() {
        let exec = executor(Arc::new(StubProvider::new()));
        let isolated = exec.build_isolated_registry(&["ghost".to_string(), "browser".to_string()]);
        assert_eq!(isolated.list(), vec!["browser", REPORT_FAILURE_TOOL]);
    }

    #[test]
    fn test_instruction_sections_in_order() {
        let spec = OpSpec::builder("free disk space")
            .tool("shell")
            .fact("host is linux")
            .strategy_hint("use df")
            .output_schema(json!({"free_gb": "number"}))
            .expected_output("free space reported")
            .build()
            .unwrap();
        let text = format_instruction(&spec);

        let order = [
            "OBJECTIVE: free disk space",
            "AVAILABLE TOOLS: shell",
            "CONTEXT FACTS:\n  - host is linux",
            "STRATEGY: use df",
            r#"OUTPUT FORMAT REQUIRED: {"free_gb":"number"}"#,
            "SUCCESS CRITERION: free space reported",
            "call system_task_complete",
            "call system_report_failure",
        ];
        let positions: Vec<usize> = order.iter().map(|s| text.find(s).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let bare = format_instruction(&OpSpec::builder("x").build().unwrap());
        assert!(bare.contains("CONTEXT FACTS:\n  (none)"));
    }

    #[tokio::test]
    async fn test_ledger_back_fills_last_unfilled_entry() {
        let exec = fake(
            vec![
                tool("shell", 1),
                tool("browser", 2),
                tool("shell", 3),
                result("shell", "third"),
                result("browser", "second"),
                result("shell", "first"),
            ],
            || Ok(("[STATELESS_EXECUTOR_SUCCESS] Summary: ok".into(), LoopMetrics::default())),
        );
        let r = exec.execute(&OpSpec::builder("x").build().unwrap()).await;

        let results: Vec<_> = r.tool_outputs.iter().map(|o| (o.tool.as_str(), o.result.as_deref())).collect();
        assert_eq!(
            results,
            vec![("shell", Some("first")), ("browser", Some("second")), ("shell", Some("third"))]
        );
        assert_eq!(r.tool_outputs[2].args, json!({"n": 3}));
    }

    #[tokio::test]
    async fn test_loop_error_becomes_failed_result() {
        let exec = fake(vec![tool("shell", 1)], || Err(AgentError::Provider("all down".into())));
        let r = exec.execute(&OpSpec::builder("x").attempt_number(2).build().unwrap()).await;
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("Provider error: all down"));
        assert_eq!(r.attempt_number, 2);
        assert_eq!(r.tool_outputs.len(), 1);
        assert_eq!(r.tokens_used, 0);
    }

    #[tokio::test]
    async fn test_loop_panic_is_contained() {
        let exec = fake(Vec::new(), || panic!("loop exploded"));
        let r = exec.execute(&OpSpec::builder("x").build().unwrap()).await;
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("loop exploded"));
    }

    #[tokio::test]
    async fn test_tokens_copied_from_metrics() {
        let exec = fake(Vec::new(), || {
            Ok(("done".into(), LoopMetrics { total_tokens: 321, success: true, ..LoopMetrics::default() }))
        });
        let r = exec.execute(&OpSpec::builder("x").build().unwrap()).await;
        assert!(r.success);
        assert_eq!(r.tokens_used, 321);
        assert_eq!(r.summary(), Some("done"));
    }

    #[tokio::test]
    async fn test_end_to_end_report_failure() {
        let provider = ScriptedProvider::new(&[
            r#"{"tool": "shell", "arguments": {"text": "df"}}"#,
            r#"{"tool": "system_report_failure", "arguments": {"reason": "disk full"}}"#,
        ]);
        let exec = executor(provider.clone());
        let spec = OpSpec::builder("free space").tool("shell").build().unwrap();

        let mut observed = 0usize;
        let r = exec.execute_with_observer(&spec, &mut |_: &StepEvent| observed += 1).await;

        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("disk full"));
        assert_eq!(r.tool_outputs.len(), 2);
        assert_eq!(r.tool_outputs[0].result.as_deref(), Some("shell: df"));
        assert_eq!(r.tool_outputs[1].tool, REPORT_FAILURE_TOOL);
        assert_eq!(r.tokens_used, 20);
        assert_eq!(observed, 6);

        // Isolation: the first request carried only the system prompt and the instruction
        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].len(), 2);
        assert!(seen[0][1].content.starts_with("OBJECTIVE: free space"));
    }

    #[tokio::test]
    async fn test_end_to_end_success_summary() {
        let provider = ScriptedProvider::new(&[
            r#"{"tool": "system_task_complete", "arguments": {"summary": "done"}}"#,
        ]);
        let r = executor(provider).execute(&OpSpec::builder("x").build().unwrap()).await;
        assert!(r.success);
        assert_eq!(r.final_output, Some(json!({"summary": "done"})));
        assert_eq!(r.error, None);
    }

    #[tokio::test]
    async fn test_wall_clock_ceiling_yields_failed_result() {
        struct Hang;

        #[async_trait]
        impl ReasoningLoop for Hang {
            async fn run(&self, _r: LoopRequest, _s: StepCallback<'_>) -> Result<(String, LoopMetrics)> {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }

        let exec = OpExecutor::new(full_registry(), Arc::new(StubProvider::new()), Arc::new(Hang))
            .with_timeout(Duration::from_millis(20));
        let r = exec.execute(&OpSpec::builder("x").build().unwrap()).await;
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("Timed out after 20ms"));
    }
}
