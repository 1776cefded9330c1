//! Sentinel protocol
//!
//! The reasoning loop signals terminal states with bracketed tokens in its
//! final text. They are matched by exact substring and must stay stable
//! across implementations. Parsing sits behind [`ResultParser`] so a loop
//! with a different vocabulary can bring its own parser.

use serde_json::{Value, json};

use crate::contract::{OpResult, ToolOutput};

/// Version of the marker vocabulary below
pub const PROTOCOL_VERSION: u32 = 1;

pub const STRATEGIC_INTERRUPT: &str = "[STRATEGIC_INTERRUPT]";
pub const STRATEGIC_INTERRUPT_SIGNAL: &str = "[STRATEGIC_INTERRUPT_SIGNAL]";
pub const FAILURE_REPORTED: &str = "[FAILURE_REPORTED]";
pub const STATELESS_FAILURE: &str = "[STATELESS_EXECUTOR_FAILURE]";
pub const STATELESS_SUCCESS: &str = "[STATELESS_EXECUTOR_SUCCESS]";
pub const STATELESS_ERROR: &str = "[STATELESS_EXECUTOR_ERROR]";

/// Tool the model calls to finish successfully
pub const TASK_COMPLETE_TOOL: &str = "system_task_complete";
/// Tool the model calls to give up with a reason
pub const REPORT_FAILURE_TOOL: &str = "system_report_failure";

const SUMMARY_LABEL: &str = "Summary:";
const FALLBACK_SUMMARY_CHARS: usize = 500;
const FALLBACK_ERROR_CHARS: usize = 300;

/// Marker vocabulary used by a reasoning loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkerSet {
    pub version: u32,
    pub interrupt: Vec<&'static str>,
    /// Checked in order; the first present marker supplies the error text
    pub failure: Vec<&'static str>,
    pub success: &'static str,
    pub error: &'static str,
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            interrupt: vec![STRATEGIC_INTERRUPT, STRATEGIC_INTERRUPT_SIGNAL],
            failure: vec![STATELESS_FAILURE, FAILURE_REPORTED],
            success: STATELESS_SUCCESS,
            error: STATELESS_ERROR,
        }
    }
}

/// What the loop handed back, besides the transcript
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopSignal {
    pub success: bool,
    pub total_tokens: u64,
}

/// Reduces a loop transcript to an [`OpResult`]
pub trait ResultParser: Send + Sync {
    fn parse(
        &self,
        transcript: &str,
        signal: LoopSignal,
        attempt_number: u32,
        tool_outputs: Vec<ToolOutput>,
    ) -> OpResult;
}

/// Default parser over a [`MarkerSet`]
#[derive(Clone, Debug, Default)]
pub struct SentinelParser {
    markers: MarkerSet,
}

/// Text after the last occurrence of `marker`, trimmed
fn after_last<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.rfind(marker).map(|i| text[i + marker.len()..].trim())
}

fn prefix_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

impl SentinelParser {
    pub const fn new(markers: MarkerSet) -> Self {
        Self { markers }
    }

    pub const fn markers(&self) -> &MarkerSet {
        &self.markers
    }
}

impl ResultParser for SentinelParser {
    fn parse(
        &self,
        transcript: &str,
        signal: LoopSignal,
        attempt_number: u32,
        tool_outputs: Vec<ToolOutput>,
    ) -> OpResult {
        let m = &self.markers;

        let entropy_triggered = m.interrupt.iter().any(|k| transcript.contains(k));
        let failure_marker = m.failure.iter().copied().find(|k| transcript.contains(k));
        let success_signal = transcript.contains(m.success);

        // Failure markers are checked before the success marker
        let success = failure_marker.is_none()
            && (success_signal || (signal.success && !entropy_triggered));

        let error = if success {
            None
        } else if let Some(marker) = failure_marker {
            after_last(transcript, marker).map(str::to_string)
        } else if entropy_triggered {
            Some("Execution loop detected (entropy triggered)".to_string())
        } else if let Some(text) = after_last(transcript, m.error) {
            Some(text.to_string())
        } else if transcript.is_empty() {
            Some("Unknown error".to_string())
        } else {
            Some(prefix_chars(transcript, FALLBACK_ERROR_CHARS))
        };

        let final_output: Option<Value> = success.then(|| {
            let summary = if success_signal {
                after_last(transcript, SUMMARY_LABEL).unwrap_or(transcript).to_string()
            } else {
                prefix_chars(transcript, FALLBACK_SUMMARY_CHARS)
            };
            json!({ "summary": summary })
        });

        OpResult {
            success,
            matched_expected: success,
            tool_outputs,
            final_output,
            attempt_number,
            error,
            entropy_triggered,
            tokens_used: signal.total_tokens,
        }
    }
}
