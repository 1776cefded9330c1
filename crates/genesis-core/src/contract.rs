//! Op contracts
//!
//! `OpSpec` is the typed request for one isolated unit of work and
//! `OpResult` its typed outcome. Specs are immutable; a retry is a new
//! spec produced by [`OpSpec::next_attempt`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Default iteration budget for one op
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Request for one isolated op
///
/// Deserialization goes through [`OpSpecBuilder::build`], so a transported
/// spec obeys the same bounds as a built one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireOpSpec")]
pub struct OpSpec {
    objective: String,
    tool_ids: Vec<String>,
    context_facts: Vec<String>,
    strategy_hint: String,
    output_schema: Value,
    expected_output: String,
    attempt_number: u32,
    max_iterations: usize,
}

impl OpSpec {
    /// Start building a spec for `objective`
    pub fn builder(objective: impl Into<String>) -> OpSpecBuilder {
        OpSpecBuilder::new(objective)
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    /// Allowed tool names, in first-seen order without duplicates
    pub fn tool_ids(&self) -> &[String] {
        &self.tool_ids
    }

    pub fn context_facts(&self) -> &[String] {
        &self.context_facts
    }

    pub fn strategy_hint(&self) -> &str {
        &self.strategy_hint
    }

    pub const fn output_schema(&self) -> &Value {
        &self.output_schema
    }

    pub fn expected_output(&self) -> &str {
        &self.expected_output
    }

    pub const fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub const fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Same spec with `attempt_number + 1`
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_number: self.attempt_number.saturating_add(1),
            ..self.clone()
        }
    }

    /// Revised spec for the next attempt, e.g. with a new strategy or
    /// extra facts learned from the failed one
    pub fn revise(&self) -> OpSpecBuilder {
        OpSpecBuilder {
            spec: self.next_attempt(),
        }
    }
}

const fn default_attempt() -> u32 {
    1
}

const fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Deserialize)]
struct WireOpSpec {
    objective: String,
    #[serde(default)]
    tool_ids: Vec<String>,
    #[serde(default)]
    context_facts: Vec<String>,
    #[serde(default)]
    strategy_hint: String,
    #[serde(default)]
    output_schema: Option<Value>,
    #[serde(default)]
    expected_output: String,
    #[serde(default = "default_attempt")]
    attempt_number: u32,
    #[serde(default = "default_max_iterations")]
    max_iterations: usize,
}

impl TryFrom<WireOpSpec> for OpSpec {
    type Error = AgentError;

    fn try_from(wire: WireOpSpec) -> Result<Self> {
        let mut builder = OpSpecBuilder::new(wire.objective)
            .tools(wire.tool_ids)
            .facts(wire.context_facts)
            .strategy_hint(wire.strategy_hint)
            .expected_output(wire.expected_output)
            .attempt_number(wire.attempt_number)
            .max_iterations(wire.max_iterations);
        if let Some(schema) = wire.output_schema {
            builder = builder.output_schema(schema);
        }
        builder.build()
    }
}

/// Builder for [`OpSpec`]
#[derive(Clone, Debug)]
pub struct OpSpecBuilder {
    spec: OpSpec,
}

impl OpSpecBuilder {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            spec: OpSpec {
                objective: objective.into(),
                tool_ids: Vec::new(),
                context_facts: Vec::new(),
                strategy_hint: String::new(),
                output_schema: Value::Object(serde_json::Map::new()),
                expected_output: String::new(),
                attempt_number: 1,
                max_iterations: DEFAULT_MAX_ITERATIONS,
            },
        }
    }

    #[must_use]
    pub fn tool(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.spec.tool_ids.contains(&name) {
            self.spec.tool_ids.push(name);
        }
        self
    }

    #[must_use]
    pub fn tools<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().fold(self, Self::tool)
    }

    #[must_use]
    pub fn fact(mut self, fact: impl Into<String>) -> Self {
        self.spec.context_facts.push(fact.into());
        self
    }

    #[must_use]
    pub fn facts<I, S>(self, facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        facts.into_iter().fold(self, Self::fact)
    }

    #[must_use]
    pub fn strategy_hint(mut self, hint: impl Into<String>) -> Self {
        self.spec.strategy_hint = hint.into();
        self
    }

    #[must_use]
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.spec.output_schema = schema;
        self
    }

    #[must_use]
    pub fn expected_output(mut self, expected: impl Into<String>) -> Self {
        self.spec.expected_output = expected.into();
        self
    }

    #[must_use]
    pub const fn attempt_number(mut self, attempt: u32) -> Self {
        self.spec.attempt_number = attempt;
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.spec.max_iterations = max;
        self
    }

    /// Validate and freeze the spec
    pub fn build(self) -> Result<OpSpec> {
        if self.spec.objective.trim().is_empty() {
            return Err(AgentError::Config("OpSpec objective must not be empty".into()));
        }
        if self.spec.attempt_number < 1 {
            return Err(AgentError::Config("attempt_number must be >= 1".into()));
        }
        if self.spec.max_iterations < 1 {
            return Err(AgentError::Config("max_iterations must be >= 1".into()));
        }
        Ok(self.spec)
    }
}

/// One ledger entry: a tool invocation and, once it returns, its result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool: String,
    pub args: Value,
    pub result: Option<String>,
}

/// Outcome of one op
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub success: bool,
    pub matched_expected: bool,
    pub tool_outputs: Vec<ToolOutput>,
    pub final_output: Option<Value>,
    pub attempt_number: u32,
    pub error: Option<String>,
    pub entropy_triggered: bool,
    pub tokens_used: u64,
}

impl OpResult {
    /// Failed result for an op that never produced a transcript
    pub fn crashed(attempt_number: u32, tool_outputs: Vec<ToolOutput>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            matched_expected: false,
            tool_outputs,
            final_output: None,
            attempt_number,
            error: Some(error.into()),
            entropy_triggered: false,
            tokens_used: 0,
        }
    }

    /// Summary text from `final_output`, if any
    pub fn summary(&self) -> Option<&str> {
        self.final_output.as_ref()?.get("summary")?.as_str()
    }
}
