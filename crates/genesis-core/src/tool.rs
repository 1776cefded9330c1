//! Tool System
//!
//! Tools are capability objects with a JSON-schema parameter description,
//! registered at runtime and invoked by the reasoning loop. Execution
//! failures are turned into text so they can be fed back to the model.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{AgentError, Result};

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool identifier
    #[serde(alias = "name")]
    pub tool: String,

    /// Arguments object
    #[serde(default = "empty_object")]
    pub arguments: Value,

    /// Optional call ID for tracking
    #[serde(default)]
    pub id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Machine-readable action menu entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool identifier
    fn name(&self) -> &str;

    /// Human-readable description (shown to the LLM)
    fn description(&self) -> &str;

    /// JSON-schema object describing the arguments
    fn parameters(&self) -> Value;

    /// Execute the tool with given arguments
    async fn execute(&self, args: Value) -> Result<String>;

    /// Definition handed to the model
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }

    /// Check `required` properties before execution
    fn validate(&self, args: &Value) -> Result<()> {
        let schema = self.parameters();
        let Some(required) = schema.get("required").and_then(Value::as_array) else {
            return Ok(());
        };

        for param in required.iter().filter_map(Value::as_str) {
            if args.get(param).is_none_or(Value::is_null) {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter: {param}"
                )));
            }
        }

        Ok(())
    }
}

/// Registry for available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.list()).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool, returning any binding it replaced
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Option<Arc<dyn Tool>> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a shared tool, returning any binding it replaced.
    ///
    /// Replacing an existing name is an operator action and is logged.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            warn!(tool = %name, "Tool already registered, replacing previous binding");
        } else {
            debug!(tool = %name, "Registered tool");
        }
        previous
    }

    /// Remove a tool
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Whether a tool is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All tool definitions, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.definition())
            .collect()
    }

    /// Execute a tool, converting every failure into an error string
    pub async fn execute(&self, name: &str, args: Value) -> String {
        let Some(tool) = self.get(name) else {
            error!(tool = %name, "Tool not found");
            return format!("Error: {}", AgentError::ToolNotFound(name.to_string()));
        };

        if let Err(e) = tool.validate(&args) {
            return format!("Error: {e}");
        }

        debug!(tool = %name, %args, "Executing tool");
        match tool.execute(args).await {
            Ok(output) => output,
            Err(e) => {
                error!(tool = %name, error = %e, "Tool execution failed");
                format!("Error: tool {name} failed: {e}")
            }
        }
    }

    /// Generate system prompt section describing available tools
    pub fn generate_prompt_section(&self) -> String {
        let mut prompt = String::from("## Available Tools\n\n");
        prompt.push_str("Call a tool by responding with a JSON block:\n\n");
        prompt.push_str("```tool\n{\"tool\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}\n```\n\n");

        for def in self.definitions() {
            prompt.push_str(&format!("### {}\n{}\n", def.name, def.description));
            if let Some(props) = def.parameters.get("properties").and_then(Value::as_object) {
                let required: Vec<&str> = def
                    .parameters
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|r| r.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                if !props.is_empty() {
                    prompt.push_str("**Parameters:**\n");
                }
                for (name, spec) in props {
                    let ty = spec.get("type").and_then(Value::as_str).unwrap_or("any");
                    let desc = spec.get("description").and_then(Value::as_str).unwrap_or("");
                    let req = if required.contains(&name.as_str()) { " (required)" } else { "" };
                    prompt.push_str(&format!("- `{name}` ({ty}){req}: {desc}\n"));
                }
            }
            prompt.push('\n');
        }

        prompt
    }
}
