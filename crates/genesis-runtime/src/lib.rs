//! # genesis-runtime
//!
//! Concrete providers, environment configuration, and host tools for the
//! Genesis op executor.
//!
//! ## Providers
//!
//! - **OpenAI-compatible** (OpenRouter, DeepSeek, OpenAI, Gemini proxy) over `reqwest`
//! - **Ollama** (feature `ollama`, default): local inference and embeddings
//!
//! ## Usage
//!
//! ```rust,ignore
//! use genesis_runtime::{RuntimeConfig, default_tools};
//!
//! let config = RuntimeConfig::from_env();
//! let router = Arc::new(config.build_router()?);
//! let executor = OpExecutor::new(Arc::new(default_tools(&config)), router, reasoning);
//! ```

pub mod config;
pub mod jobs;
#[cfg(feature = "ollama")]
pub mod ollama;
pub mod openai;
pub mod shell;

use std::sync::Arc;

pub use config::RuntimeConfig;
pub use jobs::{JobManager, JobPoll, JobStatus};
#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;
pub use openai::{OpenAiCompatConfig, OpenAiCompatProvider};
pub use shell::{JobStatusTool, ShellTool};

// Re-export core types for convenience
pub use genesis_core::{
    AgentError, LlmProvider, Message, OpExecutor, OpResult, OpSpec, ProviderRouter, ReactLoop, Result,
    Role, Tool, ToolRegistry,
};

/// Registry with the host tools sharing one [`JobManager`]
///
/// The shell timeout stays under the loop's per-tool ceiling.
pub fn default_tools(config: &RuntimeConfig) -> ToolRegistry {
    let jobs = Arc::new(JobManager::new());
    let mut registry = ToolRegistry::new();
    registry.register(ShellTool::new(Arc::clone(&jobs)).with_timeout(config.tool_timeout * 9 / 10));
    registry.register(JobStatusTool::new(jobs));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tools() {
        let config = RuntimeConfig::from_lookup(|_| None);
        let registry = default_tools(&config);
        assert_eq!(registry.list(), ["job_status", "shell"]);
    }
}
