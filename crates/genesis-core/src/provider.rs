//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for all LLM backends (Ollama, OpenAI-compatible
//! HTTP endpoints, the deterministic stub) so the router and the reasoning
//! loop can work with any of them without code changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use genesis_core::provider::{GenerationOptions, LlmProvider};
//!
//! let completion = provider.chat(&messages, &GenerationOptions::default()).await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::Message;

/// Configuration for LLM generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier; empty means "provider default"
    #[serde(default)]
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Top-p nucleus sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Stop sequences
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

const fn default_temperature() -> f32 { 0.7 }
const fn default_max_tokens() -> u32 { 2048 }
const fn default_top_p() -> f32 { 0.9 }

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            stop_sequences: Vec::new(),
        }
    }
}

impl GenerationOptions {
    /// Resolve the model name against a provider default
    pub fn model_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.model.is_empty() { fallback } else { &self.model }
    }
}

/// Response from an LLM completion
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Completion {
    /// The generated text
    pub content: String,

    /// Model that generated this response
    pub model: String,

    /// Token usage statistics (if available)
    pub usage: Option<TokenUsage>,

    /// Finish reason
    pub finish_reason: Option<FinishReason>,
}

impl Completion {
    pub fn total_tokens(&self) -> u64 {
        self.usage.as_ref().map_or(0, |u| u64::from(u.total_tokens))
    }
}

/// Token usage statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason for completion finishing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Error,
}

/// What a provider can do
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub chat: bool,
    pub embed: bool,
    pub streaming: bool,
}

impl Capabilities {
    pub const CHAT_ONLY: Self = Self { chat: true, embed: false, streaming: false };
}

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider name, used as the key in the failover chain
    fn name(&self) -> &str;

    /// Capability flags
    fn capabilities(&self) -> Capabilities {
        Capabilities::CHAT_ONLY
    }

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Generate a completion from messages
    async fn chat(&self, messages: &[Message], options: &GenerationOptions) -> Result<Completion>;

    /// Produce an embedding vector for `text`
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(AgentError::Provider(format!(
            "{} does not support embeddings",
            self.name()
        )))
    }

    /// Estimate token count for text
    fn estimate_tokens(&self, text: &str) -> u32 {
        // Default: rough estimate of ~4 chars per token
        u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
    }
}

/// Dimension of stub embeddings
pub const STUB_EMBEDDING_DIM: usize = 64;

/// Deterministic last-resort provider
///
/// Installed by the router when no real backend is configured so the chat
/// surface is always callable.
#[derive(Debug, Default)]
pub struct StubProvider {
    calls: AtomicU64,
}

impl StubProvider {
    pub const NAME: &'static str = "stub";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { chat: true, embed: true, streaming: false }
    }

    async fn chat(&self, _messages: &[Message], _options: &GenerationOptions) -> Result<Completion> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Completion {
            content: format!("Stub response #{n}"),
            model: "stub-model".into(),
            usage: Some(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
            }),
            finish_reason: Some(FinishReason::Stop),
        })
    }

    /// Hashed character-trigram bag, L2-normalised
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; STUB_EMBEDDING_DIM];
        let chars: Vec<char> = text.to_lowercase().chars().collect();
        for window in chars.windows(3.min(chars.len().max(1))) {
            let mut h: u32 = 2_166_136_261;
            for c in window {
                h = (h ^ u32::from(*c)).wrapping_mul(16_777_619);
            }
            v[h as usize % STUB_EMBEDDING_DIM] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_options_defaults() {
        let opts = GenerationOptions::default();
        assert!((opts.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(opts.max_tokens, 2048);
        assert_eq!(opts.model_or("llama3.2"), "llama3.2");
    }

    #[tokio::test]
    async fn test_stub_is_deterministic() {
        let stub = StubProvider::new();
        let first = stub.chat(&[], &GenerationOptions::default()).await.unwrap();
        let second = stub.chat(&[], &GenerationOptions::default()).await.unwrap();
        assert_eq!(first.content, "Stub response #1");
        assert_eq!(second.content, "Stub response #2");
        assert_eq!(first.total_tokens(), 150);

        let a = stub.embed("disk usage report").await.unwrap();
        let b = stub.embed("disk usage report").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), STUB_EMBEDDING_DIM);
    }
}
