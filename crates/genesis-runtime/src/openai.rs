//! OpenAI-compatible HTTP Provider
//!
//! Speaks the `/chat/completions` and `/embeddings` wire format shared by
//! OpenAI, OpenRouter, DeepSeek and Gemini's compatibility endpoint.

use std::time::Duration;

use async_trait::async_trait;
use genesis_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{Capabilities, Completion, FinishReason, GenerationOptions, LlmProvider, TokenUsage},
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection settings for one OpenAI-compatible endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenAiCompatConfig {
    /// Name used in the failover chain
    pub name: String,
    /// Base URL without trailing slash, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Embedding model; `None` disables `embed`
    pub embed_model: Option<String>,
}

/// Provider for any endpoint that speaks the OpenAI chat API
pub struct OpenAiCompatProvider {
    client: Client,
    config: OpenAiCompatConfig,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

/// Tool observations travel as user turns; a bare `tool` role without a
/// matching `tool_calls` entry is rejected by every compatible endpoint
const fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        "stop" => FinishReason::Stop,
        _ => FinishReason::Error,
    }
}

/// Map a non-success HTTP status to the error taxonomy
fn status_error(name: &str, status: StatusCode, body: &str) -> AgentError {
    let detail = format!("{name}: HTTP {status}: {}", body.chars().take(500).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(detail),
        s if s.is_server_error() => AgentError::ProviderUnavailable(detail),
        _ => AgentError::Provider(detail),
    }
}

impl OpenAiCompatProvider {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    pub const fn config(&self) -> &OpenAiCompatConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(format!("{}: {e}", self.config.name)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.config.name, status, &body));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| AgentError::Provider(format!("{}: malformed response: {e}", self.config.name)))
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: true,
            embed: self.config.embed_model.is_some(),
            streaming: false,
        }
    }

    async fn chat(&self, messages: &[Message], options: &GenerationOptions) -> Result<Completion> {
        let model = options.model_or(&self.config.model);
        let request = ChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage { role: wire_role(m.role), content: &m.content })
                .collect(),
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            stop: (!options.stop_sequences.is_empty()).then_some(options.stop_sequences.as_slice()),
        };

        debug!(provider = %self.config.name, model, messages = messages.len(), "chat request");
        let response: ChatResponse = self.post("chat/completions", &request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Provider(format!("{}: response had no choices", self.config.name)))?;

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            model: response.model.unwrap_or_else(|| model.to_string()),
            usage: response.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            finish_reason: choice.finish_reason.as_deref().map(map_finish_reason),
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let Some(model) = self.config.embed_model.as_deref() else {
            return Err(AgentError::Provider(format!(
                "{} does not support embeddings",
                self.config.name
            )));
        };

        let response: EmbeddingResponse = self
            .post("embeddings", &EmbeddingRequest { model, input: text })
            .await?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AgentError::Provider(format!("{}: no embedding returned", self.config.name)))
    }
}
