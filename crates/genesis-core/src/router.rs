//! Provider Router
//!
//! Orders several providers into a fixed failover chain and exposes a
//! single `chat` surface. The active provider is an index into the chain;
//! a failed call walks the rest of the chain and the first provider that
//! answers becomes the new active one. Promotion is sticky: later calls
//! start from it, not from the head of the chain.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{Capabilities, Completion, GenerationOptions, LlmProvider, StubProvider};

/// Multi-provider wrapper with sticky failover
pub struct ProviderRouter {
    /// Chain in failover order; names are unique
    chain: Vec<(String, Arc<dyn LlmProvider>)>,

    /// Index of the active provider in `chain`
    active: AtomicUsize,

    /// Serializes failover walks so only one promotion is in flight
    failover_lock: Mutex<()>,
}

impl ProviderRouter {
    /// Build a router from `(name, provider)` pairs in priority order.
    ///
    /// Duplicate names keep their first position. An empty chain installs
    /// the deterministic stub so the router is always callable.
    pub fn new(providers: Vec<(String, Arc<dyn LlmProvider>)>) -> Self {
        let mut chain: Vec<(String, Arc<dyn LlmProvider>)> = Vec::with_capacity(providers.len());
        for (name, provider) in providers {
            if chain.iter().any(|(n, _)| *n == name) {
                warn!(provider = %name, "Duplicate provider name in failover chain, ignoring");
                continue;
            }
            chain.push((name, provider));
        }

        if chain.is_empty() {
            warn!("No providers configured, installing stub provider");
            chain.push((StubProvider::NAME.to_string(), Arc::new(StubProvider::new())));
        }

        info!(
            order = ?chain.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            active = %chain[0].0,
            "ProviderRouter initialized"
        );

        Self {
            chain,
            active: AtomicUsize::new(0),
            failover_lock: Mutex::new(()),
        }
    }

    /// Convenience constructor keyed by each provider's own name
    pub fn from_providers(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self::new(
            providers
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
        )
    }

    /// Provider names in failover order
    pub fn failover_order(&self) -> Vec<&str> {
        self.chain.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// `(name, provider)` pairs in failover order
    pub fn providers(&self) -> impl Iterator<Item = (&str, &Arc<dyn LlmProvider>)> {
        self.chain.iter().map(|(n, p)| (n.as_str(), p))
    }

    /// Name of the active provider
    pub fn active_provider_name(&self) -> &str {
        &self.chain[self.active.load(Ordering::SeqCst)].0
    }

    /// The active provider
    pub fn active_provider(&self) -> Arc<dyn LlmProvider> {
        Arc::clone(&self.chain[self.active.load(Ordering::SeqCst)].1)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.chain.iter().position(|(n, _)| n == name)
    }

    fn promote(&self, from: usize, to: usize, reason: &str) {
        self.active.store(to, Ordering::SeqCst);
        warn!(
            from = %self.chain[from].0,
            to = %self.chain[to].0,
            reason,
            "Switching provider"
        );
    }

    /// Explicit operator switch
    pub async fn switch_to(&self, name: &str) -> Result<()> {
        let target = self
            .index_of(name)
            .ok_or_else(|| AgentError::Config(format!("Cannot switch to unknown provider: {name}")))?;
        let _guard = self.failover_lock.lock().await;
        let current = self.active.load(Ordering::SeqCst);
        if current != target {
            self.promote(current, target, "operator switch");
        }
        Ok(())
    }

    /// Chat with failover.
    ///
    /// Fails only when every provider from the active one to the end of the
    /// chain has failed; the error returned is the active provider's.
    pub async fn chat(&self, messages: &[Message], options: &GenerationOptions) -> Result<Completion> {
        let start = self.active.load(Ordering::SeqCst);
        let original = match self.chain[start].1.chat(messages, options).await {
            Ok(completion) => return Ok(completion),
            Err(e) => e,
        };

        let _guard = self.failover_lock.lock().await;
        warn!(
            provider = %self.chain[start].0,
            error = %original,
            retryable = original.is_retryable(),
            "Provider failed, starting failover"
        );

        for idx in start + 1..self.chain.len() {
            let (name, provider) = &self.chain[idx];
            debug!(provider = %name, "Trying failover candidate");
            match provider.chat(messages, options).await {
                Ok(completion) => {
                    let current = self.active.load(Ordering::SeqCst);
                    if current != idx {
                        self.promote(current, idx, &original.to_string());
                    }
                    return Ok(completion);
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "Failover candidate also failed");
                }
            }
        }

        Err(original)
    }

    /// Embed through the first embedding-capable provider, starting at the
    /// active one and wrapping around the chain.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let start = self.active.load(Ordering::SeqCst);
        let mut last_err = None;
        for offset in 0..self.chain.len() {
            let (name, provider) = &self.chain[(start + offset) % self.chain.len()];
            if !provider.capabilities().embed {
                continue;
            }
            match provider.embed(text).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(provider = %name, error = %e, "Embedding failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            AgentError::ProviderUnavailable("no provider in the chain supports embeddings".into())
        }))
    }
}

#[async_trait]
impl LlmProvider for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn capabilities(&self) -> Capabilities {
        self.chain.iter().fold(Capabilities::default(), |acc, (_, p)| {
            let c = p.capabilities();
            Capabilities {
                chat: acc.chat || c.chat,
                embed: acc.embed || c.embed,
                streaming: acc.streaming || c.streaming,
            }
        })
    }

    async fn health_check(&self) -> Result<bool> {
        self.active_provider().health_check().await
    }

    async fn chat(&self, messages: &[Message], options: &GenerationOptions) -> Result<Completion> {
        Self::chat(self, messages, options).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Self::embed(self, text).await
    }
}
