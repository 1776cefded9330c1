//! Runtime Configuration
//!
//! Everything is read from the environment (optionally seeded from `.env`
//! by the binary). Providers without credentials are left out of the
//! failover chain.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use genesis_core::{
    error::Result,
    executor::DEFAULT_OP_TIMEOUT,
    provider::LlmProvider,
    reasoning::ReactConfig,
    router::ProviderRouter,
};
use tracing::info;

#[cfg(feature = "ollama")]
use crate::ollama::{OllamaConfig, OllamaProvider};
use crate::openai::{OpenAiCompatConfig, OpenAiCompatProvider};

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
const DEEPSEEK_URL: &str = "https://api.deepseek.com/v1";
const OPENAI_URL: &str = "https://api.openai.com/v1";
const GEMINI_PROXY_URL: &str = "http://127.0.0.1:8045/v1";

const DEFAULT_DATA_DIR: &str = ".genesis";
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Assembled runtime settings
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// OpenRouter, or DeepSeek when no OpenRouter key is set
    pub primary: Option<OpenAiCompatConfig>,
    /// Low-cost fallback
    pub gemini: Option<OpenAiCompatConfig>,
    /// General fallback
    pub openai: Option<OpenAiCompatConfig>,
    /// Local provider
    #[cfg(feature = "ollama")]
    pub ollama: Option<OllamaConfig>,
    pub data_dir: PathBuf,
    pub op_timeout: Duration,
    pub tool_timeout: Duration,
}

#[cfg(feature = "ollama")]
fn flag(value: Option<String>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn secs(value: Option<String>, default: u64) -> Duration {
    Duration::from_secs(value.and_then(|v| v.trim().parse().ok()).unwrap_or(default))
}

impl RuntimeConfig {
    /// Read from process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    /// Read through an arbitrary key lookup
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let primary = if let Some(key) = get("OPENROUTER_API_KEY") {
            Some(OpenAiCompatConfig {
                name: "openrouter".into(),
                base_url: OPENROUTER_URL.into(),
                api_key: key,
                model: get("OPENROUTER_MODEL").unwrap_or_else(|| "deepseek/deepseek-chat".into()),
                embed_model: None,
            })
        } else {
            get("DEEPSEEK_API_KEY").map(|key| OpenAiCompatConfig {
                name: "deepseek".into(),
                base_url: get("DEEPSEEK_BASE_URL").unwrap_or_else(|| DEEPSEEK_URL.into()),
                api_key: key,
                model: get("DEEPSEEK_MODEL").unwrap_or_else(|| "deepseek-chat".into()),
                embed_model: None,
            })
        };

        let gemini = get("GEMINI_API_KEY").map(|key| OpenAiCompatConfig {
            name: "gemini".into(),
            base_url: get("GEMINI_BASE_URL").unwrap_or_else(|| GEMINI_PROXY_URL.into()),
            api_key: key,
            model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-1.5-flash".into()),
            embed_model: None,
        });

        let openai = get("OPENAI_API_KEY").map(|key| OpenAiCompatConfig {
            name: "openai".into(),
            base_url: OPENAI_URL.into(),
            api_key: key,
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".into()),
            embed_model: Some(get("OPENAI_EMBED_MODEL").unwrap_or_else(|| "text-embedding-3-small".into())),
        });

        #[cfg(feature = "ollama")]
        let ollama = flag(get("OLLAMA_ENABLED")).then(|| OllamaConfig::from_lookup(&get));

        Self {
            primary,
            gemini,
            openai,
            #[cfg(feature = "ollama")]
            ollama,
            data_dir: get("GENESIS_DATA_DIR").map_or_else(|| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from),
            op_timeout: secs(get("GENESIS_OP_TIMEOUT_SECS"), DEFAULT_OP_TIMEOUT.as_secs()),
            tool_timeout: secs(get("GENESIS_TOOL_TIMEOUT_SECS"), DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }

    /// Directory holding one JSON file per conversation
    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    /// Vector memory blob
    pub fn memory_path(&self) -> PathBuf {
        self.data_dir.join("memories_vector.json")
    }

    /// Reasoning loop settings derived from this config
    pub fn react_config(&self) -> ReactConfig {
        ReactConfig {
            tool_timeout: self.tool_timeout,
            ..ReactConfig::default()
        }
    }

    /// Providers in failover order: primary, gemini, openai, ollama
    pub fn providers(&self) -> Result<Vec<Arc<dyn LlmProvider>>> {
        let mut chain: Vec<Arc<dyn LlmProvider>> = Vec::new();
        for config in [&self.primary, &self.gemini, &self.openai].into_iter().flatten() {
            chain.push(Arc::new(OpenAiCompatProvider::new(config.clone())?));
        }
        #[cfg(feature = "ollama")]
        if let Some(config) = &self.ollama {
            chain.push(Arc::new(OllamaProvider::from_config(config.clone())));
        }
        Ok(chain)
    }

    /// Failover router over [`Self::providers`]; the stub if none are set
    pub fn build_router(&self) -> Result<ProviderRouter> {
        let router = ProviderRouter::from_providers(self.providers()?);
        info!(
            chain = ?router.failover_order(),
            active = %router.active_provider_name(),
            "Provider router ready"
        );
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> RuntimeConfig {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect();
        RuntimeConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let cfg = config(&[]);
        assert!(cfg.primary.is_none());
        assert_eq!(cfg.op_timeout, Duration::from_secs(300));
        assert_eq!(cfg.tool_timeout, Duration::from_secs(60));
        assert_eq!(cfg.memory_path(), PathBuf::from(".genesis/memories_vector.json"));
    }

    #[test]
    fn test_openrouter_wins_primary_slot() {
        let cfg = config(&[("OPENROUTER_API_KEY", "or"), ("DEEPSEEK_API_KEY", "ds")]);
        let primary = cfg.primary.unwrap();
        assert_eq!(primary.name, "openrouter");
        assert_eq!(primary.base_url, OPENROUTER_URL);

        let cfg = config(&[("DEEPSEEK_API_KEY", "ds"), ("DEEPSEEK_MODEL", "deepseek-reasoner")]);
        let primary = cfg.primary.unwrap();
        assert_eq!(primary.name, "deepseek");
        assert_eq!(primary.model, "deepseek-reasoner");
    }

    #[test]
    fn test_router_order_follows_chain() {
        let cfg = config(&[
            ("OPENAI_API_KEY", "oa"),
            ("GEMINI_API_KEY", "gm"),
            ("DEEPSEEK_API_KEY", "ds"),
            ("GENESIS_OP_TIMEOUT_SECS", "30"),
        ]);
        let router = cfg.build_router().unwrap();
        assert_eq!(router.failover_order(), ["deepseek", "gemini", "openai"]);
        assert_eq!(router.active_provider_name(), "deepseek");
        assert_eq!(cfg.op_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_chain_uses_stub() {
        let router = config(&[]).build_router().unwrap();
        assert_eq!(router.failover_order(), ["stub"]);
    }

    #[cfg(feature = "ollama")]
    #[test]
    fn test_ollama_needs_explicit_opt_in() {
        assert!(config(&[("OLLAMA_HOST", "http://box")]).ollama.is_none());
        let cfg = config(&[("OLLAMA_ENABLED", "true"), ("OLLAMA_PORT", "9999")]);
        assert_eq!(cfg.ollama.as_ref().map(|o| o.port), Some(9999));
        assert_eq!(cfg.build_router().unwrap().failover_order(), ["ollama"]);
    }
}
