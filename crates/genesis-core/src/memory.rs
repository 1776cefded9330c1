//! Vector Memory
//!
//! Small persistent store of text snippets with embeddings, searched by
//! cosine similarity. The whole collection lives in one JSON file that is
//! rewritten on every mutation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::Metadata;
use crate::provider::LlmProvider;

/// Turns text into a vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embeds through any [`LlmProvider`], including the router
#[derive(Clone)]
pub struct ProviderEmbedder(pub Arc<dyn LlmProvider>);

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.0.embed(text).await
    }
}

/// A stored snippet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Missing for entries written before an embedder was configured
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// A search result; never carries the embedding
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub score: f64,
}

/// Cosine similarity; 0 for empty, mismatched, or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let x = f64::from(*x);
        let y = f64::from(*y);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 { 0.0 } else { dot / denom }
}

/// Ranks stored items against a query vector
pub trait SimilarityIndex: Send + Sync {
    /// `(item index, score)` pairs, best first, at most `limit`
    fn rank(&self, query: &[f32], items: &[MemoryItem], limit: usize) -> Vec<(usize, f64)>;
}

/// Linear scan over every embedded item
#[derive(Clone, Copy, Debug, Default)]
pub struct BruteForceIndex;

impl SimilarityIndex for BruteForceIndex {
    fn rank(&self, query: &[f32], items: &[MemoryItem], limit: usize) -> Vec<(usize, f64)> {
        let mut scored: Vec<(usize, f64)> = items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                item.embedding
                    .as_deref()
                    .map(|e| (i, cosine_similarity(query, e)))
            })
            .collect();
        // stable: equal scores keep insertion order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);
        scored
    }
}

/// File-backed vector store
pub struct VectorMemory {
    path: PathBuf,
    embedder: Option<Arc<dyn Embedder>>,
    index: Box<dyn SimilarityIndex>,
    items: RwLock<Vec<MemoryItem>>,
}

impl std::fmt::Debug for VectorMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorMemory")
            .field("path", &self.path)
            .field("has_embedder", &self.embedder.is_some())
            .finish_non_exhaustive()
    }
}

/// Where an unreadable store is moved before it can be overwritten
fn quarantine_path(path: &Path) -> PathBuf {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    PathBuf::from(aside)
}

fn load_items(path: &Path) -> Vec<MemoryItem> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        let aside = quarantine_path(path);
        match fs::rename(path, &aside) {
            Ok(()) => warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                error = %e,
                "Memory file unreadable, moved aside and starting empty"
            ),
            Err(rename_err) => warn!(
                path = %path.display(),
                error = %e,
                rename_error = %rename_err,
                "Memory file unreadable and could not be moved aside, starting empty"
            ),
        }
        Vec::new()
    })
}

impl VectorMemory {
    /// Load the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        let path = path.into();
        let items = load_items(&path);
        debug!(path = %path.display(), items = items.len(), "Vector memory loaded");
        Self {
            path,
            embedder,
            index: Box::new(BruteForceIndex),
            items: RwLock::new(items),
        }
    }

    /// Replace the ranking strategy
    #[must_use]
    pub fn with_index(mut self, index: impl SimilarityIndex + 'static) -> Self {
        self.index = Box::new(index);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, items: &[MemoryItem]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(items)?;
        let persist_err = |e: std::io::Error| AgentError::Persistence(format!("{}: {e}", self.path.display()));

        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(persist_err)?;
        tmp.write_all(body.as_bytes()).map_err(persist_err)?;
        tmp.persist(&self.path).map(|_| ()).map_err(|e| persist_err(e.error))
    }

    /// Embed and store `content`, returning its embedding
    pub async fn add(&self, content: impl Into<String>, metadata: Option<Metadata>) -> Result<Vec<f32>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| AgentError::Config("vector memory has no embedder".into()))?;

        let content = content.into();
        let embedding = embedder.embed(&content).await?;

        let mut items = self.items.write().await;
        items.push(MemoryItem {
            id: Uuid::new_v4().to_string(),
            content,
            metadata: metadata.unwrap_or_default(),
            embedding: Some(embedding.clone()),
            created_at: Utc::now(),
        });
        if let Err(e) = self.persist(&items) {
            items.pop();
            return Err(e);
        }
        Ok(embedding)
    }

    /// Top `limit` items by similarity to `query`
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query_vec = embedder.embed(query).await?;
        let items = self.items.read().await;

        Ok(self
            .index
            .rank(&query_vec, &items, limit)
            .into_iter()
            .map(|(i, score)| {
                let item = &items[i];
                MemoryHit {
                    id: item.id.clone(),
                    content: item.content.clone(),
                    metadata: item.metadata.clone(),
                    created_at: item.created_at,
                    score,
                }
            })
            .collect())
    }

    /// Remove an item; `false` if no item had that id
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut items = self.items.write().await;
        let Some(pos) = items.iter().position(|item| item.id == id) else {
            return Ok(false);
        };
        let removed = items.remove(pos);
        if let Err(e) = self.persist(&items) {
            items.insert(pos, removed);
            return Err(e);
        }
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Snapshot of all stored items
    pub async fn items(&self) -> Vec<MemoryItem> {
        self.items.read().await.clone()
    }
}
