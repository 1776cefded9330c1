//! Conversation Management
//!
//! Per-session message history persisted as one pretty-printed JSON file
//! per session under a storage directory. Loaded lazily into an in-memory
//! cache; every mutation is written back before it returns.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::message::{Message, Metadata, Role};

/// Owner assigned to sessions created implicitly by `add_message`
pub const DEFAULT_USER: &str = "default";

/// A persisted conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub session_id: String,
    pub user_id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Conversation {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Duration since creation
    pub fn duration(&self) -> chrono::Duration {
        self.updated_at - self.created_at
    }
}

/// Counts and timestamps for one conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub session_id: String,
    pub user_id: String,
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_secs: i64,
}

/// File-backed conversation store
pub struct ConversationManager {
    storage_dir: PathBuf,
    cache: RwLock<HashMap<String, Conversation>>,
}

impl std::fmt::Debug for ConversationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationManager")
            .field("storage_dir", &self.storage_dir)
            .finish_non_exhaustive()
    }
}

/// Session ids are caller-supplied; keep them to one path component
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-encoded, so distinct ids
/// never share a file.
fn file_stem(session_id: &str) -> String {
    let mut stem = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

fn read_conversation(path: &Path) -> Option<Conversation> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(conv) => Some(conv),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable conversation file");
            None
        }
    }
}

impl ConversationManager {
    /// Open a store rooted at `storage_dir`, creating it if needed
    pub fn new(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir)?;
        Ok(Self {
            storage_dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.json", file_stem(session_id)))
    }

    fn persist(&self, conv: &Conversation) -> Result<()> {
        let path = self.path_for(&conv.session_id);
        let body = serde_json::to_string_pretty(conv)?;
        let persist_err = |e: std::io::Error| AgentError::Persistence(format!("{}: {e}", path.display()));

        let mut tmp = NamedTempFile::new_in(&self.storage_dir).map_err(persist_err)?;
        tmp.write_all(body.as_bytes()).map_err(persist_err)?;
        tmp.persist(&path).map_err(|e| persist_err(e.error))?;
        debug!(session_id = %conv.session_id, messages = conv.len(), "Conversation saved");
        Ok(())
    }

    fn read_from_disk(&self, session_id: &str) -> Option<Conversation> {
        read_conversation(&self.path_for(session_id)).filter(|conv| conv.session_id == session_id)
    }

    /// Cached copy, loading from disk on first access
    fn load(&self, session_id: &str) -> Option<Conversation> {
        if let Some(conv) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            return Some(conv.clone());
        }

        let conv = self.read_from_disk(session_id)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_insert_with(|| conv.clone());
        Some(conv)
    }

    /// Fail if the session's file holds a different session
    fn ensure_unclaimed(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        match read_conversation(&path) {
            Some(other) if other.session_id != session_id => Err(AgentError::Persistence(format!(
                "{} belongs to session {}",
                path.display(),
                other.session_id
            ))),
            _ => Ok(()),
        }
    }

    /// Start a new, empty conversation in the cache
    ///
    /// Nothing is written until the first message is added.
    pub fn create(&self, session_id: &str, user_id: &str) -> Conversation {
        let conv = Conversation::new(session_id, user_id);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), conv.clone());
        conv
    }

    /// Conversation by id; `None` if absent or its file is unreadable
    pub fn get(&self, session_id: &str) -> Option<Conversation> {
        self.load(session_id)
    }

    /// Append a message, creating the session under [`DEFAULT_USER`] if needed
    pub fn add_message(
        &self,
        session_id: &str,
        role: Role,
        content: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        // The write guard spans read, append and persist so concurrent
        // appends to one session serialize.
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let mut conv = match cache.get(session_id) {
            Some(conv) => conv.clone(),
            None => match self.read_from_disk(session_id) {
                Some(conv) => conv,
                None => {
                    self.ensure_unclaimed(session_id)?;
                    Conversation::new(session_id, DEFAULT_USER)
                }
            },
        };

        let mut message = Message::new(role, content);
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }
        conv.messages.push(message);
        conv.touch();

        self.persist(&conv)?;
        cache.insert(session_id.to_string(), conv);
        Ok(())
    }

    /// Messages in chronological order, optionally filtered by role and
    /// limited to the last `limit` matches
    pub fn get_messages(&self, session_id: &str, limit: Option<usize>, role: Option<Role>) -> Vec<Message> {
        let Some(conv) = self.load(session_id) else {
            return Vec::new();
        };

        let mut messages: Vec<Message> = conv
            .messages
            .into_iter()
            .filter(|m| role.is_none_or(|r| m.role == r))
            .collect();

        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        messages
    }

    /// Most recent messages whose estimated tokens fit in `max_tokens`
    ///
    /// Walks newest to oldest and stops at the first message that would
    /// overflow the budget. The result is in chronological order.
    pub fn get_context_messages(&self, session_id: &str, max_tokens: usize) -> Vec<Message> {
        let Some(conv) = self.load(session_id) else {
            return Vec::new();
        };

        let mut used = 0usize;
        let mut context: Vec<Message> = Vec::new();
        for msg in conv.messages.into_iter().rev() {
            let tokens = msg.estimate_tokens();
            if used + tokens > max_tokens {
                break;
            }
            used += tokens;
            context.push(msg);
        }
        context.reverse();
        context
    }

    /// Forget a session: evict it from the cache and delete its file
    pub fn clear(&self, session_id: &str) -> Result<()> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.remove(session_id);
        self.ensure_unclaimed(session_id)?;

        let path = self.path_for(session_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(session_id, "Conversation cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Persistence(format!("{}: {e}", path.display()))),
        }
    }

    /// Session ids on disk, optionally only those owned by `user_id`
    pub fn list(&self, user_id: Option<&str>) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.storage_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(conv) = read_conversation(&path) else {
                continue;
            };
            if user_id.is_none_or(|u| conv.user_id == u) {
                ids.push(conv.session_id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn summary(&self, session_id: &str) -> Option<ConversationSummary> {
        let conv = self.load(session_id)?;
        let count = |role: Role| conv.messages.iter().filter(|m| m.role == role).count();

        Some(ConversationSummary {
            session_id: conv.session_id.clone(),
            user_id: conv.user_id.clone(),
            total_messages: conv.len(),
            user_messages: count(Role::User),
            assistant_messages: count(Role::Assistant),
            created_at: conv.created_at,
            updated_at: conv.updated_at,
            duration_secs: conv.duration().num_seconds(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, ConversationManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ConversationManager::new(dir.path()).unwrap();
        (dir, mgr)
    }

    #[test]
    fn test_add_message_creates_default_session() {
        let (_dir, mgr) = manager();
        mgr.add_message("s1", Role::User, "hello", None).unwrap();

        let conv = mgr.get("s1").unwrap();
        assert_eq!(conv.user_id, DEFAULT_USER);
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].content, "hello");
    }

    #[test]
    fn test_messages_survive_a_fresh_manager() {
        let (dir, mgr) = manager();
        mgr.create("s1", "alice");
        mgr.add_message("s1", Role::User, "hi", None).unwrap();
        mgr.add_message("s1", Role::Assistant, "hello alice", None).unwrap();
        drop(mgr);

        let reopened = ConversationManager::new(dir.path()).unwrap();
        let conv = reopened.get("s1").unwrap();
        assert_eq!(conv.user_id, "alice");
        let contents: Vec<_> = conv.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["hi", "hello alice"]);
    }

    #[test]
    fn test_get_messages_filter_and_limit() {
        let (_dir, mgr) = manager();
        for (role, text) in [
            (Role::User, "u1"),
            (Role::Assistant, "a1"),
            (Role::User, "u2"),
            (Role::Assistant, "a2"),
            (Role::User, "u3"),
        ] {
            mgr.add_message("s", role, text, None).unwrap();
        }

        let users: Vec<_> = mgr
            .get_messages("s", Some(2), Some(Role::User))
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(users, ["u2", "u3"]);
        assert_eq!(mgr.get_messages("s", None, None).len(), 5);
        assert!(mgr.get_messages("missing", None, None).is_empty());
    }

    #[test]
    fn test_context_window_keeps_newest_in_order() {
        let (_dir, mgr) = manager();
        // 8 tokens each at 4 chars per token
        for text in ["a".repeat(32), "b".repeat(32), "c".repeat(32)] {
            mgr.add_message("s", Role::User, text, None).unwrap();
        }

        let ctx = mgr.get_context_messages("s", 20);
        assert_eq!(ctx.len(), 2);
        assert!(ctx[0].content.starts_with('b'));
        assert!(ctx[1].content.starts_with('c'));

        assert!(mgr.get_context_messages("s", 0).is_empty());
        assert_eq!(mgr.get_context_messages("s", 1_000).len(), 3);
    }

    #[test]
    fn test_clear_removes_session() {
        let (dir, mgr) = manager();
        mgr.add_message("s", Role::User, "x", None).unwrap();
        mgr.clear("s").unwrap();

        assert!(mgr.get("s").is_none());
        assert!(!dir.path().join("s.json").exists());
        assert!(mgr.get_messages("s", None, None).is_empty());
        mgr.clear("never-created").unwrap();
    }

    #[test]
    fn test_list_filters_by_user() {
        let (_dir, mgr) = manager();
        mgr.create("a", "alice");
        mgr.add_message("a", Role::User, "1", None).unwrap();
        mgr.create("b", "bob");
        mgr.add_message("b", Role::User, "2", None).unwrap();
        mgr.add_message("c", Role::User, "3", None).unwrap();

        assert_eq!(mgr.list(None).unwrap(), ["a", "b", "c"]);
        assert_eq!(mgr.list(Some("bob")).unwrap(), ["b"]);
        assert_eq!(mgr.list(Some(DEFAULT_USER)).unwrap(), ["c"]);
    }

    #[test]
    fn test_corrupt_file_reads_as_absent() {
        let (dir, mgr) = manager();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        assert!(mgr.get("broken").is_none());
        assert!(mgr.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_summary_counts_roles() {
        let (_dir, mgr) = manager();
        mgr.add_message("s", Role::System, "sys", None).unwrap();
        mgr.add_message("s", Role::User, "q", None).unwrap();
        mgr.add_message("s", Role::Assistant, "a", None).unwrap();

        let summary = mgr.summary("s").unwrap();
        assert_eq!(summary.total_messages, 3);
        assert_eq!(summary.user_messages, 1);
        assert_eq!(summary.assistant_messages, 1);
        assert!(summary.duration_secs >= 0);
        assert!(mgr.summary("missing").is_none());
    }

    #[test]
    fn test_session_id_cannot_escape_storage_dir() {
        let (dir, mgr) = manager();
        mgr.add_message("../evil", Role::User, "x", None).unwrap();
        assert!(dir.path().join("..%2Fevil.json").exists());
        assert_eq!(mgr.get("../evil").unwrap().messages.len(), 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_similar_ids_keep_separate_histories() {
        let (dir, mgr) = manager();
        mgr.add_message("team_a", Role::User, "important history", None).unwrap();

        let fresh = ConversationManager::new(dir.path()).unwrap();
        fresh.add_message("team/a", Role::User, "other team", None).unwrap();

        let reopened = ConversationManager::new(dir.path()).unwrap();
        let team_a = reopened.get_messages("team_a", None, None);
        assert_eq!(team_a.len(), 1);
        assert_eq!(team_a[0].content, "important history");
        assert_eq!(reopened.get_messages("team/a", None, None)[0].content, "other team");
        assert_eq!(reopened.list(None).unwrap(), ["team/a", "team_a"]);
    }

    #[test]
    fn test_foreign_file_is_never_overwritten() {
        let (dir, mgr) = manager();
        let squatter = Conversation::new("someone-else", DEFAULT_USER);
        let path = dir.path().join("mine.json");
        fs::write(&path, serde_json::to_string(&squatter).unwrap()).unwrap();

        let err = mgr.add_message("mine", Role::User, "x", None).unwrap_err();
        assert!(matches!(err, AgentError::Persistence(_)));
        assert!(mgr.clear("mine").is_err());
        let kept: Conversation = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(kept.session_id, "someone-else");
    }

    #[test]
    fn test_concurrent_appends_keep_every_message() {
        let (dir, mgr) = manager();
        let mgr = std::sync::Arc::new(mgr);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let mgr = std::sync::Arc::clone(&mgr);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        mgr.add_message("s", Role::User, format!("{t}-{i}"), None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mgr.get_messages("s", None, None).len(), 200);
        let reopened = ConversationManager::new(dir.path()).unwrap();
        assert_eq!(reopened.get_messages("s", None, None).len(), 200);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
