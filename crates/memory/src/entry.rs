//! The record shape persisted by the memory store and the scored shape
//! returned from search.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest `content()` string handed to the embedding client. Small local
/// embedding models degrade badly on very long inputs, so the combined
/// user+assistant text is capped rather than sent verbatim.
const MAX_EMBEDDING_CONTENT_CHARS: usize = 2000;

/// One recorded user/assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub user_message: String,
    pub assistant_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MemoryEntry {
    pub fn new(user_message: impl Into<String>, assistant_message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_message: user_message.into(),
            assistant_message: assistant_message.into(),
            timestamp: Utc::now(),
            session_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// The text embedded and indexed for keyword matching: `"User: {u}\n
    /// Assistant: {a}"`, truncated to a length safe for small embedding
    /// models. Truncation lands on a char boundary.
    pub fn content(&self) -> String {
        let full = format!("User: {}\nAssistant: {}", self.user_message, self.assistant_message);
        if full.chars().count() <= MAX_EMBEDDING_CONTENT_CHARS {
            return full;
        }
        full.chars().take(MAX_EMBEDDING_CONTENT_CHARS).collect()
    }

    /// Formats this entry as the pinned context text a caller injects into
    /// the context manager via `set_memories`, prefixed `"[Memory from"` so
    /// it is recognizable in the windowed message list.
    pub fn as_context_text(&self) -> String {
        format!(
            "[Memory from {}]\nUser: {}\nAssistant: {}",
            self.timestamp.to_rfc3339(),
            self.user_message,
            self.assistant_message
        )
    }
}

/// A single scored hit from [`crate::store::MemoryStore::search`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub entry: MemoryEntry,
    pub semantic_score: f32,
    pub keyword_score: f32,
    pub combined_score: f32,
}

impl SearchResult {
    pub fn new(entry: MemoryEntry, semantic_score: f32, keyword_score: f32) -> Self {
        let combined_score = 0.7 * semantic_score + 0.3 * keyword_score;
        Self {
            entry,
            semantic_score,
            keyword_score,
            combined_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_formats_user_then_assistant() {
        let entry = MemoryEntry::new("hello", "hi there");
        assert_eq!(entry.content(), "User: hello\nAssistant: hi there");
    }

    #[test]
    fn content_caps_at_max_length() {
        let entry = MemoryEntry::new("a".repeat(5000), "b".repeat(5000));
        assert!(entry.content().chars().count() <= MAX_EMBEDDING_CONTENT_CHARS);
    }

    #[test]
    fn as_context_text_starts_with_memory_from_prefix() {
        let entry = MemoryEntry::new("what's rust?", "a systems language");
        assert!(entry.as_context_text().starts_with("[Memory from"));
    }

    #[test]
    fn combined_score_is_weighted_average() {
        let result = SearchResult::new(MemoryEntry::new("u", "a"), 1.0, 0.0);
        assert!((result.combined_score - 0.7).abs() < 1e-6);
        let result = SearchResult::new(MemoryEntry::new("u", "a"), 0.0, 1.0);
        assert!((result.combined_score - 0.3).abs() < 1e-6);
    }
}
