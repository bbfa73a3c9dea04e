//! The hybrid memory store: a JSON-persisted map of [`MemoryEntry`] values
//! plus a [`VectorCollection`] for semantic search, combined with keyword
//! overlap into a single ranked score.
//!
//! An in-process entry map behind a lock, with `retain`-style bulk mutation,
//! plus tokenizing of free text for keyword overlap and cosine-similarity
//! helpers, combined with a flat 0.7 semantic + 0.3 keyword weighting.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entry::{MemoryEntry, SearchResult};
use crate::vector::{FlatVectorCollection, VectorCollection};

const SIDECAR_FILE_NAME: &str = "entries_index.json";

/// Requests an embedding for a piece of text. Returns `Ok(None)` when the
/// embedding backend is unavailable or declines to embed — callers treat a
/// missing embedding as "semantic score 0 for this entry", not as a hard
/// failure of `add`.
pub type EmbedFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Option<Vec<f32>>>> + Send + Sync>;

const TIMESTAMP_KEY: &str = "timestamp";
const SESSION_KEY: &str = "session_id";

/// Persistent, searchable store of user/assistant turns.
pub struct MemoryStore {
    sidecar_path: PathBuf,
    collection: Arc<dyn VectorCollection>,
    embed: EmbedFn,
    entries: RwLock<HashMap<Uuid, MemoryEntry>>,
}

impl MemoryStore {
    /// Open (or create) a store backed by `data_dir`, using the default
    /// brute-force [`FlatVectorCollection`].
    pub async fn open(data_dir: impl AsRef<Path>, embed: EmbedFn) -> anyhow::Result<Self> {
        Self::open_with_collection(data_dir, Arc::new(FlatVectorCollection::new()), embed).await
    }

    pub async fn open_with_collection(
        data_dir: impl AsRef<Path>,
        collection: Arc<dyn VectorCollection>,
        embed: EmbedFn,
    ) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;
        let sidecar_path = data_dir.join(SIDECAR_FILE_NAME);

        let entries = load_sidecar(&sidecar_path).await?;
        for entry in entries.values() {
            let embedding = embed(entry.content()).await.unwrap_or(None);
            if let Some(embedding) = embedding {
                collection
                    .upsert(
                        entry.id.to_string(),
                        embedding,
                        entry.content(),
                        entry_metadata(entry),
                    )
                    .await?;
            }
        }

        Ok(Self {
            sidecar_path,
            collection,
            embed,
            entries: RwLock::new(entries),
        })
    }

    /// Store a turn, embedding it if possible. Returns the stored entry
    /// (with its id/timestamp filled in if they weren't set by the caller).
    pub async fn add(&self, mut entry: MemoryEntry) -> anyhow::Result<MemoryEntry> {
        if entry.id.is_nil() {
            entry.id = Uuid::new_v4();
        }
        if entry.timestamp.timestamp() == 0 {
            entry.timestamp = chrono::Utc::now();
        }

        let content = entry.content();
        let embedding = (self.embed)(content.clone()).await?;
        if let Some(embedding) = embedding {
            self.collection
                .upsert(entry.id.to_string(), embedding, content, entry_metadata(&entry))
                .await?;
        }

        {
            let mut entries = self.entries.write().await;
            entries.insert(entry.id, entry.clone());
        }
        self.persist().await?;
        Ok(entry)
    }

    /// Rank stored entries by `0.7 * semantic + 0.3 * keyword` against
    /// `query`. Returns immediately with an empty result if nothing has been
    /// embedded yet.
    pub async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<SearchResult>> {
        if self.collection.is_empty().await? {
            return Ok(Vec::new());
        }

        let query_words = keyword_set(query);
        let query_embedding = (self.embed)(query.to_string()).await?;
        let candidate_pool = self.collection.len().await?.max(limit);

        let matches = match &query_embedding {
            Some(vector) => self.collection.search(vector, candidate_pool).await?,
            None => Vec::new(),
        };

        let entries = self.entries.read().await;
        let mut results = Vec::with_capacity(matches.len());
        for hit in matches {
            let id: Uuid = match hit.id.parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let entry = match entries.get(&id) {
                Some(entry) => entry.clone(),
                None => continue,
            };
            let keyword_score = keyword_score(&query_words, &hit.content);
            results.push(SearchResult::new(entry, hit.score, keyword_score));
        }

        results.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }

    /// All entries, most recent first. `limit == 0` means unlimited.
    pub async fn list(&self, limit: usize) -> Vec<MemoryEntry> {
        let entries = self.entries.read().await;
        let mut all: Vec<MemoryEntry> = entries.values().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if limit > 0 {
            all.truncate(limit);
        }
        all
    }

    pub async fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(&id).is_some()
        };
        if removed {
            self.collection.remove(&id.to_string()).await?;
            self.persist().await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        {
            let mut entries = self.entries.write().await;
            entries.clear();
        }
        self.collection.clear().await?;
        self.persist().await
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Flush the sidecar one last time. The store has no other resources to
    /// release, but callers have a single symmetrical shutdown call to make.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.persist().await
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let entries = self.entries.read().await;
        let list: Vec<&MemoryEntry> = entries.values().collect();
        let json = serde_json::to_vec_pretty(&list)?;
        tokio::fs::write(&self.sidecar_path, json).await?;
        Ok(())
    }
}

fn entry_metadata(entry: &MemoryEntry) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(TIMESTAMP_KEY.to_string(), entry.timestamp.to_rfc3339());
    if let Some(session_id) = &entry.session_id {
        metadata.insert(SESSION_KEY.to_string(), session_id.clone());
    }
    metadata
}

/// Lowercased, length-≥3 query words, deduplicated.
fn keyword_set(query: &str) -> HashSet<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() >= 3)
        .collect()
}

/// Fraction of distinct query words appearing as substrings of `content`
/// (case-insensitive). Zero query words scores zero rather than dividing by
/// zero.
fn keyword_score(query_words: &HashSet<String>, content: &str) -> f32 {
    if query_words.is_empty() {
        return 0.0;
    }
    let lower = content.to_lowercase();
    let hits = query_words.iter().filter(|w| lower.contains(w.as_str())).count();
    hits as f32 / query_words.len() as f32
}

async fn load_sidecar(path: &Path) -> anyhow::Result<HashMap<Uuid, MemoryEntry>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<Vec<MemoryEntry>>(&bytes) {
            Ok(entries) => Ok(entries.into_iter().map(|e| (e.id, e)).collect()),
            Err(err) => {
                tracing::warn!(?err, path = %path.display(), "memory sidecar is corrupt; starting empty");
                Ok(HashMap::new())
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_embed() -> EmbedFn {
        Arc::new(|_text| Box::pin(async { Ok(None) }))
    }

    fn fixed_embed(vector: Vec<f32>) -> EmbedFn {
        Arc::new(move |_text| {
            let vector = vector.clone();
            Box::pin(async move { Ok(Some(vector)) })
        })
    }

    #[tokio::test]
    async fn add_then_count_increments() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path(), no_embed()).await.unwrap();
        assert_eq!(store.count().await, 0);
        store.add(MemoryEntry::new("hi", "hello")).await.unwrap();
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn delete_decrements_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path(), no_embed()).await.unwrap();
        let entry = store.add(MemoryEntry::new("hi", "hello")).await.unwrap();
        assert!(store.delete(entry.id).await.unwrap());
        assert_eq!(store.count().await, 0);
        assert!(!store.delete(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn clear_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path(), no_embed()).await.unwrap();
        store.add(MemoryEntry::new("a", "b")).await.unwrap();
        store.add(MemoryEntry::new("c", "d")).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn list_sorts_by_timestamp_descending_and_honors_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path(), no_embed()).await.unwrap();

        let mut first = MemoryEntry::new("first", "a");
        first.timestamp = chrono::Utc::now() - chrono::Duration::seconds(10);
        let mut second = MemoryEntry::new("second", "b");
        second.timestamp = chrono::Utc::now();

        store.add(first).await.unwrap();
        store.add(second).await.unwrap();

        let all = store.list(0).await;
        assert_eq!(all[0].user_message, "second");
        assert_eq!(all[1].user_message, "first");

        let limited = store.list(1).await;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].user_message, "second");
    }

    #[tokio::test]
    async fn search_on_empty_store_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path(), no_embed()).await.unwrap();
        let results = store.search("anything", 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn search_combines_semantic_and_keyword_scores() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path(), fixed_embed(vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .add(MemoryEntry::new("favorite language", "rust is great"))
            .await
            .unwrap();

        let results = store.search("rust", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].semantic_score - 1.0).abs() < 1e-6);
        assert!(results[0].keyword_score > 0.0);
        assert!((results[0].combined_score - (0.7 + 0.3 * results[0].keyword_score)).abs() < 1e-6);
    }

    #[test]
    fn keyword_score_is_hits_over_word_count() {
        let words = keyword_set("rust programming language");
        assert_eq!(words.len(), 3);
        let score = keyword_score(&words, "I love rust and also enjoy programming");
        assert!((score - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn keyword_score_empty_query_is_zero() {
        let words = keyword_set("to is a");
        assert_eq!(keyword_score(&words, "anything"), 0.0);
    }

    #[tokio::test]
    async fn reopening_store_reloads_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path(), no_embed()).await.unwrap();
            store.add(MemoryEntry::new("persisted", "entry")).await.unwrap();
        }
        let reopened = MemoryStore::open(dir.path(), no_embed()).await.unwrap();
        assert_eq!(reopened.count().await, 1);
        let all = reopened.list(0).await;
        assert_eq!(all[0].user_message, "persisted");
    }
}
