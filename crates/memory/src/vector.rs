//! Abstraction over the underlying vector store: the collection itself is
//! treated as a black box, only an add/search/remove contract is fixed.
//! The default build uses [`FlatVectorCollection`], a brute-force in-process
//! implementation; a `qdrant`-backed one could implement the same trait
//! without the rest of the crate changing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

/// One stored vector plus the metadata needed to reconstruct a hit without a
/// second lookup.
#[derive(Debug, Clone)]
struct VectorRecord {
    embedding: Vec<f32>,
    content: String,
    metadata: HashMap<String, String>,
}

/// A single similarity hit returned from [`VectorCollection::search`].
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait VectorCollection: Send + Sync {
    /// Insert or overwrite the vector stored under `id`.
    async fn upsert(
        &self,
        id: String,
        embedding: Vec<f32>,
        content: String,
        metadata: HashMap<String, String>,
    ) -> anyhow::Result<()>;

    async fn remove(&self, id: &str) -> anyhow::Result<()>;

    async fn clear(&self) -> anyhow::Result<()>;

    async fn len(&self) -> anyhow::Result<usize>;

    async fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Return up to `top_k` matches ranked by cosine similarity, highest
    /// first.
    async fn search(&self, query: &[f32], top_k: usize) -> anyhow::Result<Vec<VectorMatch>>;
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

/// Brute-force, in-process `VectorCollection`: a vector of records scanned
/// linearly on every search. Fine at the scale a single local agent's memory
/// reaches; a real deployment with a large corpus would swap in a proper
/// vector database behind the same trait.
#[derive(Default)]
pub struct FlatVectorCollection {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl FlatVectorCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorCollection for FlatVectorCollection {
    async fn upsert(
        &self,
        id: String,
        embedding: Vec<f32>,
        content: String,
        metadata: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        let mut records = self.records.write().expect("vector collection lock poisoned");
        records.insert(
            id,
            VectorRecord {
                embedding,
                content,
                metadata,
            },
        );
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        let mut records = self.records.write().expect("vector collection lock poisoned");
        records.remove(id);
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let mut records = self.records.write().expect("vector collection lock poisoned");
        records.clear();
        Ok(())
    }

    async fn len(&self) -> anyhow::Result<usize> {
        let records = self.records.read().expect("vector collection lock poisoned");
        Ok(records.len())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> anyhow::Result<Vec<VectorMatch>> {
        let records = self.records.read().expect("vector collection lock poisoned");
        let mut scored: Vec<VectorMatch> = records
            .iter()
            .map(|(id, record)| VectorMatch {
                id: id.clone(),
                score: cosine_similarity(query, &record.embedding),
                content: record.content.clone(),
                metadata: record.metadata.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_search_finds_closest_vector() {
        let collection = FlatVectorCollection::new();
        collection
            .upsert("a".into(), vec![1.0, 0.0], "vector a".into(), HashMap::new())
            .await
            .unwrap();
        collection
            .upsert("b".into(), vec![0.0, 1.0], "vector b".into(), HashMap::new())
            .await
            .unwrap();

        let results = collection.search(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_on_empty_collection_returns_empty() {
        let collection = FlatVectorCollection::new();
        let results = collection.search(&[1.0, 0.0], 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn remove_and_clear_update_len() {
        let collection = FlatVectorCollection::new();
        collection
            .upsert("a".into(), vec![1.0], "a".into(), HashMap::new())
            .await
            .unwrap();
        collection
            .upsert("b".into(), vec![1.0], "b".into(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(collection.len().await.unwrap(), 2);

        collection.remove("a").await.unwrap();
        assert_eq!(collection.len().await.unwrap(), 1);

        collection.clear().await.unwrap();
        assert!(collection.is_empty().await.unwrap());
    }

    #[test]
    fn cosine_similarity_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
