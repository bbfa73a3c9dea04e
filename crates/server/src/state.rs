use std::sync::Arc;

use orc_inference::InferenceClient;
use orc_memory::MemoryStore;

/// Shared state handed to every route. Cloning is cheap — everything
/// behind it is already reference-counted or a plain client handle.
#[derive(Clone)]
pub struct AppState {
    pub inference: InferenceClient,
    pub embedding: Option<InferenceClient>,
    pub embedding_model: String,
    pub memory: Arc<MemoryStore>,
}

impl AppState {
    pub fn new(
        inference: InferenceClient,
        embedding: Option<InferenceClient>,
        embedding_model: impl Into<String>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            inference,
            embedding,
            embedding_model: embedding_model.into(),
            memory,
        }
    }

    /// The client that should actually serve embedding requests: the
    /// dedicated embedding subprocess if one is configured, otherwise the
    /// main inference subprocess (it may have been started with
    /// `--embeddings` itself).
    pub fn embedding_client(&self) -> &InferenceClient {
        self.embedding.as_ref().unwrap_or(&self.inference)
    }
}
