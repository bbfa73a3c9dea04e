//! Bounded background task pool for fire-and-forget memory writes.
//!
//! Recording a turn must be dispatched asynchronously and must not block
//! the next user turn; failures are logged only. A bounded task pool is
//! preferred over spawning a raw detached task per turn, so test harnesses
//! have something to await instead of racing the write.
//!
//! The actual call site (the REPL/TUI layer that decides "agent loop
//! returned, now record the turn") is out of scope here; this type is the
//! seam it would call through.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::entry::MemoryEntry;
use crate::store::MemoryStore;

const DEFAULT_MAX_CONCURRENT_WRITES: usize = 4;

/// Wraps a [`MemoryStore`] so callers can fire off `add` calls without
/// awaiting them, while bounding how many run concurrently and giving test
/// harnesses a way to wait for all outstanding writes to land.
pub struct AsyncRecorder {
    store: Arc<MemoryStore>,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl AsyncRecorder {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self::with_concurrency(store, DEFAULT_MAX_CONCURRENT_WRITES)
    }

    pub fn with_concurrency(store: Arc<MemoryStore>, max_concurrent: usize) -> Self {
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawns the write and returns immediately. A failed write is logged
    /// only — it must never surface to the caller or block the next turn.
    pub async fn spawn_add(&self, entry: MemoryEntry) {
        let store = self.store.clone();
        let semaphore = self.semaphore.clone();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            if let Err(err) = store.add(entry).await {
                tracing::warn!(?err, "background memory write failed");
            }
        });
    }

    /// Waits for every write spawned so far to complete. Test-only
    /// convenience so assertions can run after quiescence instead of racing
    /// the background task.
    pub async fn await_quiescence(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_embed() -> crate::store::EmbedFn {
        Arc::new(|_text| Box::pin(async { Ok(None) }))
    }

    #[tokio::test]
    async fn spawn_add_lands_after_quiescence() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::open(dir.path(), no_embed()).await.unwrap());
        let recorder = AsyncRecorder::new(store.clone());

        recorder.spawn_add(MemoryEntry::new("hi", "hello")).await;
        recorder.await_quiescence().await;
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_writes_are_bounded_but_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::open(dir.path(), no_embed()).await.unwrap());
        let recorder = AsyncRecorder::with_concurrency(store.clone(), 2);

        for i in 0..10 {
            recorder
                .spawn_add(MemoryEntry::new(format!("msg {i}"), "reply"))
                .await;
        }
        recorder.await_quiescence().await;
        assert_eq!(store.count().await, 10);
    }

    #[tokio::test]
    async fn await_quiescence_is_idempotent_on_empty_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::open(dir.path(), no_embed()).await.unwrap());
        let recorder = AsyncRecorder::new(store);
        recorder.await_quiescence().await;
        recorder.await_quiescence().await;
    }
}
