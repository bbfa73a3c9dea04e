//! Hybrid memory store: persists user/assistant turns and ranks them for
//! retrieval by a blend of semantic similarity and keyword overlap.

mod entry;
mod recorder;
mod store;
mod vector;

pub use entry::{MemoryEntry, SearchResult};
pub use recorder::AsyncRecorder;
pub use store::{EmbedFn, MemoryStore};
pub use vector::{FlatVectorCollection, VectorCollection, VectorMatch};
