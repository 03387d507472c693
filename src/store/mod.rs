//! Chunk storage and search backends.
//!
//! The [`ChunkStore`] trait covers everything the index needs from a
//! backend: keyed insert/remove, enumeration for snapshots, keyword search
//! and brute-force vector search. Two implementations exist:
//!
//! | Backend | Keyword scoring | Module |
//! |---------|-----------------|--------|
//! | SQLite FTS5 (in-memory database) | BM25 | [`sqlite`] |
//! | Plain `HashMap` | substring match count | [`memory`] |
//!
//! [`open_store`] picks one at startup and never revisits the decision.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::{Chunk, ChunkCandidate};

/// Abstract chunk store. Callers never branch on the concrete backend.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Short identifier for logs and `vctx stats`.
    fn backend_name(&self) -> &str;

    /// Insert or overwrite a chunk by id.
    async fn insert(&self, chunk: Chunk) -> Result<()>;

    /// Delete a chunk by id; absent ids are a no-op.
    async fn remove(&self, chunk_id: &str) -> Result<()>;

    async fn get(&self, chunk_id: &str) -> Result<Option<Chunk>>;

    /// Every stored chunk, ordered by id.
    async fn all(&self) -> Result<Vec<Chunk>>;

    async fn len(&self) -> Result<usize>;

    /// Full-text relevance search. Order among equal scores is unspecified.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>>;

    /// Cosine similarity against every stored vector; only positive
    /// similarities are returned.
    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<ChunkCandidate>>;
}

/// Choose the store backend.
///
/// `"auto"` tries the SQLite FTS5 engine and falls back to the in-memory
/// store if it cannot be initialized; `"memory"` goes straight to the
/// fallback.
pub async fn open_store(backend: &str) -> Box<dyn ChunkStore> {
    if backend == "auto" {
        match sqlite::SqliteStore::open_in_memory().await {
            Ok(store) => {
                info!("Using SQLite FTS5 search backend");
                return Box::new(store);
            }
            Err(e) => warn!(
                "SQLite FTS5 backend unavailable, using in-memory search: {:#}",
                e
            ),
        }
    }
    Box::new(memory::MemoryStore::new())
}

/// Sort candidates by score descending and keep the first `limit`.
pub(crate) fn rank_candidates(mut candidates: Vec<ChunkCandidate>, limit: usize) -> Vec<ChunkCandidate> {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(limit);
    candidates
}
