//! In-memory [`ChunkStore`] used when the structured engine is unavailable.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Keyword relevance is the
//! number of times the query's terms occur as substrings of the lowercased
//! chunk text; vector search is brute-force cosine similarity.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::chunk::tokenize;
use crate::embedding::cosine_similarity;
use crate::models::{Chunk, ChunkCandidate};

use super::{rank_candidates, ChunkStore};

/// In-memory chunk store.
pub struct MemoryStore {
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Chunk>>> {
        self.chunks.read().map_err(|_| anyhow!("chunk store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Chunk>>> {
        self.chunks.write().map_err(|_| anyhow!("chunk store lock poisoned"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Distinct query terms, in first-seen order.
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for t in tokenize(query) {
        if !terms.contains(&t) {
            terms.push(t);
        }
    }
    terms
}

#[async_trait]
impl ChunkStore for MemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, chunk: Chunk) -> Result<()> {
        self.write()?.insert(chunk.id.clone(), chunk);
        Ok(())
    }

    async fn remove(&self, chunk_id: &str) -> Result<()> {
        self.write()?.remove(chunk_id);
        Ok(())
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        Ok(self.read()?.get(chunk_id).cloned())
    }

    async fn all(&self) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = self.read()?.values().cloned().collect();
        chunks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chunks)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.read()?;
        let candidates = chunks
            .values()
            .filter_map(|chunk| {
                let text = chunk.content.to_lowercase();
                let hits: usize = terms.iter().map(|t| text.matches(t.as_str()).count()).sum();
                (hits > 0).then(|| ChunkCandidate {
                    chunk_id: chunk.id.clone(),
                    raw_score: hits as f64,
                })
            })
            .collect();
        Ok(rank_candidates(candidates, limit))
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<ChunkCandidate>> {
        let chunks = self.read()?;
        let candidates = chunks
            .values()
            .filter_map(|chunk| {
                let sim = cosine_similarity(query_vec, &chunk.embedding) as f64;
                (sim > 0.0).then(|| ChunkCandidate {
                    chunk_id: chunk.id.clone(),
                    raw_score: sim,
                })
            })
            .collect();
        Ok(rank_candidates(candidates, limit))
    }
}
