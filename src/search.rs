//! Hybrid retrieval: keyword and vector candidates fused into one ranking.
//!
//! Each candidate list is normalized by its own maximum so lexical scores
//! (BM25 or match counts) and cosine similarities land on the same [0, 1]
//! scale, then weighted and summed per chunk id.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::RetrievalConfig;
use crate::index::VaultIndex;
use crate::models::{ChunkCandidate, SearchResult};

#[derive(Clone)]
pub struct Retriever {
    index: Arc<VaultIndex>,
    keyword_weight: f64,
    vector_weight: f64,
}

impl Retriever {
    pub fn new(index: Arc<VaultIndex>, config: &RetrievalConfig) -> Self {
        Self {
            index,
            keyword_weight: config.keyword_weight,
            vector_weight: config.vector_weight,
        }
    }

    pub fn index(&self) -> &Arc<VaultIndex> {
        &self.index
    }

    /// Top `limit` chunks for `query`, best first. Never fails; an empty or
    /// unavailable index yields no results.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        if query.trim().is_empty() || limit == 0 {
            return Vec::new();
        }
        let fetch = limit.saturating_mul(2);

        let keyword = self.index.keyword_search(query, fetch).await;
        let vector = self.index.vector_search(query, fetch).await;
        debug!(
            "Search '{}': {} keyword / {} vector candidates",
            query,
            keyword.len(),
            vector.len()
        );

        let fused = fuse(
            &keyword,
            &vector,
            self.keyword_weight,
            self.vector_weight,
            limit,
        );

        let mut results = Vec::with_capacity(fused.len());
        for (chunk_id, score) in fused {
            if let Some(chunk) = self.index.chunk(&chunk_id).await {
                results.push(SearchResult { chunk, score });
            }
        }
        results
    }
}

/// `vctx search`: print fused results with their citation markers.
pub async fn run_search(retriever: &Retriever, query: &str, limit: usize) -> anyhow::Result<()> {
    let results = retriever.search(query, limit).await;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, r) in results.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, r.score, r.chunk.citation());
        let snippet: String = r.chunk.content.chars().take(240).collect();
        println!("   {}", snippet.replace('\n', " "));
        println!();
    }
    Ok(())
}

// ============ Score fusion ============

/// Divide every score by the list's maximum, clamped to [0, 1].
///
/// An empty list, or one whose maximum is not positive, uses a divisor of 1.
pub fn normalize_by_max(candidates: &[ChunkCandidate]) -> Vec<(&str, f64)> {
    let max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);
    let divisor = if max.is_finite() && max > 0.0 { max } else { 1.0 };

    candidates
        .iter()
        .map(|c| (c.chunk_id.as_str(), (c.raw_score / divisor).clamp(0.0, 1.0)))
        .collect()
}

/// Weighted sum of the two normalized lists, merged by chunk id, sorted
/// descending and truncated to `limit`.
pub fn fuse(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    keyword_weight: f64,
    vector_weight: f64,
    limit: usize,
) -> Vec<(String, f64)> {
    let mut merged: HashMap<&str, f64> = HashMap::new();
    for (id, score) in normalize_by_max(keyword) {
        *merged.entry(id).or_insert(0.0) += keyword_weight * score;
    }
    for (id, score) in normalize_by_max(vector) {
        *merged.entry(id).or_insert(0.0) += vector_weight * score;
    }

    let mut fused: Vec<(String, f64)> = merged
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused.truncate(limit);
    fused
}
