//! Core data models used throughout the vault index.
//!
//! These types represent the chunks, bindings, and search results that flow
//! through the indexing and retrieval pipeline. [`Chunk`] doubles as the
//! serialized chunk record inside the index snapshot, so its field names
//! are part of the on-disk format.

use serde::{Deserialize, Serialize};

/// A contiguous, independently retrievable slice of a document.
///
/// Identifiers are derived from the document path, the section label and
/// a per-file ordinal, so re-indexing the same content yields the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Stable identifier, `{file_path}::{label}-{ordinal}`.
    pub id: String,
    /// Raw chunk text.
    pub content: String,
    /// Vault-relative path of the owning document.
    pub file_path: String,
    /// Citation label (the section heading, or a generic label).
    pub block_id: String,
    /// Embedding vector; may be empty until embedded.
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Most frequent content terms, indexed alongside the text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// SHA-256 of `content`, used to reuse embeddings across re-indexes.
    #[serde(default)]
    pub hash: String,
}

impl Chunk {
    /// Wikilink-style citation marker for this chunk, e.g. `[[notes/a.md#Intro]]`.
    pub fn citation(&self) -> String {
        format!("[[{}#{}]]", self.file_path, self.block_id)
    }
}

/// A candidate chunk returned from keyword or vector search, before fusion.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    /// Raw score from the search backend (BM25, match count, or cosine).
    pub raw_score: f64,
}

/// A fused search result.
///
/// `score` is only comparable against other results of the same call.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f64,
}

/// A change notification from the document collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    /// A document was created or its content changed.
    Modified(String),
    /// A document was deleted.
    Deleted(String),
    /// A document moved; its chunk identifiers are preserved.
    Renamed { from: String, to: String },
}
