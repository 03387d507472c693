//! SQLite FTS5 [`ChunkStore`] over an in-memory database.
//!
//! Chunks live in a plain table (vectors as little-endian `f32` BLOBs) and
//! are mirrored into an FTS5 virtual table over `content` and `keywords`.
//! Keyword search ranks with FTS5's built-in `bm25()`; vector search is a
//! full scan like the in-memory store.
//!
//! The pool holds exactly one connection that never expires: each SQLite
//! connection to `:memory:` sees its own private database.

use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, ChunkCandidate};

use super::memory::query_terms;
use super::{rank_candidates, ChunkStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a private in-memory database and create the schema.
    ///
    /// Fails if the SQLite build lacks FTS5.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE chunks (
                id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL,
                block_id TEXT NOT NULL,
                content TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                hash TEXT NOT NULL DEFAULT '',
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                content,
                keywords
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

/// Build an FTS5 query that matches any of the query's terms.
///
/// Every term is double-quoted so user punctuation can never be parsed as
/// FTS5 syntax. Returns `None` when the query has no terms.
pub fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let keywords: String = row.get("keywords");
    let blob: Vec<u8> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        content: row.get("content"),
        file_path: row.get("file_path"),
        block_id: row.get("block_id"),
        embedding: blob_to_vec(&blob),
        keywords: serde_json::from_str(&keywords).unwrap_or_default(),
        hash: row.get("hash"),
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    fn backend_name(&self) -> &str {
        "sqlite-fts5"
    }

    async fn insert(&self, chunk: Chunk) -> Result<()> {
        let keywords_json = serde_json::to_string(&chunk.keywords)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO chunks (id, file_path, block_id, content, keywords, hash, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_path = excluded.file_path,
                block_id = excluded.block_id,
                content = excluded.content,
                keywords = excluded.keywords,
                hash = excluded.hash,
                embedding = excluded.embedding
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.file_path)
        .bind(&chunk.block_id)
        .bind(&chunk.content)
        .bind(&keywords_json)
        .bind(&chunk.hash)
        .bind(vec_to_blob(&chunk.embedding))
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, content, keywords) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.content)
            .bind(chunk.keywords.join(" "))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, chunk_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_chunk))
    }

    async fn all(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
        let fts = match fts_query(query) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, bm25(chunks_fts) AS rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // bm25() is lower-is-better; flip it so larger means more relevant.
        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    raw_score: -rank,
                }
            })
            .collect())
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query("SELECT id, embedding FROM chunks")
            .fetch_all(&self.pool)
            .await?;

        let candidates = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let sim = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (sim > 0.0).then(|| ChunkCandidate {
                    chunk_id: row.get("id"),
                    raw_score: sim,
                })
            })
            .collect();

        Ok(rank_candidates(candidates, limit))
    }
}
