//! Index snapshot persistence.
//!
//! The whole index is one JSON document stored inside the vault:
//!
//! ```json
//! { "bindings": [["notes/a.md", ["notes/a.md::Intro-0"]]],
//!   "chunks":   [{ "id": "...", "content": "...", "filePath": "...", "blockId": "...", "embedding": [...] }] }
//! ```
//!
//! Every save overwrites the previous snapshot. Restoring never fails: a
//! missing or unreadable snapshot yields an empty index and a warning, and
//! the caller recovers with a full reindex.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::Chunk;
use crate::vault::Vault;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// `(path, chunk ids)` pairs, sorted by path.
    pub bindings: Vec<(String, Vec<String>)>,
    /// Every chunk, sorted by id.
    pub chunks: Vec<Chunk>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.chunks.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse index snapshot")
    }

    /// Drop binding entries that point at missing chunks and chunks that
    /// no binding owns. Returns how many entries were dropped.
    pub fn repair(&mut self) -> usize {
        let chunk_ids: HashSet<String> = self.chunks.iter().map(|c| c.id.clone()).collect();
        let mut dropped = 0;

        let mut owned: HashSet<String> = HashSet::new();
        for (_, ids) in self.bindings.iter_mut() {
            let before = ids.len();
            ids.retain(|id| chunk_ids.contains(id) && owned.insert(id.clone()));
            dropped += before - ids.len();
        }
        self.bindings.retain(|(_, ids)| !ids.is_empty());

        let before = self.chunks.len();
        self.chunks.retain(|c| owned.contains(&c.id));
        dropped += before - self.chunks.len();

        dropped
    }
}

/// Overwrite the snapshot at `path`.
pub async fn save(vault: &dyn Vault, path: &str, snapshot: &Snapshot) -> Result<()> {
    let json = snapshot.to_json()?;
    vault
        .write(path, &json)
        .await
        .with_context(|| format!("Failed to write index snapshot {}", path))?;
    debug!(
        "Saved index snapshot: {} documents, {} chunks",
        snapshot.bindings.len(),
        snapshot.chunks.len()
    );
    Ok(())
}

/// Load the snapshot at `path`, or an empty one if it is missing or corrupt.
pub async fn restore(vault: &dyn Vault, path: &str) -> Snapshot {
    if !vault.exists(path).await {
        warn!("No index snapshot at {}; starting with an empty index", path);
        return Snapshot::default();
    }

    let json = match vault.read(path).await {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to read index snapshot, starting empty: {:#}", e);
            return Snapshot::default();
        }
    };

    let mut snapshot = match Snapshot::from_json(&json) {
        Ok(s) => s,
        Err(e) => {
            warn!("Index snapshot is corrupt, starting empty: {:#}", e);
            return Snapshot::default();
        }
    };

    let dropped = snapshot.repair();
    if dropped > 0 {
        warn!("Dropped {} inconsistent entries from index snapshot", dropped);
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::vault::FsVault;
    use tempfile::TempDir;

    fn chunk(id: &str, path: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            content: format!("content of {}", id),
            file_path: path.to_string(),
            block_id: "Intro".to_string(),
            embedding: vec![0.5, 0.5],
            keywords: vec!["content".to_string()],
            hash: "abc".to_string(),
        }
    }

    #[test]
    fn test_json_shape() {
        let snapshot = Snapshot {
            bindings: vec![("a.md".to_string(), vec!["a.md::Intro-0".to_string()])],
            chunks: vec![chunk("a.md::Intro-0", "a.md")],
        };
        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(value["bindings"][0][0], "a.md");
        assert_eq!(value["bindings"][0][1][0], "a.md::Intro-0");
        assert_eq!(value["chunks"][0]["filePath"], "a.md");
        assert_eq!(value["chunks"][0]["blockId"], "Intro");
    }

    #[test]
    fn test_repair_drops_dangling_and_orphans() {
        let mut snapshot = Snapshot {
            bindings: vec![
                (
                    "a.md".to_string(),
                    vec!["a1".to_string(), "missing".to_string()],
                ),
                ("b.md".to_string(), vec!["a1".to_string()]),
            ],
            chunks: vec![chunk("a1", "a.md"), chunk("orphan", "z.md")],
        };
        assert_eq!(snapshot.repair(), 3);
        assert_eq!(
            snapshot.bindings,
            vec![("a.md".to_string(), vec!["a1".to_string()])]
        );
        assert_eq!(snapshot.chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_restore() {
        let tmp = TempDir::new().unwrap();
        let vault = FsVault::new(&Config::minimal(tmp.path()).vault).unwrap();
        let snapshot = Snapshot {
            bindings: vec![("a.md".to_string(), vec!["a1".to_string()])],
            chunks: vec![chunk("a1", "a.md")],
        };
        save(&vault, ".vctx/index.json", &snapshot).await.unwrap();
        assert_eq!(restore(&vault, ".vctx/index.json").await, snapshot);
    }

    #[tokio::test]
    async fn test_restore_missing_or_corrupt_is_empty() {
        let tmp = TempDir::new().unwrap();
        let vault = FsVault::new(&Config::minimal(tmp.path()).vault).unwrap();
        assert!(restore(&vault, ".vctx/index.json").await.is_empty());

        vault.write(".vctx/index.json", "{ not json").await.unwrap();
        assert!(restore(&vault, ".vctx/index.json").await.is_empty());
    }
}
