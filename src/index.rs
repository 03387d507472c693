//! The incremental vault index.
//!
//! [`VaultIndex`] owns the chunk store, the binding table (document path →
//! chunk ids) and the embedder, and keeps them consistent as documents are
//! added, changed, removed and renamed. Every mutation is followed by a
//! snapshot save, except [`VaultIndex::reindex_all`] which saves once at
//! the end.
//!
//! Mutations on the same path are serialized through per-path async locks;
//! a rename holds both paths' locks, acquired in sorted order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::chunk::{chunk_document, ChunkOptions};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::models::{Chunk, ChunkCandidate, VaultEvent};
use crate::persist::{self, Snapshot};
use crate::store::{open_store, ChunkStore};
use crate::vault::{normalize_path, Vault};

/// Path → chunk ids, plus the reverse owner map.
#[derive(Debug, Default)]
struct Bindings {
    by_path: HashMap<String, Vec<String>>,
    owner: HashMap<String, String>,
}

impl Bindings {
    /// Replace the ids bound to `path`, returning the previous ones. An
    /// empty id list leaves the path unbound.
    fn bind(&mut self, path: &str, ids: Vec<String>) -> Vec<String> {
        let old = self.unbind(path);
        if ids.is_empty() {
            return old;
        }
        for id in &ids {
            self.owner.insert(id.clone(), path.to_string());
        }
        self.by_path.insert(path.to_string(), ids);
        old
    }

    fn unbind(&mut self, path: &str) -> Vec<String> {
        let old = self.by_path.remove(path).unwrap_or_default();
        for id in &old {
            self.owner.remove(id);
        }
        old
    }

    fn owned_elsewhere(&self, id: &str, path: &str) -> bool {
        self.owner.get(id).is_some_and(|owner| owner != path)
    }

    fn sorted(&self) -> Vec<(String, Vec<String>)> {
        let mut entries: Vec<(String, Vec<String>)> = self
            .by_path
            .iter()
            .map(|(p, ids)| (p.clone(), ids.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

type LockTable = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Held per-path locks. On drop the locks are released and table entries
/// nobody else holds or waits on are evicted.
struct PathGuard<'a> {
    table: &'a LockTable,
    paths: Vec<String>,
    held: Vec<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.held.clear();
        if let Ok(mut locks) = self.table.lock() {
            for path in &self.paths {
                // The table's own clone is the last reference.
                if locks.get(path).is_some_and(|m| Arc::strong_count(m) == 1) {
                    locks.remove(path);
                }
            }
        }
    }
}

/// Counts reported by [`VaultIndex::reindex_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReindexStats {
    pub documents: usize,
    pub chunks: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub backend: String,
    pub documents: usize,
    pub chunks: usize,
    pub embedders: Vec<String>,
}

pub struct VaultIndex {
    vault: Arc<dyn Vault>,
    store: Box<dyn ChunkStore>,
    embedder: Embedder,
    bindings: RwLock<Bindings>,
    options: ChunkOptions,
    snapshot_path: String,
    path_locks: LockTable,
}

impl VaultIndex {
    /// Choose a store backend from config and restore the snapshot.
    pub async fn open(config: &Config, vault: Arc<dyn Vault>, embedder: Embedder) -> Self {
        let store = open_store(&config.retrieval.backend).await;
        let options = ChunkOptions::from(&config.chunking);
        Self::with_store(
            vault,
            store,
            embedder,
            options,
            config.vault.index_path.clone(),
        )
        .await
    }

    /// Build an index over an explicit store and restore the snapshot.
    pub async fn with_store(
        vault: Arc<dyn Vault>,
        store: Box<dyn ChunkStore>,
        embedder: Embedder,
        options: ChunkOptions,
        snapshot_path: String,
    ) -> Self {
        let index = Self {
            vault,
            store,
            embedder,
            bindings: RwLock::new(Bindings::default()),
            options,
            snapshot_path,
            path_locks: Mutex::new(HashMap::new()),
        };

        let snapshot = persist::restore(index.vault.as_ref(), &index.snapshot_path).await;
        if let Err(e) = index.load_snapshot(snapshot).await {
            warn!("Failed to load index snapshot, starting empty: {:#}", e);
        }
        index
    }

    async fn load_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let chunks = snapshot.chunks.len();
        for chunk in snapshot.chunks {
            self.store.insert(chunk).await?;
        }
        let mut bindings = self.bindings.write().await;
        for (path, ids) in snapshot.bindings {
            bindings.bind(&path, ids);
        }
        info!(
            "Restored index snapshot: {} documents, {} chunks",
            bindings.by_path.len(),
            chunks
        );
        Ok(())
    }

    pub fn vault(&self) -> &Arc<dyn Vault> {
        &self.vault
    }

    pub fn snapshot_path(&self) -> &str {
        &self.snapshot_path
    }

    pub fn backend_name(&self) -> &str {
        self.store.backend_name()
    }

    /// Whether `path` names the snapshot itself.
    pub fn is_snapshot_path(&self, path: &str) -> bool {
        normalize_path(path).is_ok_and(|p| p == self.snapshot_path)
    }

    // ============ Locking ============

    async fn lock_paths(&self, paths: &[&str]) -> Result<PathGuard<'_>> {
        let mut sorted: Vec<&str> = paths.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mutexes: Vec<Arc<tokio::sync::Mutex<()>>> = {
            let mut locks = self
                .path_locks
                .lock()
                .map_err(|_| anyhow!("path lock table poisoned"))?;
            sorted
                .iter()
                .map(|p| locks.entry(p.to_string()).or_default().clone())
                .collect()
        };

        let mut guard = PathGuard {
            table: &self.path_locks,
            paths: sorted.iter().map(|p| p.to_string()).collect(),
            held: Vec::with_capacity(mutexes.len()),
        };
        for m in mutexes {
            guard.held.push(m.lock_owned().await);
        }
        Ok(guard)
    }

    // ============ Mutations ============

    /// Read `path` from the vault and (re-)index it. A document that no
    /// longer exists is removed instead. Returns the number of chunks bound.
    pub async fn index_file(&self, path: &str) -> Result<usize> {
        let path = normalize_path(path)?;
        let _guard = self.lock_paths(&[path.as_str()]).await?;

        if !self.vault.exists(&path).await {
            self.remove_unlocked(&path).await?;
            self.save_best_effort().await;
            return Ok(0);
        }
        let text = self.vault.read(&path).await?;
        let count = self.index_unlocked(&path, &text).await?;
        self.save_best_effort().await;
        Ok(count)
    }

    /// Index `text` as the content of `path` without reading the vault.
    pub async fn index_text(&self, path: &str, text: &str) -> Result<usize> {
        let path = normalize_path(path)?;
        let _guard = self.lock_paths(&[path.as_str()]).await?;
        let count = self.index_unlocked(&path, text).await?;
        self.save_best_effort().await;
        Ok(count)
    }

    async fn index_unlocked(&self, path: &str, text: &str) -> Result<usize> {
        if path == self.snapshot_path {
            debug!("Skipping index snapshot {}", path);
            return Ok(0);
        }

        let mut chunks = chunk_document(path, text, &self.options);

        // Embeddings of the document's current chunks, by content hash.
        let previous_ids = self.bindings_for(path).await.unwrap_or_default();
        let mut reusable: HashMap<String, Vec<f32>> = HashMap::new();
        for id in &previous_ids {
            if let Some(old) = self.store.get(id).await? {
                if !old.hash.is_empty() && !old.embedding.is_empty() {
                    reusable.insert(old.hash, old.embedding);
                }
            }
        }

        // Ids derived from this path can only be owned elsewhere through a
        // rename, which also holds this path's lock.
        {
            let bindings = self.bindings.read().await;
            for chunk in chunks.iter_mut() {
                chunk.id = disambiguate(&bindings, &chunk.id, path);
            }
        }
        let new_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();

        let mut reused = 0;
        let mut inserted: Vec<String> = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            match reusable.get(&chunk.hash) {
                Some(vec) => {
                    chunk.embedding = vec.clone();
                    reused += 1;
                }
                None => chunk.embedding = self.embedder.embed(&chunk.content).await,
            }
            let id = chunk.id.clone();
            if let Err(e) = self.store.insert(chunk).await {
                self.discard_inserted(&inserted, &previous_ids).await;
                return Err(e.context(format!("Failed to store chunk {}", id)));
            }
            inserted.push(id);
        }

        self.bindings.write().await.bind(path, new_ids.clone());

        let keep: HashSet<&String> = new_ids.iter().collect();
        for stale in previous_ids.iter().filter(|id| !keep.contains(id)) {
            self.store.remove(stale).await?;
        }

        debug!(
            "Indexed {}: {} chunks ({} embeddings reused)",
            path,
            new_ids.len(),
            reused
        );
        Ok(new_ids.len())
    }

    /// Undo a partial insert, leaving the previous binding's chunks alone.
    async fn discard_inserted(&self, inserted: &[String], previous_ids: &[String]) {
        for id in inserted.iter().filter(|id| !previous_ids.contains(id)) {
            if let Err(e) = self.store.remove(id).await {
                warn!("Failed to discard chunk {}: {:#}", id, e);
            }
        }
    }

    /// Drop every chunk bound to `path`. Returns how many were removed.
    pub async fn remove_file(&self, path: &str) -> Result<usize> {
        let path = normalize_path(path)?;
        let _guard = self.lock_paths(&[path.as_str()]).await?;
        let removed = self.remove_unlocked(&path).await?;
        self.save_best_effort().await;
        Ok(removed)
    }

    async fn remove_unlocked(&self, path: &str) -> Result<usize> {
        let ids = self.bindings.write().await.unbind(path);
        for id in &ids {
            self.store.remove(id).await?;
        }
        if !ids.is_empty() {
            debug!("Removed {} chunks for {}", ids.len(), path);
        }
        Ok(ids.len())
    }

    /// Move the binding of `from` to `to`, keeping chunk ids and updating
    /// each chunk's path. If `from` was never indexed, `to` is indexed from
    /// the vault instead.
    pub async fn rename_file(&self, from: &str, to: &str) -> Result<usize> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        if from == to {
            return Ok(self.bindings_for(&to).await.map_or(0, |ids| ids.len()));
        }
        let _guards = self.lock_paths(&[from.as_str(), to.as_str()]).await?;

        let ids = match self.bindings_for(&from).await {
            Some(ids) => ids,
            None => {
                let count = match self.vault.read(&to).await {
                    Ok(text) => self.index_unlocked(&to, &text).await?,
                    Err(e) => {
                        debug!("Renamed document {} not readable: {:#}", to, e);
                        0
                    }
                };
                self.save_best_effort().await;
                return Ok(count);
            }
        };

        self.remove_unlocked(&to).await?;
        for id in &ids {
            if let Some(mut chunk) = self.store.get(id).await? {
                chunk.file_path = to.clone();
                self.store.insert(chunk).await?;
            }
        }
        {
            let mut bindings = self.bindings.write().await;
            bindings.unbind(&from);
            bindings.bind(&to, ids.clone());
        }
        debug!("Renamed {} -> {} ({} chunks)", from, to, ids.len());

        self.save_best_effort().await;
        Ok(ids.len())
    }

    /// Index every indexable document, dropping bindings for documents that
    /// no longer exist. Saves once at the end.
    pub async fn reindex_all(&self) -> Result<ReindexStats> {
        let paths = self.vault.list().await?;
        let mut stats = ReindexStats::default();

        for path in &paths {
            if path == &self.snapshot_path {
                continue;
            }
            let _guard = self.lock_paths(&[path.as_str()]).await?;
            let result = match self.vault.read(path).await {
                Ok(text) => self.index_unlocked(path, &text).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(n) => {
                    stats.documents += 1;
                    stats.chunks += n;
                }
                Err(e) => {
                    warn!("Failed to index {}: {:#}", path, e);
                    stats.failed += 1;
                }
            }
        }

        let live: HashSet<&String> = paths.iter().collect();
        let stale: Vec<String> = self
            .documents()
            .await
            .into_iter()
            .filter(|p| !live.contains(p))
            .collect();
        for path in &stale {
            let _guard = self.lock_paths(&[path.as_str()]).await?;
            self.remove_unlocked(path).await?;
            stats.removed += 1;
        }

        self.persist().await?;
        info!(
            "Reindexed {} documents ({} chunks, {} removed, {} failed)",
            stats.documents, stats.chunks, stats.removed, stats.failed
        );
        Ok(stats)
    }

    /// Apply a change notification. Failures are logged, never returned.
    pub async fn apply(&self, event: &VaultEvent) {
        let result = match event {
            VaultEvent::Modified(path) => {
                if self.is_snapshot_path(path) || !self.vault.is_indexable(path) {
                    return;
                }
                self.index_file(path).await.map(|_| ())
            }
            VaultEvent::Deleted(path) => self.remove_file(path).await.map(|_| ()),
            VaultEvent::Renamed { from, to } => {
                if self.vault.is_indexable(to) && !self.is_snapshot_path(to) {
                    self.rename_file(from, to).await.map(|_| ())
                } else {
                    self.remove_file(from).await.map(|_| ())
                }
            }
        };
        if let Err(e) = result {
            warn!("Failed to apply {:?}: {:#}", event, e);
        }
    }

    // ============ Persistence ============

    /// Write the snapshot of the current bindings and chunks.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = Snapshot {
            bindings: self.bindings.read().await.sorted(),
            chunks: self.store.all().await?,
        };
        persist::save(self.vault.as_ref(), &self.snapshot_path, &snapshot).await
    }

    async fn save_best_effort(&self) {
        if let Err(e) = self.persist().await {
            warn!("Failed to save index snapshot: {:#}", e);
        }
    }

    // ============ Queries ============

    pub async fn bindings_for(&self, path: &str) -> Option<Vec<String>> {
        self.bindings.read().await.by_path.get(path).cloned()
    }

    /// Indexed document paths, sorted.
    pub async fn documents(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.bindings.read().await.by_path.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub async fn chunk(&self, id: &str) -> Option<Chunk> {
        match self.store.get(id).await {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Failed to load chunk {}: {:#}", id, e);
                None
            }
        }
    }

    pub async fn chunk_count(&self) -> usize {
        match self.store.len().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to count chunks: {:#}", e);
                0
            }
        }
    }

    pub async fn stats(&self) -> IndexStats {
        IndexStats {
            backend: self.backend_name().to_string(),
            documents: self.bindings.read().await.by_path.len(),
            chunks: self.chunk_count().await,
            embedders: self
                .embedder
                .backend_names()
                .into_iter()
                .chain(std::iter::once("fallback"))
                .map(String::from)
                .collect(),
        }
    }

    /// Full-text candidates; backend failures degrade to no results.
    pub async fn keyword_search(&self, query: &str, limit: usize) -> Vec<ChunkCandidate> {
        match self.store.keyword_search(query, limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Keyword search failed: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Embed `query` and rank stored chunks by cosine similarity.
    pub async fn vector_search(&self, query: &str, limit: usize) -> Vec<ChunkCandidate> {
        let query_vec = self.embedder.embed(query).await;
        match self.store.vector_search(&query_vec, limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Vector search failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// Keep `id` unless another document already owns it (a renamed document
/// keeps the ids generated under its old path); otherwise append the
/// smallest free `~n` suffix.
fn disambiguate(bindings: &Bindings, id: &str, path: &str) -> String {
    if !bindings.owned_elsewhere(id, path) {
        return id.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}~{}", id, n);
        if !bindings.owned_elsewhere(&candidate, path) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::vault::FsVault;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Memory store that refuses chunks whose content contains `FAIL`.
    struct RefusingStore(MemoryStore);

    #[async_trait]
    impl ChunkStore for RefusingStore {
        fn backend_name(&self) -> &str {
            "refusing"
        }
        async fn insert(&self, chunk: Chunk) -> Result<()> {
            if chunk.content.contains("FAIL") {
                anyhow::bail!("disk full");
            }
            self.0.insert(chunk).await
        }
        async fn remove(&self, chunk_id: &str) -> Result<()> {
            self.0.remove(chunk_id).await
        }
        async fn get(&self, chunk_id: &str) -> Result<Option<Chunk>> {
            self.0.get(chunk_id).await
        }
        async fn all(&self) -> Result<Vec<Chunk>> {
            self.0.all().await
        }
        async fn len(&self) -> Result<usize> {
            self.0.len().await
        }
        async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
            self.0.keyword_search(query, limit).await
        }
        async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<ChunkCandidate>> {
            self.0.vector_search(query_vec, limit).await
        }
    }

    fn lock_table_len(index: &VaultIndex) -> usize {
        index.path_locks.lock().unwrap().len()
    }

    async fn index_in(tmp: &TempDir) -> VaultIndex {
        let config = Config::minimal(tmp.path());
        let vault: Arc<dyn Vault> = Arc::new(FsVault::new(&config.vault).unwrap());
        VaultIndex::with_store(
            vault,
            Box::new(MemoryStore::new()),
            Embedder::fallback_only(),
            ChunkOptions::default(),
            config.vault.index_path.clone(),
        )
        .await
    }

    #[test]
    fn test_bindings_owner_map() {
        let mut b = Bindings::default();
        b.bind("a.md", vec!["x".to_string()]);
        assert!(b.owned_elsewhere("x", "b.md"));
        assert!(!b.owned_elsewhere("x", "a.md"));
        assert_eq!(b.bind("a.md", vec!["y".to_string()]), vec!["x".to_string()]);
        assert!(!b.owned_elsewhere("x", "b.md"));
    }

    #[test]
    fn test_disambiguate() {
        let mut b = Bindings::default();
        b.bind("b.md", vec!["a.md::Intro-0".to_string()]);
        assert_eq!(disambiguate(&b, "a.md::Intro-0", "a.md"), "a.md::Intro-0~1");
        assert_eq!(disambiguate(&b, "a.md::Intro-0", "b.md"), "a.md::Intro-0");
        assert_eq!(disambiguate(&b, "a.md::Other-0", "a.md"), "a.md::Other-0");
    }

    #[tokio::test]
    async fn test_reindex_replaces_stale_chunks() {
        let tmp = TempDir::new().unwrap();
        let index = index_in(&tmp).await;

        index
            .index_text("a.md", "# One\nfirst\n# Two\nsecond")
            .await
            .unwrap();
        assert_eq!(index.chunk_count().await, 2);

        index.index_text("a.md", "# One\nfirst").await.unwrap();
        assert_eq!(index.chunk_count().await, 1);
        assert_eq!(
            index.bindings_for("a.md").await.unwrap(),
            vec!["a.md::One-0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unchanged_chunk_keeps_embedding() {
        let tmp = TempDir::new().unwrap();
        let index = index_in(&tmp).await;
        index.index_text("a.md", "# One\nalpha beta").await.unwrap();
        let before = index.chunk("a.md::One-0").await.unwrap();
        index.index_text("a.md", "# One\nalpha beta").await.unwrap();
        let after = index.chunk("a.md::One-0").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_new_document_at_renamed_path_gets_fresh_ids() {
        let tmp = TempDir::new().unwrap();
        let index = index_in(&tmp).await;
        index.vault().write("a.md", "# Intro\nold").await.unwrap();
        index.index_file("a.md").await.unwrap();

        index.vault().rename("a.md", "b.md").await.unwrap();
        index.rename_file("a.md", "b.md").await.unwrap();
        index.index_text("a.md", "# Intro\nnew").await.unwrap();

        assert_eq!(
            index.bindings_for("b.md").await.unwrap(),
            vec!["a.md::Intro-0".to_string()]
        );
        assert_eq!(
            index.bindings_for("a.md").await.unwrap(),
            vec!["a.md::Intro-0~1".to_string()]
        );
        assert_eq!(index.chunk("a.md::Intro-0").await.unwrap().content, "old");
        assert_eq!(index.chunk_count().await, 2);
    }

    #[tokio::test]
    async fn test_apply_events() {
        let tmp = TempDir::new().unwrap();
        let index = index_in(&tmp).await;
        let vault = index.vault().clone();

        vault.write("n.md", "# H\nbody").await.unwrap();
        index.apply(&VaultEvent::Modified("n.md".to_string())).await;
        assert_eq!(index.documents().await, vec!["n.md"]);

        vault.write("ignored.txt", "text").await.unwrap();
        index
            .apply(&VaultEvent::Modified("ignored.txt".to_string()))
            .await;
        index
            .apply(&VaultEvent::Modified(".vctx/index.json".to_string()))
            .await;
        assert_eq!(index.documents().await, vec!["n.md"]);

        vault.rename("n.md", "m.md").await.unwrap();
        index
            .apply(&VaultEvent::Renamed {
                from: "n.md".to_string(),
                to: "m.md".to_string(),
            })
            .await;
        assert_eq!(index.documents().await, vec!["m.md"]);

        index.apply(&VaultEvent::Deleted("m.md".to_string())).await;
        assert!(index.documents().await.is_empty());
        assert_eq!(index.chunk_count().await, 0);
    }

    #[tokio::test]
    async fn test_reindex_all_drops_vanished_documents() {
        let tmp = TempDir::new().unwrap();
        let index = index_in(&tmp).await;
        index.vault().write("keep.md", "# K\nkeep").await.unwrap();
        index.index_text("gone.md", "# G\ngone").await.unwrap();

        let stats = index.reindex_all().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(index.documents().await, vec!["keep.md"]);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_on_one_path_settle() {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(index_in(&tmp).await);
        index.vault().write("a.md", "# A\nbody").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    index.index_file("a.md").await.unwrap();
                } else {
                    index.remove_file("a.md").await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        index.index_file("a.md").await.unwrap();

        assert_eq!(index.chunk_count().await, 1);
        assert_eq!(index.documents().await, vec!["a.md"]);
    }

    #[tokio::test]
    async fn test_path_locks_are_evicted_after_use() {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(index_in(&tmp).await);
        index.vault().write("a.md", "# A\nbody").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index.index_file("a.md").await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        index.vault().rename("a.md", "b.md").await.unwrap();
        index.rename_file("a.md", "b.md").await.unwrap();
        index.remove_file("b.md").await.unwrap();
        index.reindex_all().await.unwrap();

        assert_eq!(lock_table_len(&index), 0);
    }

    #[tokio::test]
    async fn test_failed_insert_keeps_previous_binding() {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        let vault: Arc<dyn Vault> = Arc::new(FsVault::new(&config.vault).unwrap());
        let index = VaultIndex::with_store(
            vault,
            Box::new(RefusingStore(MemoryStore::new())),
            Embedder::fallback_only(),
            ChunkOptions::default(),
            config.vault.index_path.clone(),
        )
        .await;

        index.index_text("a.md", "# One\nfirst").await.unwrap();
        let err = index
            .index_text("a.md", "# One\nfirst\n# Two\nFAIL here\n# Three\nlater")
            .await;
        assert!(err.is_err());

        assert_eq!(
            index.bindings_for("a.md").await.unwrap(),
            vec!["a.md::One-0".to_string()]
        );
        assert!(index.chunk("a.md::One-0").await.is_some());
        assert!(index.chunk("a.md::Two-1").await.is_none());
        assert_eq!(index.chunk_count().await, 1);
        assert_eq!(lock_table_len(&index), 0);
    }
}
