//! Index, persistence and retrieval against a real vault directory.

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};

use tempfile::TempDir;

use vault_context::config::Config;
use vault_context::embedding::Embedder;
use vault_context::index::VaultIndex;
use vault_context::models::VaultEvent;
use vault_context::search::Retriever;
use vault_context::secrets::StaticSecrets;
use vault_context::vault::{EventTranslator, FsVault, Vault};

const SCENARIO: &str = "# Intro\nHello world.\n# Details\nMore text here.";

fn config(tmp: &TempDir, backend: &str) -> Config {
    let mut cfg = Config::minimal(tmp.path());
    cfg.retrieval.backend = backend.to_string();
    cfg
}

async fn open(cfg: &Config) -> Arc<VaultIndex> {
    let vault: Arc<dyn Vault> = Arc::new(FsVault::new(&cfg.vault).unwrap());
    let embedder = Embedder::from_config(&cfg.embedding, Arc::new(StaticSecrets::new()));
    Arc::new(VaultIndex::open(cfg, vault, embedder).await)
}

fn write(tmp: &TempDir, rel: &str, text: &str) {
    let path = tmp.path().join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

#[tokio::test]
async fn test_two_section_document_yields_two_bound_chunks() {
    for backend in ["memory", "auto"] {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "notes/a.md", SCENARIO);
        let index = open(&config(&tmp, backend)).await;

        assert_eq!(index.index_file("notes/a.md").await.unwrap(), 2);

        let ids = index.bindings_for("notes/a.md").await.unwrap();
        assert_eq!(ids, vec!["notes/a.md::Intro-0", "notes/a.md::Details-1"]);

        let intro = index.chunk(&ids[0]).await.unwrap();
        let details = index.chunk(&ids[1]).await.unwrap();
        assert_eq!(intro.block_id, "Intro");
        assert_eq!(intro.content, "Hello world.");
        assert_eq!(details.block_id, "Details");
        assert_eq!(details.content, "More text here.");
        assert!(!intro.embedding.is_empty());
    }
}

#[tokio::test]
async fn test_search_on_empty_index_is_empty() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(&tmp, "auto");
    let index = open(&cfg).await;

    assert!(index.keyword_search("anything", 10).await.is_empty());
    assert!(index.vector_search("anything", 10).await.is_empty());
    let retriever = Retriever::new(index, &cfg.retrieval);
    assert!(retriever.search("anything", 5).await.is_empty());
}

#[tokio::test]
async fn test_search_finds_relevant_section() {
    for backend in ["memory", "auto"] {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "rust.md", "# Cargo\nCargo builds crates and manages dependencies.");
        write(&tmp, "garden.md", "# Tomatoes\nWater the tomatoes every morning.");
        let cfg = config(&tmp, backend);
        let index = open(&cfg).await;
        index.reindex_all().await.unwrap();

        let retriever = Retriever::new(index, &cfg.retrieval);
        let results = retriever.search("tomatoes", 5).await;
        assert!(!results.is_empty(), "backend {}", backend);
        assert_eq!(results[0].chunk.file_path, "garden.md");
        for r in &results {
            assert!(r.score >= 0.0 && r.score <= 1.0 + 1e-9);
        }
    }
}

#[tokio::test]
async fn test_rename_moves_binding_and_keeps_ids() {
    let tmp = TempDir::new().unwrap();
    write(&tmp, "a.md", SCENARIO);
    let index = open(&config(&tmp, "memory")).await;
    index.index_file("a.md").await.unwrap();
    let ids = index.bindings_for("a.md").await.unwrap();

    index.vault().rename("a.md", "archive/b.md").await.unwrap();
    index
        .apply(&VaultEvent::Renamed {
            from: "a.md".to_string(),
            to: "archive/b.md".to_string(),
        })
        .await;

    assert!(index.bindings_for("a.md").await.is_none());
    assert_eq!(index.bindings_for("archive/b.md").await.unwrap(), ids);
    for id in &ids {
        assert_eq!(index.chunk(id).await.unwrap().file_path, "archive/b.md");
    }
}

#[tokio::test]
async fn test_remove_leaves_no_chunks_for_path() {
    let tmp = TempDir::new().unwrap();
    write(&tmp, "a.md", SCENARIO);
    write(&tmp, "b.md", "# Other\nkept");
    let index = open(&config(&tmp, "auto")).await;
    index.reindex_all().await.unwrap();

    index.remove_file("a.md").await.unwrap();

    assert!(index.bindings_for("a.md").await.is_none());
    assert_eq!(index.chunk_count().await, 1);
    assert!(index.keyword_search("hello", 10).await.is_empty());
}

#[tokio::test]
async fn test_snapshot_round_trip() {
    let tmp = TempDir::new().unwrap();
    write(&tmp, "a.md", SCENARIO);
    write(&tmp, "sub/b.md", "No headings here, just a paragraph.");
    let cfg = config(&tmp, "memory");

    let (bindings, chunks) = {
        let index = open(&cfg).await;
        index.reindex_all().await.unwrap();
        let mut chunks = Vec::new();
        let mut bindings = Vec::new();
        for path in index.documents().await {
            let ids = index.bindings_for(&path).await.unwrap();
            for id in &ids {
                chunks.push(index.chunk(id).await.unwrap());
            }
            bindings.push((path, ids));
        }
        (bindings, chunks)
    };
    assert!(tmp.path().join(".vctx/index.json").exists());

    let restored = open(&cfg).await;
    for (path, ids) in &bindings {
        assert_eq!(restored.bindings_for(path).await.as_ref(), Some(ids));
    }
    for chunk in &chunks {
        assert_eq!(restored.chunk(&chunk.id).await.as_ref(), Some(chunk));
    }
    assert_eq!(restored.chunk_count().await, chunks.len());
    assert_eq!(
        restored.bindings_for("sub/b.md").await.unwrap(),
        vec!["sub/b.md::Document-0"]
    );
}

#[tokio::test]
async fn test_corrupt_snapshot_recovers_by_reindex() {
    let tmp = TempDir::new().unwrap();
    write(&tmp, "a.md", SCENARIO);
    write(&tmp, ".vctx/index.json", "{\"bindings\": [oops");
    let index = open(&config(&tmp, "memory")).await;

    assert!(index.documents().await.is_empty());
    index.reindex_all().await.unwrap();
    assert_eq!(index.documents().await, vec!["a.md"]);
}

#[tokio::test]
async fn test_reindex_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    write(&tmp, "a.md", SCENARIO);
    let index = open(&config(&tmp, "memory")).await;

    index.reindex_all().await.unwrap();
    let first = index.chunk("a.md::Intro-0").await.unwrap();
    index.reindex_all().await.unwrap();
    assert_eq!(index.chunk("a.md::Intro-0").await.unwrap(), first);
    assert_eq!(index.chunk_count().await, 2);
}

#[tokio::test]
async fn test_watcher_rename_sequence_keeps_ids() {
    let tmp = TempDir::new().unwrap();
    write(&tmp, "a.md", SCENARIO);
    let index = open(&config(&tmp, "memory")).await;
    index.index_file("a.md").await.unwrap();
    let ids = index.bindings_for("a.md").await.unwrap();
    let intro = index.chunk(&ids[0]).await.unwrap();

    fs::rename(tmp.path().join("a.md"), tmp.path().join("b.md")).unwrap();

    // inotify reports one rename as From, To, Both sharing a tracker.
    let name = |mode: RenameMode, paths: &[&str]| {
        let mut event =
            Event::new(EventKind::Modify(ModifyKind::Name(mode))).set_tracker(42);
        for p in paths {
            event = event.add_path(tmp.path().join(p));
        }
        event
    };
    let raw = [
        name(RenameMode::From, &["a.md"]),
        name(RenameMode::To, &["b.md"]),
        name(RenameMode::Both, &["a.md", "b.md"]),
    ];

    let vault = index.vault().clone();
    let mut translator =
        EventTranslator::new(tmp.path().to_path_buf(), move |p: &str| vault.is_indexable(p));
    let now = Instant::now();
    let mut events = Vec::new();
    for event in &raw {
        events.extend(translator.translate(event, now));
    }
    assert_eq!(
        events,
        vec![VaultEvent::Renamed {
            from: "a.md".to_string(),
            to: "b.md".to_string()
        }]
    );

    for event in &events {
        index.apply(event).await;
    }
    assert!(index.bindings_for("a.md").await.is_none());
    assert_eq!(index.bindings_for("b.md").await.unwrap(), ids);
    let moved = index.chunk(&ids[0]).await.unwrap();
    assert_eq!(moved.file_path, "b.md");
    assert_eq!(moved.embedding, intro.embedding);
    assert_eq!(index.chunk_count().await, 2);
}
