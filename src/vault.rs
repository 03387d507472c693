//! Document collection access.
//!
//! The index and the built-in tools only talk to the collection through the
//! [`Vault`] trait. [`FsVault`] implements it over a directory tree, with
//! include/exclude globs deciding which files are indexable, and can
//! translate filesystem notifications into [`VaultEvent`]s.
//!
//! Paths crossing this boundary are always vault-relative, `/`-separated,
//! and may not escape the root.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::VaultConfig;
use crate::models::VaultEvent;

#[async_trait]
pub trait Vault: Send + Sync {
    /// Full text of a document.
    async fn read(&self, path: &str) -> Result<String>;

    /// Every indexable document, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    /// Create or replace a document, creating missing parent folders.
    async fn write(&self, path: &str, content: &str) -> Result<()>;

    /// Create a folder and any missing ancestors.
    async fn create_folder(&self, path: &str) -> Result<()>;

    /// Move a document. Fails if the target already exists.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> bool;

    /// Whether a path matches the indexable document filter.
    fn is_indexable(&self, path: &str) -> bool;
}

/// Normalize a vault-relative path.
///
/// Strips `.` segments and leading `/`-less noise, rejecting absolute
/// paths, `..` segments and empty paths.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim().replace('\\', "/");
    if trimmed.starts_with('/') {
        bail!("absolute paths are not allowed: {}", path);
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => {}
            ".." => bail!("path escapes the vault: {}", path),
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        bail!("empty path");
    }
    Ok(parts.join("/"))
}

fn relative_string(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Filesystem-backed vault.
pub struct FsVault {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl FsVault {
    pub fn new(config: &VaultConfig) -> Result<Self> {
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/.obsidian/**".to_string(),
            "**/.trash/**".to_string(),
            ".vctx/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(normalize_path(path)?))
    }

    /// Start watching the vault root. Events for non-indexable paths are
    /// dropped. The watcher stops when the returned handle is dropped.
    ///
    /// Must be called inside a Tokio runtime: rename halves are paired by a
    /// background task before they reach the receiver.
    pub fn watch(&self) -> Result<(RecommendedWatcher, mpsc::Receiver<VaultEvent>)> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let (tx, rx) = mpsc::channel::<VaultEvent>(256);
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let include = self.include.clone();
        let exclude = self.exclude.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!("Vault watcher error: {}", e),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(1)),
        )
        .context("Failed to create vault watcher")?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", self.root.display()))?;
        debug!("Watching vault at {}", self.root.display());

        tokio::spawn(async move {
            let filter = move |p: &str| include.is_match(p) && !exclude.is_match(p);
            let mut translator = EventTranslator::new(root, filter);
            loop {
                let received = match translator.next_deadline() {
                    Some(deadline) => tokio::time::timeout_at(
                        tokio::time::Instant::from_std(deadline),
                        raw_rx.recv(),
                    )
                    .await
                    .ok(),
                    None => Some(raw_rx.recv().await),
                };
                let events = match received {
                    Some(Some(event)) => translator.translate(&event, Instant::now()),
                    // Watcher dropped.
                    Some(None) => break,
                    None => translator.flush_expired(Instant::now()),
                };
                for ev in events {
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok((watcher, rx))
    }
}

/// Map one filesystem notification onto vault events.
///
/// `indexable` receives vault-relative paths. A rename where only one side
/// is indexable degrades to a delete or a modify.
pub fn translate_event(
    root: &Path,
    event: &Event,
    indexable: impl Fn(&str) -> bool,
) -> Vec<VaultEvent> {
    let rel = |p: &PathBuf| -> Option<String> {
        let r = relative_string(p.strip_prefix(root).ok()?);
        (!r.is_empty()).then_some(r)
    };
    let keep = |p: &Option<String>| p.as_deref().map(&indexable).unwrap_or(false);

    match &event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            rename_events(root, &event.paths[0], &event.paths[1], &indexable)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => event
            .paths
            .iter()
            .map(rel)
            .filter(|p| keep(p))
            .flatten()
            .map(VaultEvent::Deleted)
            .collect(),
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .map(rel)
            .filter(|p| keep(p))
            .flatten()
            .map(VaultEvent::Modified)
            .collect(),
        _ => Vec::new(),
    }
}

fn rename_events(
    root: &Path,
    from: &Path,
    to: &Path,
    indexable: impl Fn(&str) -> bool,
) -> Vec<VaultEvent> {
    let rel = |p: &Path| -> Option<String> {
        let r = relative_string(p.strip_prefix(root).ok()?);
        (!r.is_empty()).then_some(r)
    };
    let from = rel(from).filter(|p| indexable(p.as_str()));
    let to = rel(to).filter(|p| indexable(p.as_str()));
    match (from, to) {
        (Some(from), Some(to)) => vec![VaultEvent::Renamed { from, to }],
        (Some(from), None) => vec![VaultEvent::Deleted(from)],
        (None, Some(to)) => vec![VaultEvent::Modified(to)],
        (None, None) => Vec::new(),
    }
}

/// How long the first half of a rename waits for its second half before it
/// is treated as a move out of the vault.
pub const RENAME_GRACE: Duration = Duration::from_millis(500);

/// Stateful wrapper around [`translate_event`] that pairs the separate
/// `From` / `To` notifications of one rename (matched by tracker) into a
/// single [`VaultEvent::Renamed`].
///
/// inotify reports a rename as `From`, `To` and then `Both`, all carrying
/// the same tracker. The pair is emitted at `To` and the trailing `Both` is
/// swallowed. A `From` that never gets its `To` becomes a delete once
/// [`RENAME_GRACE`] has passed.
pub struct EventTranslator<F> {
    root: PathBuf,
    indexable: F,
    pending: HashMap<usize, (PathBuf, Instant)>,
    paired: HashMap<usize, Instant>,
}

impl<F: Fn(&str) -> bool> EventTranslator<F> {
    pub fn new(root: PathBuf, indexable: F) -> Self {
        Self {
            root,
            indexable,
            pending: HashMap::new(),
            paired: HashMap::new(),
        }
    }

    pub fn translate(&mut self, event: &Event, now: Instant) -> Vec<VaultEvent> {
        let mut out = self.flush_expired(now);
        let tracker = event.attrs.tracker();

        match (&event.kind, tracker) {
            (EventKind::Modify(ModifyKind::Name(RenameMode::From)), Some(t))
                if event.paths.len() == 1 =>
            {
                self.pending.insert(t, (event.paths[0].clone(), now));
            }
            (EventKind::Modify(ModifyKind::Name(RenameMode::To)), Some(t))
                if event.paths.len() == 1 && self.pending.contains_key(&t) =>
            {
                if let Some((from, _)) = self.pending.remove(&t) {
                    self.paired.insert(t, now);
                    out.extend(rename_events(&self.root, &from, &event.paths[0], &self.indexable));
                }
            }
            (EventKind::Modify(ModifyKind::Name(RenameMode::Both)), Some(t))
                if self.paired.remove(&t).is_some() => {}
            _ => out.extend(translate_event(&self.root, event, &self.indexable)),
        }
        out
    }

    /// Turn rename halves older than [`RENAME_GRACE`] into deletes.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<VaultEvent> {
        let expired = |at: &Instant| now.saturating_duration_since(*at) >= RENAME_GRACE;
        self.paired.retain(|_, at| !expired(at));

        let mut gone: Vec<(usize, PathBuf)> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| expired(at))
            .map(|(t, (path, _))| (*t, path.clone()))
            .collect();
        gone.sort();

        let mut out = Vec::new();
        for (t, path) in gone {
            self.pending.remove(&t);
            let removed = Event::new(EventKind::Remove(RemoveKind::Any)).add_path(path);
            out.extend(translate_event(&self.root, &removed, &self.indexable));
        }
        out
    }

    /// When the oldest unpaired rename half expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, at)| *at + RENAME_GRACE).min()
    }
}

#[async_trait]
impl Vault for FsVault {
    async fn read(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            bail!("Vault root does not exist: {}", self.root.display());
        }
        let root = self.root.clone();
        let include = self.include.clone();
        let exclude = self.exclude.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut paths = Vec::new();
            for entry in WalkDir::new(&root) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                let rel_str = relative_string(relative);
                if exclude.is_match(&rel_str) || !include.is_match(&rel_str) {
                    continue;
                }
                paths.push(rel_str);
            }
            paths.sort();
            Ok(paths)
        })
        .await?
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let normalized = normalize_path(path)?;
        if let Some((parent, _)) = normalized.rsplit_once('/') {
            self.create_folder(parent).await?;
        }
        tokio::fs::write(self.root.join(&normalized), content)
            .await
            .with_context(|| format!("Failed to write {}", normalized))
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .with_context(|| format!("Failed to create folder {}", path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(anyhow!("No such document: {}", from));
        }
        if tokio::fs::try_exists(&dst).await.unwrap_or(false) {
            bail!("Target already exists: {}", to);
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst)
            .await
            .with_context(|| format!("Failed to rename {} to {}", from, to))
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => tokio::fs::try_exists(full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn is_indexable(&self, path: &str) -> bool {
        match normalize_path(path) {
            Ok(p) => self.include.is_match(&p) && !self.exclude.is_match(&p),
            Err(_) => false,
        }
    }
}
