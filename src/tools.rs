//! Tools the agent can call, and the registry that dispatches them.
//!
//! A [`Tool`] exposes a name, a one-line description and a JSON Schema for
//! its arguments (sent to the model as the tool catalog), and executes
//! against a [`ToolContext`]. Failures never escape the registry:
//! [`ToolRegistry::execute`] turns every [`ToolError`] into a failed
//! [`ToolOutcome`] that the orchestrator feeds back to the model as an
//! ordinary observation.
//!
//! Built-in tools operate on the vault and keep the index in step with
//! their writes:
//!
//! | Tool | Effect |
//! |------|--------|
//! | `search_notes` | hybrid search over the index |
//! | `read_note` | full text of one document |
//! | `write_note` | create or replace a document, then re-index it |
//! | `rename_note` | move a document, preserving its chunk ids |
//! | `list_notes` | indexable documents, optionally under a folder |

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::index::VaultIndex;
use crate::llm::ToolSpec;
use crate::models::VaultEvent;
use crate::search::Retriever;
use crate::vault::normalize_path;

const DEFAULT_SEARCH_LIMIT: usize = 5;
const MAX_SEARCH_LIMIT: usize = 20;

/// Result of one tool call as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn failed(err: &ToolError) -> Self {
        Self {
            success: false,
            output: err.to_string(),
            data: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not allowed: {0}")]
    Disallowed(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0:#}")]
    Failed(#[from] anyhow::Error),
}

/// What a tool can reach while executing.
#[derive(Clone)]
pub struct ToolContext {
    retriever: Retriever,
}

impl ToolContext {
    pub fn new(retriever: Retriever) -> Self {
        Self { retriever }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn index(&self) -> &Arc<VaultIndex> {
        self.retriever.index()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores, e.g. `"read_note"`.
    fn name(&self) -> &str;

    /// One-line description the model uses to decide whether to call it.
    fn description(&self) -> &str;

    /// JSON Schema (`type: "object"`) for the arguments.
    fn parameters_schema(&self) -> Value;

    /// `args` is always a JSON object, possibly empty.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Argument helpers
// ═══════════════════════════════════════════════════════════════════════

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::BadArguments(format!("missing string argument '{}'", key)))
}

/// Validate a vault-relative path and refuse the index snapshot.
fn note_path(raw: &str, ctx: &ToolContext) -> Result<String, ToolError> {
    let path = normalize_path(raw).map_err(|e| ToolError::InvalidPath {
        path: raw.to_string(),
        reason: e.to_string(),
    })?;
    if ctx.index().is_snapshot_path(&path) {
        return Err(ToolError::Disallowed(format!(
            "{} is the index snapshot",
            path
        )));
    }
    Ok(path)
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in tools
// ═══════════════════════════════════════════════════════════════════════

pub struct SearchNotesTool;

#[async_trait]
impl Tool for SearchNotesTool {
    fn name(&self) -> &str {
        "search_notes"
    }

    fn description(&self) -> &str {
        "Search the notes for passages relevant to a query"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "limit": { "type": "integer", "minimum": 1, "maximum": MAX_SEARCH_LIMIT }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let query = str_arg(&args, "query")?;
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| (n as usize).clamp(1, MAX_SEARCH_LIMIT))
            .unwrap_or(DEFAULT_SEARCH_LIMIT);

        let results = ctx.retriever().search(query, limit).await;
        if results.is_empty() {
            return Ok(ToolOutcome::ok("No matching notes.").with_data(json!([])));
        }

        let output = results
            .iter()
            .map(|r| format!("{} (score {:.2})\n{}", r.chunk.citation(), r.score, r.chunk.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let data: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "id": r.chunk.id,
                    "path": r.chunk.file_path,
                    "block": r.chunk.block_id,
                    "score": r.score,
                })
            })
            .collect();
        Ok(ToolOutcome::ok(output).with_data(Value::Array(data)))
    }
}

pub struct ReadNoteTool;

#[async_trait]
impl Tool for ReadNoteTool {
    fn name(&self) -> &str {
        "read_note"
    }

    fn description(&self) -> &str {
        "Read the full text of a note by its vault path"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Vault-relative path, e.g. notes/a.md" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let path = note_path(str_arg(&args, "path")?, ctx)?;
        let vault = ctx.index().vault();
        if !vault.exists(&path).await {
            return Err(ToolError::NotFound(path));
        }
        let text = vault.read(&path).await?;
        Ok(ToolOutcome::ok(text))
    }
}

pub struct WriteNoteTool;

#[async_trait]
impl Tool for WriteNoteTool {
    fn name(&self) -> &str {
        "write_note"
    }

    fn description(&self) -> &str {
        "Create or overwrite a note; missing folders are created"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let path = note_path(str_arg(&args, "path")?, ctx)?;
        let content = str_arg(&args, "content")?;
        let index = ctx.index();

        index.vault().write(&path, content).await?;
        if !index.vault().is_indexable(&path) {
            return Ok(ToolOutcome::ok(format!("Wrote {} (not indexed)", path)));
        }
        let chunks = index.index_file(&path).await?;
        Ok(
            ToolOutcome::ok(format!("Wrote {} ({} chunks indexed)", path, chunks))
                .with_data(json!({ "path": path, "chunks": chunks })),
        )
    }
}

pub struct RenameNoteTool;

#[async_trait]
impl Tool for RenameNoteTool {
    fn name(&self) -> &str {
        "rename_note"
    }

    fn description(&self) -> &str {
        "Move or rename a note"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "from": { "type": "string" },
                "to": { "type": "string" }
            },
            "required": ["from", "to"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let from = note_path(str_arg(&args, "from")?, ctx)?;
        let to = note_path(str_arg(&args, "to")?, ctx)?;
        let index = ctx.index();

        if !index.vault().exists(&from).await {
            return Err(ToolError::NotFound(from));
        }
        if index.vault().exists(&to).await {
            return Err(ToolError::Disallowed(format!("{} already exists", to)));
        }

        index.vault().rename(&from, &to).await?;
        index
            .apply(&VaultEvent::Renamed {
                from: from.clone(),
                to: to.clone(),
            })
            .await;
        Ok(ToolOutcome::ok(format!("Renamed {} to {}", from, to)))
    }
}

pub struct ListNotesTool;

#[async_trait]
impl Tool for ListNotesTool {
    fn name(&self) -> &str {
        "list_notes"
    }

    fn description(&self) -> &str {
        "List notes, optionally only those under a folder"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "folder": { "type": "string" }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let prefix = match args.get("folder").and_then(|v| v.as_str()) {
            Some(f) if !f.trim().is_empty() && f.trim() != "/" => {
                let folder = normalize_path(f).map_err(|e| ToolError::InvalidPath {
                    path: f.to_string(),
                    reason: e.to_string(),
                })?;
                Some(format!("{}/", folder))
            }
            _ => None,
        };

        let notes: Vec<String> = ctx
            .index()
            .vault()
            .list()
            .await?
            .into_iter()
            .filter(|p| prefix.as_deref().map_or(true, |pre| p.starts_with(pre)))
            .collect();

        let output = if notes.is_empty() {
            "No notes.".to_string()
        } else {
            notes.join("\n")
        };
        Ok(ToolOutcome::ok(output).with_data(json!(notes)))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with the vault tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SearchNotesTool));
        registry.register(Box::new(ReadNoteTool));
        registry.register(Box::new(WriteNoteTool));
        registry.register(Box::new(RenameNoteTool));
        registry.register(Box::new(ListNotesTool));
        registry
    }

    /// Register a tool. The first registration of a name wins.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        if self.find(tool.name()).is_some() {
            warn!("Tool '{}' already registered; ignoring duplicate", tool.name());
            return;
        }
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// The catalog sent to tool-capable models.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Run a tool by name. Unknown tools and tool errors become failed
    /// outcomes.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let result = match self.find(name) {
            Some(tool) => tool.execute(args, ctx).await,
            None => Err(ToolError::UnknownTool(name.to_string())),
        };
        match result {
            Ok(outcome) => {
                debug!("Tool {} succeeded", name);
                outcome
            }
            Err(e) => {
                warn!("Tool {} failed: {}", name, e);
                ToolOutcome::failed(&e)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
