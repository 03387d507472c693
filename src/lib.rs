//! # Vault Context
//!
//! Retrieval-augmented question answering over a folder of Markdown notes.
//!
//! Vault Context incrementally indexes documents into heading-aware,
//! overlapping chunks, serves hybrid keyword + vector search over them, and
//! drives a bounded tool-use loop in which a language model can consult and
//! edit the vault before producing a cited answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Vault   │──▶│ Chunk+Embed  │──▶│  ChunkStore   │
//! │ (FS+fs   │   │  (fallback   │   │ FTS5 / memory │
//! │  events) │   │   chain)     │   └──────┬────────┘
//! └──────────┘   └──────────────┘          │
//!                                   ┌──────▼──────┐     ┌─────────────┐
//!                                   │  Retriever  │◀───▶│ Orchestrator│──▶ ModelRouter
//!                                   │  (fusion)   │     │ (tool loop) │──▶ ToolRegistry
//!                                   └─────────────┘     └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vctx --config ./config/vctx.toml index
//! vctx --config ./config/vctx.toml search "deployment checklist"
//! vctx --config ./config/vctx.toml ask "what did we decide about backups?"
//! vctx --config ./config/vctx.toml watch
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Chunks, search candidates, vault events |
//! | [`chunk`] | Heading-aware sliding-window chunking |
//! | [`embedding`] | Embedding backends and the fallback chain |
//! | [`store`] | Chunk stores (SQLite FTS5, in-memory) |
//! | [`vault`] | Document collection access and change events |
//! | [`persist`] | Index snapshot save/restore |
//! | [`index`] | Incremental index with per-path locking |
//! | [`search`] | Score fusion |
//! | [`secrets`] | Credential lookup |
//! | [`llm`] | Model backends, caches and task routing |
//! | [`tools`] | Agent tools and registry |
//! | [`agent`] | The bounded tool-use loop |
//! | [`app`] | Command wiring |
//! | [`stats`] | Index statistics |

pub mod agent;
pub mod app;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod index;
pub mod llm;
pub mod models;
pub mod persist;
pub mod search;
pub mod secrets;
pub mod stats;
pub mod store;
pub mod tools;
pub mod vault;
