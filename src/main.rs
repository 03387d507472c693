//! # Vault Context CLI (`vctx`)
//!
//! The `vctx` binary indexes a notes vault, searches it, and answers
//! questions about it with a tool-using model.
//!
//! ## Usage
//!
//! ```bash
//! vctx --config ./config/vctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vctx index` | Rebuild the index from every indexable document |
//! | `vctx search "<query>"` | Hybrid keyword + vector search |
//! | `vctx ask "<question>"` | Answer a question with the agent loop |
//! | `vctx watch` | Keep the index in step with vault changes |
//! | `vctx stats` | Show index statistics |
//!
//! Without a config file, `--vault <dir>` runs with default settings.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use vault_context::app::{self, App};
use vault_context::config::{self, Config};
use vault_context::{search, stats};

/// Vault Context CLI — retrieval-augmented answers over a Markdown vault.
#[derive(Parser)]
#[command(
    name = "vctx",
    about = "Vault Context — hybrid search and a tool-using agent over a Markdown vault",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/vctx.toml`. Ignored when `--vault` is given
    /// and the file does not exist.
    #[arg(long, global = true, default_value = "./config/vctx.toml")]
    config: PathBuf,

    /// Vault directory; overrides `[vault] root` from the config.
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the index from every indexable document.
    ///
    /// Documents that disappeared since the last run are dropped from the
    /// index. Unchanged chunks keep their stored embeddings.
    Index,

    /// Search the index.
    Search {
        /// Search query text.
        query: String,

        /// Maximum number of results (defaults to `[retrieval] limit`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question using retrieval and the tool loop.
    Ask {
        /// The question.
        query: String,
    },

    /// Watch the vault and re-index documents as they change.
    Watch,

    /// Show index statistics.
    Stats,
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vault_context=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(cli: &Cli) -> Result<Config> {
    match (&cli.vault, cli.config.exists()) {
        (Some(root), true) => {
            let mut cfg = config::load_config(&cli.config)?;
            cfg.vault.root = root.clone();
            Ok(cfg)
        }
        (Some(root), false) => Ok(Config::minimal(root.clone())),
        (None, true) => config::load_config(&cli.config),
        (None, false) => bail!(
            "Config file {} not found; pass --config or --vault",
            cli.config.display()
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let cfg = resolve_config(&cli)?;
    let app = App::open(cfg).await?;

    match cli.command {
        Commands::Index => app::run_index(&app).await?,
        Commands::Search { query, limit } => {
            let limit = limit.unwrap_or(app.config.retrieval.limit);
            search::run_search(&app.retriever, &query, limit).await?;
        }
        Commands::Ask { query } => app::run_ask(&app, &query).await?,
        Commands::Watch => app::run_watch(&app).await?,
        Commands::Stats => stats::run_stats(&app).await?,
    }

    Ok(())
}
