//! Wiring for the `vctx` commands.
//!
//! [`App::open`] builds the collaborators once from a [`Config`]: the
//! filesystem vault, the embedder chain, the index (restored from its
//! snapshot) and the retriever. The command runners below take an `App`
//! and print to stdout; diagnostics go through `tracing`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::agent::Orchestrator;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::index::VaultIndex;
use crate::llm::ModelRouter;
use crate::search::Retriever;
use crate::secrets::{EnvSecrets, SecretStore};
use crate::tools::ToolRegistry;
use crate::vault::{FsVault, Vault};

pub struct App {
    pub config: Config,
    pub vault: Arc<FsVault>,
    pub index: Arc<VaultIndex>,
    pub retriever: Retriever,
    secrets: Arc<dyn SecretStore>,
}

impl App {
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with_secrets(config, Arc::new(EnvSecrets)).await
    }

    pub async fn open_with_secrets(config: Config, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        let vault = Arc::new(FsVault::new(&config.vault)?);
        let embedder = Embedder::from_config(&config.embedding, secrets.clone());
        let dyn_vault: Arc<dyn Vault> = vault.clone();
        let index = Arc::new(VaultIndex::open(&config, dyn_vault, embedder).await);
        let retriever = Retriever::new(index.clone(), &config.retrieval);

        Ok(Self {
            config,
            vault,
            index,
            retriever,
            secrets,
        })
    }

    /// An orchestrator over the HTTP model backends and the built-in tools.
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let router = ModelRouter::from_config(&self.config.models, self.secrets.clone())?;
        Ok(Orchestrator::new(
            self.retriever.clone(),
            Arc::new(router),
            Arc::new(ToolRegistry::with_builtins()),
            self.config.agent.clone(),
            self.config.retrieval.limit,
        ))
    }
}

/// `vctx index`: rebuild the index from every indexable document.
pub async fn run_index(app: &App) -> Result<()> {
    let stats = app.index.reindex_all().await?;
    println!(
        "Indexed {} documents ({} chunks).",
        stats.documents, stats.chunks
    );
    if stats.removed > 0 {
        println!("Removed {} documents that no longer exist.", stats.removed);
    }
    if stats.failed > 0 {
        println!("{} documents failed to index; see the log.", stats.failed);
    }
    Ok(())
}

/// `vctx ask`: one orchestrator run.
pub async fn run_ask(app: &App, query: &str) -> Result<()> {
    let orchestrator = app.orchestrator()?;
    let report = orchestrator.run_report(query).await;
    info!(
        "Answered after {} tool rounds ({} tool calls)",
        report.tool_rounds, report.tool_calls
    );
    println!("{}", report.answer);
    Ok(())
}

/// `vctx watch`: keep the index in step with the vault until Ctrl-C.
pub async fn run_watch(app: &App) -> Result<()> {
    if app.index.documents().await.is_empty() {
        info!("Index is empty; running a full reindex first");
        app.index.reindex_all().await?;
    }

    let (_watcher, mut events) = app.vault.watch()?;
    println!(
        "Watching {} (Ctrl-C to stop)...",
        app.vault.root().display()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    info!("{:?}", event);
                    app.index.apply(&event).await;
                }
                None => {
                    warn!("Vault watcher stopped");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping.");
                break;
            }
        }
    }

    app.index.persist().await
}
