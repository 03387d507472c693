//! TOML configuration parsing and validation.
//!
//! Every section has serde defaults so a nearly empty file (just
//! `[vault] root = "..."`) is a valid configuration. [`load_config`]
//! validates ranges and provider names after parsing.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Snapshot location, relative to `root`.
    #[serde(default = "default_index_path")]
    pub index_path: String,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}
fn default_index_path() -> String {
    ".vctx/index.json".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: usize,
    #[serde(default = "default_heading_depth")]
    pub heading_depth: usize,
    #[serde(default = "default_keywords_per_chunk")]
    pub keywords_per_chunk: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
            max_chunks_per_file: default_max_chunks_per_file(),
            heading_depth: default_heading_depth(),
            keywords_per_chunk: default_keywords_per_chunk(),
        }
    }
}

fn default_target_tokens() -> usize {
    200
}
fn default_overlap_tokens() -> usize {
    40
}
fn default_max_chunks_per_file() -> usize {
    200
}
fn default_heading_depth() -> usize {
    3
}
fn default_keywords_per_chunk() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"full"` tries every backend; `"constrained"` skips local ones.
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub remote: RemoteEmbeddingConfig,
    #[serde(default)]
    pub local: LocalEmbeddingConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            remote: RemoteEmbeddingConfig::default(),
            local: LocalEmbeddingConfig::default(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_constrained(&self) -> bool {
        self.environment == "constrained"
    }
}

fn default_environment() -> String {
    "full".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteEmbeddingConfig {
    #[serde(default = "default_remote_provider")]
    pub provider: String,
    #[serde(default = "default_remote_model")]
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_openai_url")]
    pub url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteEmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_remote_provider(),
            model: default_remote_model(),
            dims: None,
            url: default_openai_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_remote_provider() -> String {
    "openai".to_string()
}
fn default_remote_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalEmbeddingConfig {
    /// `"ollama"`, `"fastembed"`, or `"disabled"`.
    #[serde(default = "default_local_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_local_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LocalEmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_local_provider(),
            model: None,
            url: default_ollama_url(),
            timeout_secs: default_local_timeout_secs(),
        }
    }
}

fn default_local_provider() -> String {
    "disabled".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_local_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// `"auto"` tries the SQLite FTS5 engine first; `"memory"` skips it.
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_weight: default_keyword_weight(),
            vector_weight: default_vector_weight(),
            limit: default_limit(),
            backend: default_backend(),
        }
    }
}

fn default_keyword_weight() -> f64 {
    0.55
}
fn default_vector_weight() -> f64 {
    0.45
}
fn default_limit() -> usize {
    8
}
fn default_backend() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    #[serde(default = "default_sources_limit")]
    pub sources_limit: usize,
    /// Extra persona text prepended to the system prompt.
    #[serde(default)]
    pub persona: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_tool_output_chars: default_max_tool_output_chars(),
            sources_limit: default_sources_limit(),
            persona: None,
        }
    }
}

fn default_max_steps() -> usize {
    4
}
fn default_max_tool_output_chars() -> usize {
    8000
}
fn default_sources_limit() -> usize {
    5
}

/// Task routing plus per-backend settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_tools_backend")]
    pub tools: String,
    #[serde(default = "default_assistant_backend")]
    pub assistant: String,
    #[serde(default = "default_research_backend")]
    pub research: String,
    #[serde(default = "default_openai_backend")]
    pub openai: BackendConfig,
    #[serde(default = "default_anthropic_backend")]
    pub anthropic: BackendConfig,
    #[serde(default = "default_gemini_backend")]
    pub gemini: BackendConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            tools: default_tools_backend(),
            assistant: default_assistant_backend(),
            research: default_research_backend(),
            openai: default_openai_backend(),
            anthropic: default_anthropic_backend(),
            gemini: default_gemini_backend(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub model: String,
    pub base_url: String,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Memoize identical requests in-process.
    #[serde(default)]
    pub response_cache: bool,
    /// Lifetime of a server-side context cache entry; 0 disables it.
    #[serde(default)]
    pub context_cache_ttl_secs: u64,
}

fn default_tools_backend() -> String {
    "openai".to_string()
}
fn default_assistant_backend() -> String {
    "anthropic".to_string()
}
fn default_research_backend() -> String {
    "gemini".to_string()
}
fn default_model_timeout_secs() -> u64 {
    60
}
fn default_max_output_tokens() -> u32 {
    2048
}
fn default_openai_backend() -> BackendConfig {
    BackendConfig {
        model: "gpt-4o-mini".to_string(),
        base_url: "https://api.openai.com/v1".to_string(),
        timeout_secs: default_model_timeout_secs(),
        max_output_tokens: default_max_output_tokens(),
        response_cache: false,
        context_cache_ttl_secs: 0,
    }
}
fn default_anthropic_backend() -> BackendConfig {
    BackendConfig {
        model: "claude-3-5-haiku-latest".to_string(),
        base_url: "https://api.anthropic.com/v1".to_string(),
        timeout_secs: default_model_timeout_secs(),
        max_output_tokens: default_max_output_tokens(),
        response_cache: true,
        context_cache_ttl_secs: 0,
    }
}
fn default_gemini_backend() -> BackendConfig {
    BackendConfig {
        model: "gemini-1.5-flash-002".to_string(),
        base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        timeout_secs: default_model_timeout_secs(),
        max_output_tokens: default_max_output_tokens(),
        response_cache: false,
        context_cache_ttl_secs: 300,
    }
}

const BACKENDS: &[&str] = &["openai", "anthropic", "gemini"];

impl Config {
    /// All-defaults configuration rooted at `root`.
    pub fn minimal(root: impl Into<PathBuf>) -> Self {
        Self {
            vault: VaultConfig {
                root: root.into(),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                index_path: default_index_path(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            agent: AgentConfig::default(),
            models: ModelsConfig::default(),
        }
    }

    /// Check ranges and names; called by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        if self.chunking.target_tokens == 0 {
            bail!("chunking.target_tokens must be > 0");
        }
        if !(1..=6).contains(&self.chunking.heading_depth) {
            bail!("chunking.heading_depth must be in [1, 6]");
        }
        if self.chunking.max_chunks_per_file == 0 {
            bail!("chunking.max_chunks_per_file must be > 0");
        }

        if self.retrieval.keyword_weight < 0.0 || self.retrieval.vector_weight < 0.0 {
            bail!("retrieval weights must be >= 0");
        }
        if self.retrieval.limit == 0 {
            bail!("retrieval.limit must be >= 1");
        }
        match self.retrieval.backend.as_str() {
            "auto" | "memory" => {}
            other => bail!(
                "Unknown retrieval backend: '{}'. Must be auto or memory.",
                other
            ),
        }

        if self.agent.max_steps == 0 {
            bail!("agent.max_steps must be >= 1");
        }

        match self.embedding.environment.as_str() {
            "full" | "constrained" => {}
            other => bail!(
                "Unknown embedding environment: '{}'. Must be full or constrained.",
                other
            ),
        }
        match self.embedding.remote.provider.as_str() {
            "openai" | "disabled" => {}
            other => bail!(
                "Unknown remote embedding provider: '{}'. Must be openai or disabled.",
                other
            ),
        }
        match self.embedding.local.provider.as_str() {
            "ollama" | "fastembed" | "disabled" => {}
            other => bail!(
                "Unknown local embedding provider: '{}'. Must be ollama, fastembed, or disabled.",
                other
            ),
        }

        for (task, backend) in [
            ("tools", &self.models.tools),
            ("assistant", &self.models.assistant),
            ("research", &self.models.research),
        ] {
            if !BACKENDS.contains(&backend.as_str()) {
                bail!(
                    "Unknown backend for models.{}: '{}'. Must be openai, anthropic, or gemini.",
                    task,
                    backend
                );
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
