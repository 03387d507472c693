//! Embedding backends and the fallback chain that drives them.
//!
//! [`Embedder::embed`] never fails. It walks its backends in order and
//! returns the first non-empty vector; if every backend is unavailable it
//! falls back to a deterministic bag-of-tokens vector:
//!
//! 1. **[`OpenAIBackend`]**: hosted embeddings API, only attempted when a
//!    credential is present in the [`SecretStore`].
//! 2. **Local backend**: [`OllamaBackend`] (HTTP to a local service) or
//!    `FastembedBackend` (in-process, behind the
//!    `local-embeddings-fastembed` feature). Skipped entirely when the
//!    configured environment is `"constrained"`.
//! 3. **[`fallback_embedding`]**: term-frequency vector over the text's own
//!    vocabulary, sorted lexicographically, L2-normalized.
//!
//! Vectors from different backends may differ in length. Similarity is
//! computed over the shared prefix (see [`cosine_similarity`]).
//!
//! # Retry Strategy
//!
//! The OpenAI backend retries transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::chunk::tokenize;
use crate::config::{EmbeddingConfig, LocalEmbeddingConfig, RemoteEmbeddingConfig};
use crate::secrets::{SecretStore, OPENAI_KEYS};

/// One link in the embedding fallback chain.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Short identifier used in logs (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Embed a single text. Any error marks the backend as unavailable
    /// for this call.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Ordered fallback chain over [`EmbeddingBackend`]s.
pub struct Embedder {
    backends: Vec<Box<dyn EmbeddingBackend>>,
}

impl Embedder {
    /// Build the chain the configuration asks for.
    ///
    /// The chain is fixed for the embedder's lifetime.
    pub fn from_config(config: &EmbeddingConfig, secrets: Arc<dyn SecretStore>) -> Self {
        let mut backends: Vec<Box<dyn EmbeddingBackend>> = Vec::new();

        if config.remote.provider == "openai" {
            match OpenAIBackend::new(&config.remote, secrets) {
                Ok(b) => backends.push(Box::new(b)),
                Err(e) => warn!("Remote embedding backend unavailable: {}", e),
            }
        }

        if config.is_constrained() {
            debug!("Constrained environment: skipping local embedding backends");
        } else {
            match config.local.provider.as_str() {
                "ollama" => match OllamaBackend::new(&config.local) {
                    Ok(b) => backends.push(Box::new(b)),
                    Err(e) => warn!("Ollama embedding backend unavailable: {}", e),
                },
                #[cfg(feature = "local-embeddings-fastembed")]
                "fastembed" => backends.push(Box::new(FastembedBackend::new(&config.local))),
                #[cfg(not(feature = "local-embeddings-fastembed"))]
                "fastembed" => warn!(
                    "Local embedding provider 'fastembed' requires --features local-embeddings-fastembed"
                ),
                _ => {}
            }
        }

        Self { backends }
    }

    /// A chain with no backends: every call uses [`fallback_embedding`].
    pub fn fallback_only() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    /// A chain over explicit backends, tried in order.
    pub fn with_backends(backends: Vec<Box<dyn EmbeddingBackend>>) -> Self {
        Self { backends }
    }

    /// Names of the configured backends, in the order they are tried.
    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Embed `text`; always returns a vector.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        for backend in &self.backends {
            match backend.embed(text).await {
                Ok(v) if !v.is_empty() => return v,
                Ok(_) => debug!("Embedding backend {} returned an empty vector", backend.name()),
                Err(e) => debug!("Embedding backend {} unavailable: {:#}", backend.name(), e),
            }
        }
        fallback_embedding(text)
    }
}

// ============ OpenAI Backend ============

/// Hosted embeddings via `POST {url}/embeddings`.
///
/// The credential is looked up per call so a key added at runtime is
/// picked up without rebuilding the chain.
pub struct OpenAIBackend {
    config: RemoteEmbeddingConfig,
    secrets: Arc<dyn SecretStore>,
    client: reqwest::Client,
}

impl OpenAIBackend {
    pub fn new(config: &RemoteEmbeddingConfig, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            secrets,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAIBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let api_key = match self.secrets.first_of(OPENAI_KEYS).await {
            Some(k) => k,
            None => bail!("no OpenAI credential configured"),
        };

        let mut body = serde_json::json!({
            "model": self.config.model,
            "input": [text],
        });
        if let Some(dims) = self.config.dims {
            body["dimensions"] = serde_json::json!(dims);
        }

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.config.url))
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return first_vector(parse_openai_response(&json)?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!(
                            "OpenAI API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

/// Extract `data[].embedding` arrays from an OpenAI embeddings response.
pub fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    data.iter()
        .map(|item| {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
            Ok(embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

// ============ Ollama Backend ============

/// Local embedding service reached over `POST {url}/api/embed`.
pub struct OllamaBackend {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(config: &LocalEmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            url: config.url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url,
                    e
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        first_vector(parse_ollama_response(&json)?)
    }
}

/// Extract the `embeddings` arrays from an Ollama `/api/embed` response.
pub fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            Ok(embedding
                .as_array()
                .ok_or_else(|| {
                    anyhow::anyhow!("Invalid Ollama response: embedding is not an array")
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

fn first_vector(vectors: Vec<Vec<f32>>) -> Result<Vec<f32>> {
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

// ============ Fastembed Backend ============

/// In-process embedding model. Weights are downloaded on first use and
/// the loaded model is kept for the backend's lifetime.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastembedBackend {
    model_name: String,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastembedBackend {
    pub fn new(config: &LocalEmbeddingConfig) -> Self {
        Self {
            model_name: config
                .model
                .clone()
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string()),
            model: Arc::new(std::sync::Mutex::new(None)),
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!("Unknown local embedding model: '{}'", other),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingBackend for FastembedBackend {
    fn name(&self) -> &str {
        "fastembed"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model_name = self.model_name.clone();
        let slot = Arc::clone(&self.model);
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow::anyhow!("fastembed model lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(
                    config_to_fastembed_model(&model_name)?,
                ))
                .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("fastembed model missing"))?;
            let vectors = model
                .embed(vec![text], None)
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))?;
            first_vector(vectors)
        })
        .await?
    }
}

// ============ Deterministic Fallback ============

/// Term-frequency vector over the text's own vocabulary.
///
/// Terms are sorted lexicographically and the counts L2-normalized. Text
/// without any terms yields `[0.0]`.
pub fn fallback_embedding(text: &str) -> Vec<f32> {
    let mut counts: BTreeMap<String, f32> = BTreeMap::new();
    for term in tokenize(text) {
        *counts.entry(term).or_insert(0.0) += 1.0;
    }
    if counts.is_empty() {
        return vec![0.0];
    }
    let mut v: Vec<f32> = counts.into_values().collect();
    l2_normalize(&mut v);
    v
}

/// Scale `v` to unit length in place; zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity over the shared prefix of `a` and `b`.
///
/// Vectors produced by different backends can differ in length; only the
/// first `min(a.len(), b.len())` components are compared. Returns `0.0`
/// when the prefix is empty or either prefix has zero norm.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a[..n].iter().zip(b[..n].iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode bytes produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
