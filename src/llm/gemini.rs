//! Gemini `generateContent`, with a server-side context cache.
//!
//! When caching is enabled the retrieved context is uploaded once as a
//! `cachedContents` resource, keyed locally by the SHA-256 of the context
//! text, and referenced by name until its TTL lapses. Requests against a
//! cached context cannot carry `systemInstruction`, so the system prompt
//! travels as the first user turn instead. If the cache cannot be created
//! the context is sent inline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::cache::{digest_bytes, ContextCache};
use super::{
    http_client, post_json, Completion, CompletionRequest, MessageRole, ModelBackend, ModelError,
    ToolCall,
};
use crate::config::BackendConfig;
use crate::secrets::{SecretStore, GEMINI_KEYS};

const PROVIDER: &str = "gemini";

pub struct GeminiChat {
    client: reqwest::Client,
    config: BackendConfig,
    secrets: Arc<dyn SecretStore>,
    contexts: ContextCache,
}

impl GeminiChat {
    pub fn new(config: &BackendConfig, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            config: config.clone(),
            secrets,
            contexts: ContextCache::new(Duration::from_secs(config.context_cache_ttl_secs)),
        })
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Cached context name for `context`, creating the resource on a miss.
    async fn cached_context(&self, api_key: &str, context: &str) -> Option<String> {
        let digest = digest_bytes(context.as_bytes());
        if let Some(name) = self.contexts.get(&digest) {
            debug!("Gemini context cache hit: {}", name);
            return Some(name);
        }

        let body = build_cache_request(&self.config.model, context, self.contexts.ttl());
        let url = format!("{}/cachedContents", self.base());
        match post_json(&self.client, PROVIDER, &url, &[("x-goog-api-key", api_key)], &body).await
        {
            Ok(json) => {
                let name = json.get("name").and_then(|n| n.as_str())?.to_string();
                self.contexts.put(digest, name.clone());
                Some(name)
            }
            Err(e) => {
                debug!("Gemini context cache unavailable, sending inline: {}", e);
                None
            }
        }
    }
}

/// `cachedContents` body holding the context text.
pub fn build_cache_request(model: &str, context: &str, ttl: Duration) -> Value {
    json!({
        "model": format!("models/{}", model),
        "contents": [{ "role": "user", "parts": [{ "text": context }] }],
        "ttl": format!("{}s", ttl.as_secs()),
    })
}

fn conversation(request: &CompletionRequest) -> Vec<(&'static str, Vec<Value>)> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for msg in &request.messages {
        let (role, parts): (&'static str, Vec<Value>) = match msg.role {
            MessageRole::System | MessageRole::User => ("user", vec![json!({"text": msg.content})]),
            MessageRole::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(json!({"text": msg.content}));
                }
                for call in &msg.tool_calls {
                    names.insert(call.id.as_str(), call.name.as_str());
                    let args: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    parts.push(json!({"functionCall": {"name": call.name, "args": args}}));
                }
                if parts.is_empty() {
                    continue;
                }
                ("model", parts)
            }
            MessageRole::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let name = names.get(id).copied().unwrap_or("tool");
                (
                    "user",
                    vec![json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "content": msg.content }
                        }
                    })],
                )
            }
        };

        match turns.last_mut() {
            Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
            _ => turns.push((role, parts)),
        }
    }
    turns
}

/// The context text worth uploading as a `cachedContents` entry.
///
/// A request carrying a tool catalog never uses the cache: the API rejects
/// `tools` next to `cachedContent`, and the catalog must reach the model.
pub fn cacheable_context(request: &CompletionRequest) -> Option<&str> {
    if !request.tools.is_empty() {
        return None;
    }
    request.context.as_deref().filter(|c| !c.is_empty())
}

/// `generateContent` body. With `cached_context`, the context is referenced
/// by name and the system prompt is prepended as a user turn. Requests with
/// tools always inline the context and ignore `cached_context`.
pub fn build_request(
    max_tokens: u32,
    request: &CompletionRequest,
    cached_context: Option<&str>,
) -> Value {
    let cached_context = cached_context.filter(|_| request.tools.is_empty());
    let mut turns = conversation(request);

    let mut body = json!({
        "generationConfig": { "maxOutputTokens": max_tokens },
    });

    match cached_context {
        Some(name) => {
            let preamble = json!({"text": request.system});
            match turns.first_mut() {
                Some((role, parts)) if *role == "user" => parts.insert(0, preamble),
                _ => turns.insert(0, ("user", vec![preamble])),
            }
            body["cachedContent"] = Value::String(name.to_string());
        }
        None => {
            body["systemInstruction"] = json!({ "parts": [{ "text": request.system_with_context() }] });
        }
    }

    body["contents"] = Value::Array(
        turns
            .into_iter()
            .map(|(role, parts)| json!({ "role": role, "parts": parts }))
            .collect(),
    );

    if !request.tools.is_empty() {
        let decls: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": decls }]);
    }
    body
}

pub fn parse_response(json: &Value) -> Result<Completion, ModelError> {
    let candidate = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ModelError::decode(PROVIDER, "missing candidates[0]"))?;

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in &parts {
        if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
            text.push_str(t);
        } else if let Some(call) = part.get("functionCall") {
            tool_calls.push(ToolCall {
                id: format!("call_{}", tool_calls.len()),
                name: call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string(),
                arguments: call
                    .get("args")
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
            });
        }
    }

    Ok(Completion { text, tool_calls })
}

#[async_trait]
impl ModelBackend for GeminiChat {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        let api_key = self
            .secrets
            .first_of(GEMINI_KEYS)
            .await
            .ok_or_else(|| ModelError::missing_credential(PROVIDER, GEMINI_KEYS))?;

        let cached = match cacheable_context(request) {
            Some(ctx) if self.contexts.is_enabled() => self.cached_context(&api_key, ctx).await,
            _ => None,
        };

        let body = build_request(self.config.max_output_tokens, request, cached.as_deref());
        let url = format!("{}/models/{}:generateContent", self.base(), self.config.model);
        let json = post_json(
            &self.client,
            PROVIDER,
            &url,
            &[("x-goog-api-key", api_key.as_str())],
            &body,
        )
        .await?;
        parse_response(&json)
    }
}
