//! Anthropic messages API, with an optional in-process response cache.
//!
//! The cache key is the SHA-256 of the serialized request body, so any
//! change to model, system prompt, context or conversation misses.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::cache::{digest_json, ResponseCache};
use super::{
    http_client, post_json, Completion, CompletionRequest, MessageRole, ModelBackend, ModelError,
    ToolCall,
};
use crate::config::BackendConfig;
use crate::secrets::{SecretStore, ANTHROPIC_KEYS};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicChat {
    client: reqwest::Client,
    config: BackendConfig,
    secrets: Arc<dyn SecretStore>,
    cache: Option<ResponseCache>,
}

impl AnthropicChat {
    pub fn new(config: &BackendConfig, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            config: config.clone(),
            secrets,
            cache: config.response_cache.then(ResponseCache::new),
        })
    }
}

/// Messages request body. System-role messages are folded into the
/// top-level `system` field and consecutive same-role turns are merged,
/// since the API expects user and assistant turns to alternate.
pub fn build_request(model: &str, max_tokens: u32, request: &CompletionRequest) -> Value {
    let mut system = request.system_with_context();
    let mut turns: Vec<(&str, Vec<Value>)> = Vec::new();

    for msg in &request.messages {
        let (role, blocks) = match msg.role {
            MessageRole::System => {
                system.push_str("\n\n");
                system.push_str(&msg.content);
                continue;
            }
            MessageRole::User => ("user", vec![json!({"type": "text", "text": msg.content})]),
            MessageRole::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content}));
                }
                for call in &msg.tool_calls {
                    let input: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                if blocks.is_empty() {
                    continue;
                }
                ("assistant", blocks)
            }
            MessageRole::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                })],
            ),
        };

        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    let messages: Vec<Value> = turns
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "system": system,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}

pub fn parse_response(json: &Value) -> Result<Completion, ModelError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ModelError::decode(PROVIDER, "missing content array"))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                arguments: block
                    .get("input")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
            }),
            _ => {}
        }
    }

    Ok(Completion { text, tool_calls })
}

#[async_trait]
impl ModelBackend for AnthropicChat {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        let api_key = self
            .secrets
            .first_of(ANTHROPIC_KEYS)
            .await
            .ok_or_else(|| ModelError::missing_credential(PROVIDER, ANTHROPIC_KEYS))?;

        let body = build_request(&self.config.model, self.config.max_output_tokens, request);
        let key = digest_json(&body);
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!("Anthropic response cache hit");
            return Ok(hit);
        }

        let url = format!("{}/messages", self.config.base_url.trim_end_matches('/'));
        let json = post_json(
            &self.client,
            PROVIDER,
            &url,
            &[("x-api-key", api_key.as_str()), ("anthropic-version", API_VERSION)],
            &body,
        )
        .await?;
        let completion = parse_response(&json)?;

        if let Some(cache) = &self.cache {
            cache.put(key, completion.clone());
        }
        Ok(completion)
    }
}
