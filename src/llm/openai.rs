//! OpenAI-compatible chat completions with function calling.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    http_client, post_json, Completion, CompletionRequest, Message, MessageRole, ModelBackend,
    ModelError, ToolCall,
};
use crate::config::BackendConfig;
use crate::secrets::{SecretStore, OPENAI_KEYS};

const PROVIDER: &str = "openai";

pub struct OpenAIChat {
    client: reqwest::Client,
    config: BackendConfig,
    secrets: Arc<dyn SecretStore>,
}

impl OpenAIChat {
    pub fn new(config: &BackendConfig, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            config: config.clone(),
            secrets,
        })
    }
}

fn convert_message(msg: &Message) -> Value {
    match msg.role {
        MessageRole::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments }
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                Value::Null
            } else {
                Value::String(msg.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        MessageRole::System => json!({ "role": "system", "content": msg.content }),
        MessageRole::User => json!({ "role": "user", "content": msg.content }),
        MessageRole::Assistant => json!({ "role": "assistant", "content": msg.content }),
    }
}

/// Chat completions request body.
pub fn build_request(model: &str, max_tokens: u32, request: &CompletionRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": request.system_with_context() })];
    messages.extend(request.messages.iter().map(convert_message));

    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}

/// Extract text and tool calls from a chat completions response.
pub fn parse_response(json: &Value) -> Result<Completion, ModelError> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ModelError::decode(PROVIDER, "missing choices[0].message"))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        for (i, call) in calls.iter().enumerate() {
            let function = call
                .get("function")
                .ok_or_else(|| ModelError::decode(PROVIDER, "tool call without function"))?;
            let name = function
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| ModelError::decode(PROVIDER, "tool call without name"))?;
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "{}".to_string(),
            };
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("call_{}", i));
            tool_calls.push(ToolCall {
                id,
                name: name.to_string(),
                arguments,
            });
        }
    }

    Ok(Completion { text, tool_calls })
}

#[async_trait]
impl ModelBackend for OpenAIChat {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        let api_key = self
            .secrets
            .first_of(OPENAI_KEYS)
            .await
            .ok_or_else(|| ModelError::missing_credential(PROVIDER, OPENAI_KEYS))?;

        let body = build_request(&self.config.model, self.config.max_output_tokens, request);
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let auth = format!("Bearer {}", api_key);

        let json = post_json(
            &self.client,
            PROVIDER,
            &url,
            &[("Authorization", auth.as_str())],
            &body,
        )
        .await?;
        parse_response(&json)
    }
}
