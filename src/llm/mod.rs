//! Model backends and task routing.
//!
//! The orchestrator speaks one provider-neutral vocabulary
//! ([`Message`], [`CompletionRequest`], [`Completion`]); each backend
//! translates it to its vendor's wire format with pure `build_request` /
//! `parse_response` functions and a thin HTTP call.
//!
//! | Backend | Used for (default) | Caching |
//! |---------|--------------------|---------|
//! | [`openai::OpenAIChat`] | tool rounds | none |
//! | [`anthropic::AnthropicChat`] | persona answers | in-process response cache |
//! | [`gemini::GeminiChat`] | research fallback | server-side context cache |
//!
//! [`ModelRouter::complete`] never fails: every [`ModelError`] is rendered
//! into placeholder text for the user.

pub mod anthropic;
pub mod cache;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::config::{BackendConfig, ModelsConfig};
use crate::secrets::SecretStore;

// ═══════════════════════════════════════════════════════════════════════
// Conversation types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text as produced by the model; may be malformed.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// An assistant turn that requested tools.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(MessageRole::Assistant, content)
        }
    }

    /// The observation for one tool call.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }
}

/// Tool catalog entry sent to tool-capable backends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// Retrieved context block. Kept apart from `system` so backends with
    /// a context cache can upload it once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl CompletionRequest {
    /// System prompt with the context block appended, for backends that
    /// send the context inline.
    pub fn system_with_context(&self) -> String {
        match self.context.as_deref() {
            Some(ctx) if !ctx.is_empty() => format!("{}\n\n{}", self.system, ctx),
            _ => self.system.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// What a request is for; the router maps each kind to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Tools,
    Assistant,
    Research,
}

// ═══════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no API key configured for {provider} (set one of: {names})")]
    MissingCredential { provider: String, names: String },

    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("request to {provider} failed: {message}")]
    Transport { provider: String, message: String },

    #[error("could not decode {provider} response: {message}")]
    Decode { provider: String, message: String },

    #[error("no model backend named '{0}'")]
    UnknownBackend(String),
}

impl ModelError {
    pub fn missing_credential(provider: &str, names: &[&str]) -> Self {
        ModelError::MissingCredential {
            provider: provider.to_string(),
            names: names.join(", "),
        }
    }

    pub fn decode(provider: &str, message: impl Into<String>) -> Self {
        ModelError::Decode {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

/// User-visible text standing in for a failed model call.
pub fn placeholder(err: &ModelError) -> String {
    match err {
        ModelError::MissingCredential { provider, names } => format!(
            "The {} model is not configured. Add an API key under one of: {}.",
            provider, names
        ),
        ModelError::UnknownBackend(name) => format!(
            "No model backend named '{}' is available. Check the [models] section of the config.",
            name
        ),
        other => format!(
            "The model request could not be completed ({}). Please try again.",
            other
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Backend trait and router
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError>;
}

/// POST a JSON body and decode a JSON response, mapping failures onto
/// [`ModelError`].
pub(crate) async fn post_json(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    headers: &[(&str, &str)],
    body: &Value,
) -> Result<Value, ModelError> {
    let mut req = client.post(url).json(body);
    for (name, value) in headers {
        req = req.header(*name, *value);
    }

    let resp = req.send().await.map_err(|e| ModelError::Transport {
        provider: provider.to_string(),
        message: e.to_string(),
    })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ModelError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    resp.json::<Value>()
        .await
        .map_err(|e| ModelError::decode(provider, e.to_string()))
}

pub(crate) fn http_client(config: &BackendConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Dispatches task-typed requests to backends.
pub struct ModelRouter {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
    tools: String,
    assistant: String,
    research: String,
}

impl ModelRouter {
    /// Build the three HTTP backends from config. Credentials are looked up
    /// per call, so a missing key only surfaces when that backend is used.
    pub fn from_config(config: &ModelsConfig, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        let mut backends: HashMap<String, Arc<dyn ModelBackend>> = HashMap::new();
        backends.insert(
            "openai".to_string(),
            Arc::new(openai::OpenAIChat::new(&config.openai, secrets.clone())?),
        );
        backends.insert(
            "anthropic".to_string(),
            Arc::new(anthropic::AnthropicChat::new(&config.anthropic, secrets.clone())?),
        );
        backends.insert(
            "gemini".to_string(),
            Arc::new(gemini::GeminiChat::new(&config.gemini, secrets)?),
        );

        Ok(Self {
            backends,
            tools: config.tools.clone(),
            assistant: config.assistant.clone(),
            research: config.research.clone(),
        })
    }

    /// Route each task kind to an explicit backend.
    pub fn with_backends(
        tools: Arc<dyn ModelBackend>,
        assistant: Arc<dyn ModelBackend>,
        research: Arc<dyn ModelBackend>,
    ) -> Self {
        let names = (
            format!("tools:{}", tools.name()),
            format!("assistant:{}", assistant.name()),
            format!("research:{}", research.name()),
        );
        let mut backends: HashMap<String, Arc<dyn ModelBackend>> = HashMap::new();
        backends.insert(names.0.clone(), tools);
        backends.insert(names.1.clone(), assistant);
        backends.insert(names.2.clone(), research);
        Self {
            backends,
            tools: names.0,
            assistant: names.1,
            research: names.2,
        }
    }

    fn route(&self, task: TaskKind) -> &str {
        match task {
            TaskKind::Tools => &self.tools,
            TaskKind::Assistant => &self.assistant,
            TaskKind::Research => &self.research,
        }
    }

    /// Run a request on the backend for `task`, or fail with the error.
    pub async fn try_complete(
        &self,
        task: TaskKind,
        request: &CompletionRequest,
    ) -> Result<Completion, ModelError> {
        let name = self.route(task);
        let backend = self
            .backends
            .get(name)
            .ok_or_else(|| ModelError::UnknownBackend(name.to_string()))?;
        backend.complete(request).await
    }

    /// Like [`try_complete`](Self::try_complete), but failures become a
    /// placeholder completion with no tool calls.
    pub async fn complete(&self, task: TaskKind, request: &CompletionRequest) -> Completion {
        match self.try_complete(task, request).await {
            Ok(c) => c,
            Err(e) => {
                warn!("{:?} model request failed: {}", task, e);
                Completion::text(placeholder(&e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl ModelBackend for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, ModelError> {
            Ok(Completion::text(self.0))
        }
    }

    struct Failing;

    #[async_trait]
    impl ModelBackend for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, ModelError> {
            Err(ModelError::missing_credential("openai", &["OPENAI_API_KEY", "openai"]))
        }
    }

    #[tokio::test]
    async fn test_routes_by_task() {
        let router = ModelRouter::with_backends(
            Arc::new(Fixed("t")),
            Arc::new(Fixed("a")),
            Arc::new(Fixed("r")),
        );
        let req = CompletionRequest::default();
        assert_eq!(router.complete(TaskKind::Tools, &req).await.text, "t");
        assert_eq!(router.complete(TaskKind::Assistant, &req).await.text, "a");
        assert_eq!(router.complete(TaskKind::Research, &req).await.text, "r");
    }

    #[tokio::test]
    async fn test_failure_becomes_placeholder() {
        let router = ModelRouter::with_backends(
            Arc::new(Failing),
            Arc::new(Fixed("a")),
            Arc::new(Fixed("r")),
        );
        let c = router
            .complete(TaskKind::Tools, &CompletionRequest::default())
            .await;
        assert!(c.tool_calls.is_empty());
        assert!(c.text.contains("OPENAI_API_KEY"));
    }

    #[tokio::test]
    async fn test_router_from_config_routes_to_named_backends() {
        let secrets = Arc::new(crate::secrets::StaticSecrets::new());
        let router = ModelRouter::from_config(&ModelsConfig::default(), secrets).unwrap();
        let err = router
            .try_complete(TaskKind::Assistant, &CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::MissingCredential { ref provider, .. } if provider == "anthropic"));
    }

    #[test]
    fn test_system_with_context() {
        let mut req = CompletionRequest {
            system: "sys".to_string(),
            ..Default::default()
        };
        assert_eq!(req.system_with_context(), "sys");
        req.context = Some("ctx".to_string());
        assert_eq!(req.system_with_context(), "sys\n\nctx");
    }

    #[test]
    fn test_message_serialization_skips_empty() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }
}
