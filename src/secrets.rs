//! Credential lookup.
//!
//! The embedder and model backends ask a [`SecretStore`] for credentials by
//! name, trying an ordered list of acceptable names per provider and using
//! the first one that is present.

use std::collections::HashMap;

use async_trait::async_trait;

/// Acceptable credential names for the OpenAI backends, in lookup order.
pub const OPENAI_KEYS: &[&str] = &["OPENAI_API_KEY", "openai"];
/// Acceptable credential names for the Anthropic backend.
pub const ANTHROPIC_KEYS: &[&str] = &["ANTHROPIC_API_KEY", "anthropic", "CLAUDE_API_KEY"];
/// Acceptable credential names for the Gemini backend.
pub const GEMINI_KEYS: &[&str] = &["GEMINI_API_KEY", "gemini", "GOOGLE_API_KEY"];

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Look up one credential; `None` when it is not configured.
    async fn get(&self, name: &str) -> Option<String>;

    /// Return the first present credential among `names`.
    async fn first_of(&self, names: &[&str]) -> Option<String> {
        for name in names {
            if let Some(value) = self.get(name).await {
                return Some(value);
            }
        }
        None
    }
}

/// Reads credentials from environment variables. Empty values count as absent.
pub struct EnvSecrets;

#[async_trait]
impl SecretStore for EnvSecrets {
    async fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

/// Fixed in-memory credentials.
#[derive(Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecrets {
    async fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}
