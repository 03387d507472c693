//! Orchestrator runs against scripted model backends and fake tools.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use vault_context::agent::{LoopState, Orchestrator, NO_ANSWER, NO_MATCHING_NOTES};
use vault_context::chunk::ChunkOptions;
use vault_context::config::{AgentConfig, Config};
use vault_context::embedding::Embedder;
use vault_context::index::VaultIndex;
use vault_context::llm::{
    Completion, CompletionRequest, MessageRole, ModelBackend, ModelError, ModelRouter, ToolCall,
};
use vault_context::search::Retriever;
use vault_context::store::memory::MemoryStore;
use vault_context::tools::{Tool, ToolContext, ToolError, ToolOutcome, ToolRegistry};
use vault_context::vault::{FsVault, Vault};

/// Returns queued completions in order, then repeats `fallback`. Records
/// every request it receives.
struct Scripted {
    name: &'static str,
    queue: Mutex<VecDeque<Completion>>,
    fallback: Completion,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl Scripted {
    fn new(name: &'static str, queue: Vec<Completion>, fallback: Completion) -> Arc<Self> {
        Arc::new(Self {
            name,
            queue: Mutex::new(queue.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn always(name: &'static str, completion: Completion) -> Arc<Self> {
        Self::new(name, Vec::new(), completion)
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn last_request(&self) -> CompletionRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ModelBackend for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.queue.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

struct Unavailable;

#[async_trait]
impl ModelBackend for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, ModelError> {
        Err(ModelError::missing_credential("anthropic", &["ANTHROPIC_API_KEY"]))
    }
}

/// Records the order in which it was called.
struct RecordingTool {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        "record"
    }

    fn description(&self) -> &str {
        "Record a label"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": { "label": { "type": "string" } } })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let label = args
            .get("label")
            .and_then(|l| l.as_str())
            .ok_or_else(|| ToolError::BadArguments("label required".to_string()))?;
        self.log.lock().unwrap().push(label.to_string());
        Ok(ToolOutcome::ok(format!("recorded {}", label)))
    }
}

fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

fn with_calls(calls: Vec<ToolCall>) -> Completion {
    Completion {
        text: String::new(),
        tool_calls: calls,
    }
}

async fn retriever(tmp: &TempDir, notes: &[(&str, &str)]) -> Retriever {
    let cfg = Config::minimal(tmp.path());
    let vault: Arc<dyn Vault> = Arc::new(FsVault::new(&cfg.vault).unwrap());
    for (path, text) in notes {
        vault.write(path, text).await.unwrap();
    }
    let index = VaultIndex::with_store(
        vault,
        Box::new(MemoryStore::new()),
        Embedder::fallback_only(),
        ChunkOptions::default(),
        cfg.vault.index_path.clone(),
    )
    .await;
    index.reindex_all().await.unwrap();
    Retriever::new(Arc::new(index), &cfg.retrieval)
}

fn orchestrator(
    retriever: Retriever,
    tools: Arc<dyn ModelBackend>,
    assistant: Arc<dyn ModelBackend>,
    research: Arc<dyn ModelBackend>,
    registry: ToolRegistry,
    max_steps: usize,
) -> Orchestrator {
    let agent = AgentConfig {
        max_steps,
        max_tool_output_chars: 200,
        ..AgentConfig::default()
    };
    Orchestrator::new(
        retriever,
        Arc::new(ModelRouter::with_backends(tools, assistant, research)),
        Arc::new(registry),
        agent,
        8,
    )
}

#[tokio::test]
async fn test_loop_terminates_when_model_always_wants_tools() {
    let tmp = TempDir::new().unwrap();
    let r = retriever(&tmp, &[("a.md", "# Intro\nHello world.")]).await;

    let tools = Scripted::always("tools", with_calls(vec![call("c", "list_notes", "{}")]));
    let assistant = Scripted::always("assistant", Completion::text("Done looking."));
    let research = Scripted::always("research", Completion::text("unused"));
    let agent = orchestrator(
        r,
        tools.clone(),
        assistant.clone(),
        research.clone(),
        ToolRegistry::with_builtins(),
        3,
    );

    let report = agent.run_report("hello").await;

    assert_eq!(tools.calls(), 3);
    assert_eq!(report.tool_rounds, 3);
    assert_eq!(report.tool_calls, 3);
    assert_eq!(
        report.states,
        vec![
            LoopState::Retrieving,
            LoopState::ToolRound(0),
            LoopState::ToolRound(1),
            LoopState::ToolRound(2),
            LoopState::Responding,
            LoopState::Done,
        ]
    );
    assert!(!report.answer.is_empty());
    assert_eq!(research.calls(), 0);
}

#[tokio::test]
async fn test_tool_messages_follow_their_calls() {
    let tmp = TempDir::new().unwrap();
    let r = retriever(&tmp, &[("a.md", "# Intro\nHello world.")]).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ToolRegistry::with_builtins();
    registry.register(Box::new(RecordingTool { log: log.clone() }));

    let tools = Scripted::new(
        "tools",
        vec![with_calls(vec![
            call("c1", "record", r#"{"label":"first"}"#),
            call("c2", "record", r#"{"label":"second"}"#),
            call("c3", "record", "{broken json"),
        ])],
        Completion::text("enough"),
    );
    let assistant = Scripted::always("assistant", Completion::text("Answer [[a.md#Intro]]"));
    let research = Scripted::always("research", Completion::default());
    let agent = orchestrator(
        r,
        tools.clone(),
        assistant.clone(),
        research,
        registry,
        4,
    );

    let answer = agent.run("record things").await;
    assert_eq!(answer, "Answer [[a.md#Intro]]");
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);

    let second_round = tools.last_request();
    let roles: Vec<MessageRole> = second_round.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Tool,
            MessageRole::Tool,
            MessageRole::User,
        ]
    );
    let ids: Vec<&str> = second_round.messages[2..5]
        .iter()
        .map(|m| m.tool_call_id.as_deref().unwrap())
        .collect();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);

    // Malformed arguments ran with `{}` and failed as an observation.
    let failed: Value = serde_json::from_str(&second_round.messages[4].content).unwrap();
    assert_eq!(failed["success"], false);
    assert!(failed["output"].as_str().unwrap().contains("label required"));

    // The catalog includes the registered tool.
    assert!(second_round.tools.iter().any(|t| t.name == "record"));
    assert_eq!(tools.calls(), 2);
}

#[tokio::test]
async fn test_empty_index_uses_placeholder_context() {
    let tmp = TempDir::new().unwrap();
    let r = retriever(&tmp, &[]).await;
    let tools = Scripted::always("tools", Completion::default());
    let assistant = Scripted::always("assistant", Completion::text("Nothing in the notes."));
    let agent = orchestrator(
        r,
        tools.clone(),
        assistant.clone(),
        Scripted::always("research", Completion::default()),
        ToolRegistry::with_builtins(),
        4,
    );

    let answer = agent.run("anything?").await;
    assert_eq!(answer, "Nothing in the notes.");
    assert_eq!(tools.last_request().context.as_deref(), Some(NO_MATCHING_NOTES));
    assert_eq!(assistant.last_request().context.as_deref(), Some(NO_MATCHING_NOTES));
}

#[tokio::test]
async fn test_sources_appended_when_answer_has_no_citation() {
    let tmp = TempDir::new().unwrap();
    let r = retriever(&tmp, &[("notes/a.md", "# Intro\nHello world.\n# Details\nMore text here.")]).await;
    let agent = orchestrator(
        r,
        Scripted::always("tools", Completion::default()),
        Scripted::always("assistant", Completion::text("Hello is mentioned.")),
        Scripted::always("research", Completion::default()),
        ToolRegistry::with_builtins(),
        2,
    );

    let answer = agent.run("hello world").await;
    assert!(answer.starts_with("Hello is mentioned.\n\nSources: [[notes/a.md#Intro]]"));
}

#[tokio::test]
async fn test_empty_assistant_reply_falls_back_to_research() {
    let tmp = TempDir::new().unwrap();
    let r = retriever(&tmp, &[("a.md", "# Intro\nHello world.")]).await;
    let research = Scripted::always("research", Completion::text("From research [[a.md#Intro]]"));
    let agent = orchestrator(
        r,
        Scripted::always("tools", Completion::default()),
        Scripted::always("assistant", Completion::text("   ")),
        research.clone(),
        ToolRegistry::with_builtins(),
        2,
    );

    assert_eq!(agent.run("hello").await, "From research [[a.md#Intro]]");
    assert_eq!(research.calls(), 1);
}

#[tokio::test]
async fn test_all_models_empty_still_answers() {
    let tmp = TempDir::new().unwrap();
    let r = retriever(&tmp, &[]).await;
    let agent = orchestrator(
        r,
        Scripted::always("tools", Completion::default()),
        Scripted::always("assistant", Completion::default()),
        Scripted::always("research", Completion::default()),
        ToolRegistry::with_builtins(),
        2,
    );
    assert_eq!(agent.run("q").await, NO_ANSWER);
}

#[tokio::test]
async fn test_unavailable_model_degrades_to_placeholder() {
    let tmp = TempDir::new().unwrap();
    let r = retriever(&tmp, &[]).await;
    let agent = orchestrator(
        r,
        Arc::new(Unavailable),
        Arc::new(Unavailable),
        Arc::new(Unavailable),
        ToolRegistry::with_builtins(),
        2,
    );
    let answer = agent.run("q").await;
    assert!(answer.contains("ANTHROPIC_API_KEY"));
}

#[tokio::test]
async fn test_tool_writes_are_visible_to_later_rounds() {
    let tmp = TempDir::new().unwrap();
    let r = retriever(&tmp, &[]).await;
    let tools = Scripted::new(
        "tools",
        vec![
            with_calls(vec![call(
                "w",
                "write_note",
                r##"{"path":"new/idea.md","content":"# Idea\nSolar panels on the shed."}"##,
            )]),
            with_calls(vec![call("s", "search_notes", r#"{"query":"solar"}"#)]),
        ],
        Completion::default(),
    );
    let agent = orchestrator(
        r.clone(),
        tools.clone(),
        Scripted::always("assistant", Completion::text("Saved [[new/idea.md#Idea]]")),
        Scripted::always("research", Completion::default()),
        ToolRegistry::with_builtins(),
        4,
    );

    agent.run("remember the solar idea").await;

    let last = tools.last_request();
    let search_obs: Value = serde_json::from_str(
        &last
            .messages
            .iter()
            .rev()
            .find(|m| m.tool_call_id.as_deref() == Some("s"))
            .unwrap()
            .content,
    )
    .unwrap();
    assert_eq!(search_obs["success"], true);
    assert!(search_obs["output"].as_str().unwrap().contains("[[new/idea.md#Idea]]"));
    assert!(r.index().bindings_for("new/idea.md").await.is_some());
}
