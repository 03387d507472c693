//! The bounded tool-use loop behind `vctx ask`.
//!
//! ```text
//! Retrieving ──► ToolRound(0) ──► ToolRound(1) ──► … ──► Responding ──► Done
//!                     │                                    ▲
//!                     └──────── no tool calls ─────────────┘
//! ```
//!
//! Each tool round sends the whole conversation plus the tool catalog to
//! the tools model. Requested tools run one at a time, in order, and each
//! result is appended as a tool message carrying the call's id. The round
//! that reaches `max_steps` moves to `Responding` even if the model still
//! wants tools. `Responding` asks the assistant model for the final answer,
//! falls back to the research model on an empty reply, and makes sure the
//! answer cites its sources.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::llm::{
    Completion, CompletionRequest, Message, MessageRole, ModelRouter, TaskKind, ToolCall,
};
use crate::models::SearchResult;
use crate::search::Retriever;
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

/// Context text used when retrieval finds nothing.
pub const NO_MATCHING_NOTES: &str = "(no matching notes)";

/// Returned when both answer models produce nothing.
pub const NO_ANSWER: &str = "I couldn't produce an answer from the notes.";

const TOOLS_PROMPT: &str = "You are a research assistant working inside a personal notes vault. \
Use the available tools when the context below is not enough to answer, or when the user asks \
you to change notes. When you have what you need, reply without calling any tool.";

const ANSWER_PROMPT: &str = "Answer the user's question from the context and tool results. \
Cite every claim with the [[path#block]] markers exactly as they appear in the context. \
Never invent a marker that does not appear in the context.";

const CONTINUE_PROMPT: &str =
    "Continue with the task using the tool results above. Call more tools only if needed.";

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[[^\]]+\]\]").expect("citation pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Retrieving,
    ToolRound(usize),
    Responding,
    Done,
}

/// Messages of one run. Tool messages are only accepted for call ids an
/// earlier assistant message issued.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
    issued: HashSet<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) -> bool {
        match message.role {
            MessageRole::Tool => {
                let known = message
                    .tool_call_id
                    .as_ref()
                    .is_some_and(|id| self.issued.contains(id));
                if !known {
                    warn!(
                        "Dropping tool message for unknown call id {:?}",
                        message.tool_call_id
                    );
                    return false;
                }
            }
            MessageRole::Assistant => {
                for call in &message.tool_calls {
                    self.issued.insert(call.id.clone());
                }
            }
            _ => {}
        }
        self.messages.push(message);
        true
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub answer: String,
    pub tool_rounds: usize,
    pub tool_calls: usize,
    pub states: Vec<LoopState>,
    pub sources: Vec<SearchResult>,
}

pub struct Orchestrator {
    retriever: Retriever,
    router: Arc<ModelRouter>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
    retrieval_limit: usize,
}

impl Orchestrator {
    pub fn new(
        retriever: Retriever,
        router: Arc<ModelRouter>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
        retrieval_limit: usize,
    ) -> Self {
        Self {
            retriever,
            router,
            tools,
            config,
            retrieval_limit,
        }
    }

    /// Answer `query`. Never fails; degraded paths produce placeholder text.
    pub async fn run(&self, query: &str) -> String {
        self.run_report(query).await.answer
    }

    pub async fn run_report(&self, query: &str) -> RunReport {
        let ctx = ToolContext::new(self.retriever.clone());
        let max_steps = self.config.max_steps.max(1);

        let mut conversation = Conversation::new();
        let mut states = Vec::new();
        let mut sources = Vec::new();
        let mut context = String::new();
        let mut answer = String::new();
        let mut tool_rounds = 0;
        let mut tool_calls = 0;

        let mut state = LoopState::Retrieving;
        loop {
            states.push(state);
            state = match state {
                LoopState::Retrieving => {
                    sources = self.retriever.search(query, self.retrieval_limit).await;
                    context = build_context(&sources);
                    debug!("Retrieved {} chunks for '{}'", sources.len(), query);
                    conversation.push(Message::user(query));
                    LoopState::ToolRound(0)
                }

                LoopState::ToolRound(step) => {
                    let request = CompletionRequest {
                        system: self.system_prompt(TOOLS_PROMPT),
                        messages: conversation.messages().to_vec(),
                        tools: self.tools.specs(),
                        context: Some(context.clone()),
                    };
                    let completion = self.router.complete(TaskKind::Tools, &request).await;
                    tool_rounds += 1;

                    if completion.tool_calls.is_empty() {
                        LoopState::Responding
                    } else {
                        tool_calls += completion.tool_calls.len();
                        self.run_tools(step, completion, &ctx, &mut conversation)
                            .await;
                        conversation.push(Message::user(CONTINUE_PROMPT));
                        if step + 1 >= max_steps {
                            info!("Tool budget of {} rounds used; answering", max_steps);
                            LoopState::Responding
                        } else {
                            LoopState::ToolRound(step + 1)
                        }
                    }
                }

                LoopState::Responding => {
                    answer = self.respond(&conversation, &context, &sources).await;
                    LoopState::Done
                }

                LoopState::Done => break,
            };
        }

        RunReport {
            answer,
            tool_rounds,
            tool_calls,
            states,
            sources,
        }
    }

    /// Record the assistant's calls, then execute them in order.
    async fn run_tools(
        &self,
        step: usize,
        completion: Completion,
        ctx: &ToolContext,
        conversation: &mut Conversation,
    ) {
        let calls = unique_call_ids(step, completion.tool_calls);
        conversation.push(Message::assistant_with_calls(
            completion.text,
            calls.clone(),
        ));

        for call in &calls {
            let args = parse_arguments(call);
            debug!("Round {}: calling {} with {}", step, call.name, args);
            let outcome = self.tools.execute(&call.name, args, ctx).await;
            let observation = render_observation(outcome, self.config.max_tool_output_chars);
            conversation.push(Message::tool(call.id.clone(), observation));
        }
    }

    async fn respond(
        &self,
        conversation: &Conversation,
        context: &str,
        sources: &[SearchResult],
    ) -> String {
        let request = CompletionRequest {
            system: self.system_prompt(ANSWER_PROMPT),
            messages: conversation.messages().to_vec(),
            tools: Vec::new(),
            context: Some(context.to_string()),
        };

        let reply = self.router.complete(TaskKind::Assistant, &request).await;
        let text = if reply.text.trim().is_empty() {
            info!("Assistant reply was empty; asking the research model");
            self.router.complete(TaskKind::Research, &request).await.text
        } else {
            reply.text
        };

        if text.trim().is_empty() {
            return NO_ANSWER.to_string();
        }
        ensure_citations(&text, sources, self.config.sources_limit)
    }

    fn system_prompt(&self, base: &str) -> String {
        match self.config.persona.as_deref() {
            Some(p) if !p.trim().is_empty() => format!("{}\n\n{}", p.trim(), base),
            _ => base.to_string(),
        }
    }
}

// ============ Helpers ============

/// The context block: each chunk under its citation marker, best first.
pub fn build_context(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return NO_MATCHING_NOTES.to_string();
    }
    results
        .iter()
        .map(|r| format!("{}\n{}", r.chunk.citation(), r.chunk.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Leave text that already cites something alone; otherwise append a
/// `Sources:` line with up to `limit` distinct markers, best first.
pub fn ensure_citations(text: &str, results: &[SearchResult], limit: usize) -> String {
    if CITATION.is_match(text) || results.is_empty() || limit == 0 {
        return text.to_string();
    }
    let mut seen = HashSet::new();
    let markers: Vec<String> = results
        .iter()
        .map(|r| r.chunk.citation())
        .filter(|m| seen.insert(m.clone()))
        .take(limit)
        .collect();
    format!("{}\n\nSources: {}", text.trim_end(), markers.join(", "))
}

/// Parse a call's argument text. Malformed or non-object JSON becomes `{}`.
pub fn parse_arguments(call: &ToolCall) -> Value {
    if call.arguments.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(&call.arguments) {
        Ok(v @ Value::Object(_)) => v,
        Ok(other) => {
            warn!(
                "Tool {} arguments are not an object ({}); using empty arguments",
                call.name, other
            );
            Value::Object(Default::default())
        }
        Err(e) => {
            warn!(
                "Malformed arguments for tool {}: {}; using empty arguments",
                call.name, e
            );
            Value::Object(Default::default())
        }
    }
}

/// Cut `output` to at most `max_chars` characters, marking the cut.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        None => output.to_string(),
        Some((byte_idx, _)) => {
            let dropped = output[byte_idx..].chars().count();
            format!(
                "{}\n[output truncated: {} more characters]",
                &output[..byte_idx],
                dropped
            )
        }
    }
}

fn render_observation(mut outcome: ToolOutcome, max_chars: usize) -> String {
    outcome.output = truncate_output(&outcome.output, max_chars);
    serde_json::to_string(&outcome).unwrap_or_else(|_| outcome.output.clone())
}

/// Give every call a non-empty id that is unique within the round.
fn unique_call_ids(step: usize, calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .enumerate()
        .map(|(i, mut call)| {
            if call.id.is_empty() || !seen.insert(call.id.clone()) {
                call.id = format!("call_{}_{}", step, i);
                seen.insert(call.id.clone());
            }
            call
        })
        .collect()
}
