//! Exploration sub-loop: budget-aware retrieval over a session corpus
//! before a document is generated.
//!
//! The model only sees read-only tools ([`ExplorationTool`]). Every
//! retrieval is charged against an [`ExplorationContext`]; the loop ends
//! when the model calls `signal_done`, stops calling tools, runs out of
//! iterations, or the completion service fails. Whatever was gathered is
//! returned in every case.

pub mod context;
pub mod tools;

use async_trait::async_trait;
use clinscribe_config::ExplorationConfig;
use clinscribe_core::completion::{CompletionClient, Usage};
use clinscribe_core::corpus::CorpusSource;
use clinscribe_core::error::ToolError;
use clinscribe_core::event::EventBus;
use clinscribe_core::message::{Conversation, ConversationId, Message};
use clinscribe_core::tool::{ToolContext, ToolResult};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use context::{BudgetUsage, ExplorationContext};
pub use tools::ExplorationTool;

use crate::driver::{CompletionSettings, Dispatched, DriveOutcome, IterationBudget, ToolDispatch, TurnDriver};
use crate::stream_event::EventSink;
use crate::tool_buffer::AssembledCall;

/// Why exploration stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The model called `signal_done`
    Done,
    /// The model answered without calling a tool
    ModelStopped,
    IterationCap,
    CompletionFailed { message: String },
    Cancelled,
}

/// One model decision: which tool it called and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub tool: String,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExplorationReport {
    pub items: Vec<Value>,
    pub usage: BudgetUsage,
    pub stop: StopReason,
    pub decisions: Vec<Decision>,
    pub iterations: u32,
    pub completion_usage: Option<Usage>,
}

pub struct Explorer {
    client: Arc<dyn CompletionClient>,
    corpus: Arc<dyn CorpusSource>,
    settings: CompletionSettings,
    config: ExplorationConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl Explorer {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        corpus: Arc<dyn CorpusSource>,
        model: impl Into<String>,
        config: ExplorationConfig,
    ) -> Self {
        Self {
            client,
            corpus,
            settings: CompletionSettings {
                model: model.into(),
                temperature: 0.2,
                max_tokens: None,
                timeout: Duration::from_secs(120),
            },
            config,
            event_bus: None,
        }
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.settings.temperature = temperature;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Gather material from `corpus_ids` for `task`.
    ///
    /// `budget_tokens` overrides the configured token budget.
    pub async fn explore(
        &self,
        ctx: &ToolContext,
        task: &str,
        corpus_ids: &[String],
        budget_tokens: Option<usize>,
        sink: &EventSink,
    ) -> ExplorationReport {
        let budget = budget_tokens.unwrap_or(self.config.token_budget as usize);
        let mut context = ExplorationContext::new(budget, self.config.avg_tokens_per_item as usize);

        let mut conversation = Conversation::with_id(ConversationId(format!("explore-{}", ctx.conversation_id)));
        conversation.set_system_prompt(self.system_prompt(corpus_ids.len()));
        conversation.push(Message::user(task_message(task, corpus_ids, budget)));

        info!(
            sources = corpus_ids.len(),
            budget_tokens = budget,
            max_iterations = self.config.max_iterations,
            "Exploration started"
        );

        let mut dispatch = ExplorationDispatch {
            explorer: self,
            ctx,
            corpus_ids,
            context: &mut context,
            decisions: Vec::new(),
            last: None,
        };
        let mut iterations = IterationBudget::new(self.config.max_iterations);

        let mut driver = TurnDriver::new(self.client.as_ref(), &self.settings, ExplorationTool::definitions());
        if let Some(bus) = &self.event_bus {
            driver = driver.with_event_bus(bus);
        }
        let report = driver.drive(&mut conversation, &mut dispatch, &mut iterations, sink).await;
        let decisions = dispatch.decisions;

        let stop = match report.outcome {
            DriveOutcome::Signalled => StopReason::Done,
            DriveOutcome::Idle => StopReason::ModelStopped,
            DriveOutcome::Exhausted => StopReason::IterationCap,
            DriveOutcome::CompletionFailed(e) => StopReason::CompletionFailed { message: e.to_string() },
            DriveOutcome::Cancelled => StopReason::Cancelled,
        };
        let usage = context.usage();

        info!(
            stop = ?stop,
            items = usage.items,
            tokens_used = usage.tokens_used,
            iterations = iterations.used(),
            "Exploration finished"
        );

        ExplorationReport {
            items: context.into_items(),
            usage,
            stop,
            decisions,
            iterations: iterations.used(),
            completion_usage: report.usage,
        }
    }

    fn system_prompt(&self, source_count: usize) -> String {
        let strategy = if source_count <= self.config.small_corpus_threshold {
            "The corpus is small. Pull every source in full with pull_source, then call signal_done."
        } else {
            "The corpus is large. Preview sources to learn what they cover, pull the oldest source in full, \
             then use search_source for targeted material from the rest. Call check_budget when unsure \
             and signal_done once the material is sufficient."
        };
        format!(
            "You gather material from recorded therapy sessions before a clinical document is written. \
             You can only read; you never write the document yourself. Every retrieval is charged against \
             a token budget and a full pull that does not fit is refused. {strategy} Always explain each \
             step in the reasoning parameter."
        )
    }
}

fn task_message(task: &str, corpus_ids: &[String], budget: usize) -> String {
    format!(
        "Task: {task}\nSources ({}): {}\nToken budget: {budget}",
        corpus_ids.len(),
        corpus_ids.join(", ")
    )
}

struct ExplorationDispatch<'a> {
    explorer: &'a Explorer,
    ctx: &'a ToolContext,
    corpus_ids: &'a [String],
    context: &'a mut ExplorationContext,
    decisions: Vec<Decision>,
    /// Last step that ran; an identical next call reuses its result
    last: Option<(ExplorationTool, Value, ToolResult)>,
}

impl<'a> ExplorationDispatch<'a> {
    fn source_id(&self, args: &Value) -> Result<String, ToolError> {
        let source_id = args
            .get("source_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("source_id is required".into()))?;
        if !self.corpus_ids.iter().any(|id| id == source_id) {
            return Err(ToolError::InvalidArguments(format!(
                "unknown source {source_id}; available: {}",
                self.corpus_ids.join(", ")
            )));
        }
        Ok(source_id.to_string())
    }

    async fn run(&mut self, tool: ExplorationTool, args: &Value) -> Result<Value, ToolError> {
        let explorer = self.explorer;
        let corpus = &explorer.corpus;
        let config = &explorer.config;
        match tool {
            ExplorationTool::PreviewSource => {
                let source_id = self.source_id(args)?;
                let limit = limit_arg(args, config.preview_limit);
                let items = corpus.preview(self.ctx, &source_id, limit).await?;
                let fetched = items.len();
                let added = self.context.accumulate_within_budget(&source_id, items.clone());
                Ok(json!({
                    "source_id": source_id,
                    "items": &items[..added],
                    "added": added,
                    "truncated": added < fetched,
                    "budget": self.context.usage(),
                }))
            }
            ExplorationTool::PullSource => {
                let source_id = self.source_id(args)?;
                let items = corpus.pull(self.ctx, &source_id).await?;
                let added = self.context.try_accumulate(&source_id, items)?;
                Ok(json!({
                    "source_id": source_id,
                    "added": added,
                    "budget": self.context.usage(),
                }))
            }
            ExplorationTool::SearchSource => {
                let source_id = self.source_id(args)?;
                let query = args
                    .get("query")
                    .and_then(Value::as_str)
                    .filter(|q| !q.trim().is_empty())
                    .ok_or_else(|| ToolError::InvalidArguments("query is required".into()))?;
                let limit = limit_arg(args, config.search_limit);
                let items = corpus.search(self.ctx, &source_id, query, limit).await?;
                let fetched = items.len();
                let added = self.context.accumulate_within_budget(&source_id, items.clone());
                Ok(json!({
                    "source_id": source_id,
                    "items": &items[..added],
                    "added": added,
                    "truncated": added < fetched,
                    "budget": self.context.usage(),
                }))
            }
            ExplorationTool::CheckBudget => Ok(serde_json::to_value(self.context.usage())
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: tool.to_string(),
                    reason: e.to_string(),
                })?),
            ExplorationTool::SignalDone => Ok(json!({ "done": true, "items": self.context.items().len() })),
        }
    }
}

#[async_trait]
impl<'a> ToolDispatch for ExplorationDispatch<'a> {
    async fn dispatch(&mut self, call: &AssembledCall, _budget: &mut IterationBudget) -> Dispatched {
        let tool = match call.name.parse::<ExplorationTool>() {
            Ok(tool) => tool,
            Err(e) => {
                warn!(tool = %call.name, "Exploration model called an unknown tool");
                return Dispatched::executed(ToolResult::failure(&call.id, e.to_string()));
            }
        };
        let args = match &call.arguments {
            Ok(args) => args.clone(),
            Err(e) => return Dispatched::executed(ToolResult::failure(&call.id, e.to_string())),
        };

        self.decisions.push(Decision {
            tool: tool.to_string(),
            reasoning: args.get("reasoning").and_then(Value::as_str).map(str::to_string),
        });

        let stop = tool == ExplorationTool::SignalDone;
        if let Some((last_tool, last_args, last_result)) = &self.last {
            if *last_tool == tool && *last_args == args {
                debug!(tool = %tool, "Duplicate consecutive exploration step, reusing result");
                return Dispatched {
                    result: last_result.readdressed(&call.id),
                    deduplicated: true,
                    stop,
                };
            }
        }

        let outcome = self.run(tool, &args).await;
        if let Err(e) = &outcome {
            debug!(tool = %tool, error = %e, "Exploration step refused");
        }

        let result = ToolResult::from_outcome(&call.id, outcome);
        self.last = Some((tool, args, result.clone()));
        Dispatched {
            result,
            deduplicated: false,
            stop,
        }
    }
}

fn limit_arg(args: &Value, default: usize) -> usize {
    args.get("limit")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedCompletionClient, ScriptedResponse, StaticCorpus, tool_ctx};
    use clinscribe_core::message::Role;
    use tokio_util::sync::CancellationToken;

    fn config() -> ExplorationConfig {
        ExplorationConfig {
            token_budget: 60_000,
            avg_tokens_per_item: 75,
            max_iterations: 25,
            small_corpus_threshold: 3,
            preview_limit: 10,
            search_limit: 20,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn explorer(client: Arc<ScriptedCompletionClient>, corpus: Arc<StaticCorpus>) -> Explorer {
        Explorer::new(client, corpus, "test-model", config())
    }

    #[tokio::test]
    async fn small_corpus_pulls_and_signals_done() {
        let client = Arc::new(ScriptedCompletionClient::new(vec![
            ScriptedResponse::tool_calls(vec![(
                "c1",
                "pull_source",
                r#"{"source_id":"s1","reasoning":"only one session"}"#,
            )]),
            ScriptedResponse::tool_calls(vec![("c2", "signal_done", r#"{"reasoning":"have it all"}"#)]),
        ]));
        let corpus = Arc::new(StaticCorpus::new(&[("s1", 40)]));
        let sink = EventSink::detached(CancellationToken::new());

        let report = explorer(client.clone(), corpus.clone())
            .explore(&tool_ctx(), "Write a progress note", &ids(&["s1"]), None, &sink)
            .await;

        assert_eq!(report.stop, StopReason::Done);
        assert!(client.calls() <= 3);
        assert_eq!(report.items.len(), 40);
        assert_eq!(report.usage.tokens_used, 3_000);
        assert_eq!(report.usage.sources_explored, ids(&["s1"]));
        assert_eq!(corpus.pulls(), ids(&["s1"]));
        assert_eq!(
            report.decisions,
            vec![
                Decision {
                    tool: "pull_source".into(),
                    reasoning: Some("only one session".into())
                },
                Decision {
                    tool: "signal_done".into(),
                    reasoning: Some("have it all".into())
                },
            ]
        );

        let requests = client.requests();
        let system = &requests[0].messages[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.contains("Pull every source in full"));
        assert_eq!(requests[0].tools.len(), 5);
    }

    #[tokio::test]
    async fn over_budget_pull_is_refused_and_context_kept() {
        let client = Arc::new(ScriptedCompletionClient::new(vec![
            ScriptedResponse::tool_calls(vec![("c1", "pull_source", r#"{"source_id":"s1"}"#)]),
            ScriptedResponse::tool_calls(vec![("c2", "pull_source", r#"{"source_id":"s2"}"#)]),
            ScriptedResponse::tool_calls(vec![("c3", "signal_done", r#"{"reasoning":"budget"}"#)]),
        ]));
        let corpus = Arc::new(StaticCorpus::new(&[("s1", 10), ("s2", 100)]));
        let sink = EventSink::detached(CancellationToken::new());

        let report = explorer(client.clone(), corpus)
            .explore(&tool_ctx(), "Summarise", &ids(&["s1", "s2"]), Some(2_000), &sink)
            .await;

        assert_eq!(report.stop, StopReason::Done);
        assert_eq!(report.items.len(), 10);
        assert_eq!(report.usage.tokens_used, 750);
        assert_eq!(report.usage.sources_explored, ids(&["s1"]));

        // The refusal was fed back to the model
        let requests = client.requests();
        let third = &requests[2];
        let refusal = third.messages.last().unwrap();
        assert_eq!(refusal.role, Role::Tool);
        assert!(refusal.content.contains("budget"));
    }

    #[tokio::test]
    async fn unknown_source_is_rejected() {
        let client = Arc::new(ScriptedCompletionClient::new(vec![
            ScriptedResponse::tool_calls(vec![("c1", "preview_source", r#"{"source_id":"nope"}"#)]),
            ScriptedResponse::text("Nothing to read."),
        ]));
        let corpus = Arc::new(StaticCorpus::new(&[("s1", 10)]));
        let sink = EventSink::detached(CancellationToken::new());

        let report = explorer(client.clone(), corpus)
            .explore(&tool_ctx(), "Summarise", &ids(&["s1"]), None, &sink)
            .await;

        assert_eq!(report.stop, StopReason::ModelStopped);
        assert!(report.items.is_empty());
        let requests = client.requests();
        let feedback = &requests[1].messages.last().unwrap().content;
        assert!(feedback.contains("unknown source nope"));
    }

    #[tokio::test]
    async fn preview_is_truncated_to_budget() {
        let client = Arc::new(ScriptedCompletionClient::new(vec![
            ScriptedResponse::tool_calls(vec![("c1", "preview_source", r#"{"source_id":"s1","limit":10}"#)]),
            ScriptedResponse::tool_calls(vec![("c2", "check_budget", "{}")]),
            ScriptedResponse::tool_calls(vec![("c3", "signal_done", r#"{"reasoning":"full"}"#)]),
        ]));
        let corpus = Arc::new(StaticCorpus::new(&[("s1", 50)]));
        let sink = EventSink::detached(CancellationToken::new());

        let report = explorer(client.clone(), corpus)
            .explore(&tool_ctx(), "Summarise", &ids(&["s1"]), Some(300), &sink)
            .await;

        assert_eq!(report.items.len(), 4);
        assert_eq!(report.usage.tokens_remaining, 0);
        let requests = client.requests();
        let budget_report = &requests[2].messages.last().unwrap().content;
        assert!(budget_report.contains("\"tokens_used\":300"));
    }

    #[tokio::test]
    async fn iteration_cap_returns_what_was_gathered() {
        let client = Arc::new(ScriptedCompletionClient::repeating(ScriptedResponse::tool_calls(vec![(
            "c",
            "search_source",
            r#"{"source_id":"s1","query":"sleep","limit":2}"#,
        )])));
        let corpus = Arc::new(StaticCorpus::new(&[("s1", 5)]));
        let sink = EventSink::detached(CancellationToken::new());
        let mut cfg = config();
        cfg.max_iterations = 3;

        let report = Explorer::new(client.clone(), corpus, "test-model", cfg)
            .explore(&tool_ctx(), "Summarise", &ids(&["s1"]), None, &sink)
            .await;

        assert_eq!(report.stop, StopReason::IterationCap);
        assert_eq!(client.calls(), 3);
        assert_eq!(report.iterations, 3);
        // Only the first search ran; the repeats reused its result
        assert_eq!(report.items.len(), 2);
    }

    #[tokio::test]
    async fn repeated_step_in_one_batch_runs_once() {
        let client = Arc::new(ScriptedCompletionClient::new(vec![
            ScriptedResponse::tool_calls(vec![
                ("c1", "pull_source", r#"{"source_id":"s1"}"#),
                ("c2", "pull_source", r#"{"source_id":"s1"}"#),
                ("c3", "search_source", r#"{"source_id":"s2","query":"sleep","limit":3}"#),
            ]),
            ScriptedResponse::tool_calls(vec![("c4", "signal_done", r#"{"reasoning":"enough"}"#)]),
        ]));
        let corpus = Arc::new(StaticCorpus::new(&[("s1", 2), ("s2", 10)]));
        let sink = EventSink::detached(CancellationToken::new());

        let report = explorer(client.clone(), corpus.clone())
            .explore(&tool_ctx(), "Summarise", &ids(&["s1", "s2"]), None, &sink)
            .await;

        assert_eq!(report.stop, StopReason::Done);
        assert_eq!(corpus.pulls(), ids(&["s1"]));
        assert_eq!(report.items.len(), 5);
        assert_eq!(report.usage.tokens_used, 375);
        assert_eq!(report.decisions.len(), 4);

        // Both pull calls got an answer, addressed to their own ids
        let requests = client.requests();
        let results: Vec<_> = requests[1]
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, results[1].content);
        assert_eq!(results[1].tool_call_id.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn large_corpus_gets_targeted_guidance() {
        let client = Arc::new(ScriptedCompletionClient::new(vec![ScriptedResponse::text("ok")]));
        let corpus = Arc::new(StaticCorpus::new(&[]));
        let sink = EventSink::detached(CancellationToken::new());

        let report = explorer(client.clone(), corpus)
            .explore(&tool_ctx(), "Summarise", &ids(&["a", "b", "c", "d"]), None, &sink)
            .await;

        assert_eq!(report.stop, StopReason::ModelStopped);
        let requests = client.requests();
        let system = &requests[0].messages[0].content;
        assert!(system.contains("search_source"));
        assert!(!system.contains("Pull every source in full"));
    }
}
