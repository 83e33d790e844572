//! The agent loop: one user turn over the full tool catalog.

use async_trait::async_trait;
use chrono::Utc;
use clinscribe_core::completion::{CompletionClient, Usage};
use clinscribe_core::error::{ToolError, TurnError};
use clinscribe_core::event::{DomainEvent, EventBus};
use clinscribe_core::message::{Conversation, Message};
use clinscribe_core::session::{ResolutionCache, SessionStore};
use clinscribe_core::tool::{ToolCatalog, ToolContext, ToolKind, ToolResult};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::driver::{CompletionSettings, Dispatched, DriveOutcome, IterationBudget, ToolDispatch, TurnDriver};
use crate::repair::{ArgumentRepair, learn_from_result};
use crate::stream_event::{AgentStreamEvent, EventSink};
use crate::tool_buffer::AssembledCall;

/// Appended when the iteration cap ends a turn.
pub const ITERATION_FALLBACK: &str =
    "I wasn't able to finish this within the steps available for one request. Please narrow the request or ask me to continue.";

/// Sent when the completion service fails mid-turn.
pub const COMPLETION_APOLOGY: &str =
    "I'm sorry, I ran into a problem while generating a response. Please try again in a moment.";

/// The result of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final assistant text as the operator saw it
    pub text: String,
    pub iterations: u32,
    pub tool_calls: usize,
    pub usage: Option<Usage>,
    /// Why the turn ended early, if it did
    pub error: Option<TurnError>,
}

impl TurnOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(TurnError::Cancelled))
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            text: String::new(),
            iterations: 0,
            tool_calls: 0,
            usage: None,
            error: Some(TurnError::Cancelled),
        }
    }
}

/// The core agent loop that orchestrates completion calls and tool execution.
pub struct AgentLoop {
    client: Arc<dyn CompletionClient>,

    settings: CompletionSettings,

    tools: ToolCatalog,

    /// Maximum completion calls (and lookups) per turn
    max_iterations: u32,

    tool_timeout: Duration,

    event_bus: Arc<EventBus>,

    /// Where resolution-cache updates are merged, if anywhere
    sessions: Option<Arc<dyn SessionStore>>,
}

impl AgentLoop {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        model: impl Into<String>,
        tools: ToolCatalog,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            client,
            settings: CompletionSettings {
                model: model.into(),
                temperature: 0.7,
                max_tokens: None,
                timeout: Duration::from_secs(120),
            },
            tools,
            max_iterations: 6,
            tool_timeout: Duration::from_secs(30),
            event_bus,
            sessions: None,
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.settings.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.settings.max_tokens = Some(max);
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Merge resolution-cache updates into this store as they happen.
    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Run one turn. `conversation` must end with the user's message.
    ///
    /// Tool failures never end the turn. A completion failure ends it with
    /// an apology, the iteration cap with a fallback sentence after whatever
    /// text was already streamed.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        ctx: &ToolContext,
        cache: &mut ResolutionCache,
        sink: &EventSink,
    ) -> TurnOutcome {
        info!(
            conversation_id = %conversation.id,
            user_id = %ctx.user_id,
            messages = conversation.messages.len(),
            tools = self.tools.len(),
            "Processing turn"
        );

        let utterance = conversation.last_user_message().map(str::to_string);
        let driver = TurnDriver::new(self.client.as_ref(), &self.settings, self.tools.definitions())
            .with_event_bus(&self.event_bus);
        let mut dispatch = CatalogDispatch {
            agent: self,
            ctx,
            cache,
            utterance,
            last: None,
        };
        let mut budget = IterationBudget::new(self.max_iterations);

        let report = driver.drive(conversation, &mut dispatch, &mut budget, sink).await;

        let mut outcome = TurnOutcome {
            text: report.text,
            iterations: report.completions,
            tool_calls: report.tool_calls,
            usage: report.usage,
            error: None,
        };

        match report.outcome {
            DriveOutcome::Idle | DriveOutcome::Signalled => {
                info!(
                    conversation_id = %conversation.id,
                    iterations = outcome.iterations,
                    tool_calls = outcome.tool_calls,
                    "Turn complete"
                );
                self.event_bus.publish(DomainEvent::TurnCompleted {
                    conversation_id: conversation.id.to_string(),
                    iterations: outcome.iterations,
                    tool_calls: outcome.tool_calls,
                    timestamp: Utc::now(),
                });
                self.send_complete(conversation, &outcome, sink).await;
            }
            DriveOutcome::Exhausted => {
                let fallback = if outcome.text.is_empty() {
                    ITERATION_FALLBACK.to_string()
                } else {
                    format!("\n\n{ITERATION_FALLBACK}")
                };
                sink.send(AgentStreamEvent::ContentDelta { text: fallback.clone() }).await;
                outcome.text.push_str(&fallback);
                conversation.push(Message::assistant(outcome.text.clone()));

                let error = TurnError::IterationExhausted { max: self.max_iterations };
                self.abort(conversation, &error);
                outcome.error = Some(error);
                self.send_complete(conversation, &outcome, sink).await;
            }
            DriveOutcome::CompletionFailed(e) => {
                sink.send(AgentStreamEvent::Error {
                    message: COMPLETION_APOLOGY.into(),
                })
                .await;
                if outcome.text.is_empty() {
                    outcome.text = COMPLETION_APOLOGY.into();
                } else {
                    outcome.text = format!("{}\n\n{COMPLETION_APOLOGY}", outcome.text);
                }
                conversation.push(Message::assistant(outcome.text.clone()));

                let error = TurnError::Completion(e);
                self.abort(conversation, &error);
                outcome.error = Some(error);
            }
            DriveOutcome::Cancelled => {
                info!(conversation_id = %conversation.id, "Turn cancelled");
                let error = TurnError::Cancelled;
                self.abort(conversation, &error);
                outcome.error = Some(error);
            }
        }

        outcome
    }

    async fn send_complete(&self, conversation: &Conversation, outcome: &TurnOutcome, sink: &EventSink) {
        sink.send(AgentStreamEvent::TurnComplete {
            conversation_id: conversation.id.to_string(),
            iterations: outcome.iterations,
            tool_calls: outcome.tool_calls,
            usage: outcome.usage.clone(),
        })
        .await;
    }

    fn abort(&self, conversation: &Conversation, error: &TurnError) {
        warn!(conversation_id = %conversation.id, reason = %error, "Turn aborted");
        self.event_bus.publish(DomainEvent::TurnAborted {
            conversation_id: conversation.id.to_string(),
            reason: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Execute one tool with the tool deadline.
    async fn execute(&self, kind: ToolKind, ctx: &ToolContext, arguments: Value) -> Result<Value, ToolError> {
        match tokio::time::timeout(self.tool_timeout, self.tools.execute(kind, ctx, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool_name: kind.to_string(),
                timeout_secs: self.tool_timeout.as_secs(),
            }),
        }
    }
}

/// The last invocation that actually ran, for the duplicate guard.
struct Executed {
    tool: ToolKind,
    arguments: Map<String, Value>,
    result: ToolResult,
}

/// Dispatches calls against the catalog: parse, repair, dedup, execute, learn.
struct CatalogDispatch<'a> {
    agent: &'a AgentLoop,
    ctx: &'a ToolContext,
    cache: &'a mut ResolutionCache,
    utterance: Option<String>,
    last: Option<Executed>,
}

impl<'a> CatalogDispatch<'a> {
    /// Merge changed cache fields into the session in one write.
    async fn persist(&self, fields: Map<String, Value>) {
        if fields.is_empty() {
            return;
        }
        if let Some(sessions) = &self.agent.sessions {
            if let Err(e) = sessions.merge_fields(&self.ctx.conversation_id, fields).await {
                warn!(conversation_id = %self.ctx.conversation_id, error = %e, "Failed to persist resolution cache");
            }
        }
    }

    fn publish_executed(&self, tool: ToolKind, result: &ToolResult, deduplicated: bool, started: Instant) {
        self.agent.event_bus.publish(DomainEvent::ToolExecuted {
            tool_name: tool.to_string(),
            success: result.success,
            deduplicated,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl<'a> ToolDispatch for CatalogDispatch<'a> {
    async fn dispatch(&mut self, call: &AssembledCall, budget: &mut IterationBudget) -> Dispatched {
        let started = Instant::now();

        let tool = match call.name.parse::<ToolKind>() {
            Ok(tool) => tool,
            Err(e) => {
                warn!(tool = %call.name, "Model called an unknown tool");
                return Dispatched::executed(ToolResult::failure(&call.id, e.to_string()));
            }
        };

        let mut arguments = match &call.arguments {
            Ok(Value::Object(map)) => map.clone(),
            Ok(_) => Map::new(),
            Err(e) => {
                warn!(tool = %tool, error = %e, "Unusable tool arguments");
                let result = ToolResult::failure(&call.id, e.to_string());
                self.publish_executed(tool, &result, false, started);
                return Dispatched::executed(result);
            }
        };

        let repair = ArgumentRepair::new(&self.agent.tools, self.ctx, self.agent.tool_timeout);
        let report = repair
            .repair(tool, &mut arguments, self.cache, budget, self.utterance.as_deref())
            .await;
        for repaired in &report.repaired {
            debug!(tool = %tool, param = repaired.param, via_lookup = repaired.via_lookup, "Argument repaired");
            self.agent.event_bus.publish(DomainEvent::ArgumentRepaired {
                tool_name: tool.to_string(),
                param: repaired.param.to_string(),
                via_lookup: repaired.via_lookup,
                timestamp: Utc::now(),
            });
        }
        let mut changed = report.changed;

        if let Some(last) = &self.last {
            if last.tool == tool && last.arguments == arguments {
                debug!(tool = %tool, "Duplicate consecutive invocation, reusing result");
                let result = last.result.readdressed(&call.id);
                self.publish_executed(tool, &result, true, started);
                self.persist(changed).await;
                return Dispatched {
                    result,
                    deduplicated: true,
                    stop: false,
                };
            }
        }

        debug!(tool = %tool, "Executing tool");
        let outcome = self
            .agent
            .execute(tool, self.ctx, Value::Object(arguments.clone()))
            .await;
        let result = ToolResult::from_outcome(&call.id, outcome);

        if result.success {
            changed.extend(learn_from_result(tool, &arguments, &result.payload, self.cache));
        } else {
            warn!(tool = %tool, error = result.error.as_deref().unwrap_or_default(), "Tool failed");
        }
        self.persist(changed).await;
        self.publish_executed(tool, &result, false, started);

        self.last = Some(Executed {
            tool,
            arguments,
            result: result.clone(),
        });
        Dispatched::executed(result)
    }
}
