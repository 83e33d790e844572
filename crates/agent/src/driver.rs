//! The turn driver: the state machine shared by the agent loop and the
//! exploration sub-loop.
//!
//! ```text
//! Dispatch ─▶ Stream ─▶ Decide ──(no calls)──▶ Idle
//!    ▲                    │
//!    │                 (calls)
//!    │                    ▼
//!    └──── Iterate ◀── Execute ──(stop signal)──▶ Signalled
//! ```
//!
//! What a tool call *does* is left to a [`ToolDispatch`]; the driver owns
//! streaming, fragment reassembly, the iteration budget, deadlines and
//! cancellation.

use async_trait::async_trait;
use chrono::Utc;
use clinscribe_core::completion::{CompletionClient, CompletionEvent, CompletionRequest, ToolDefinition, Usage};
use clinscribe_core::error::ProviderError;
use clinscribe_core::event::{DomainEvent, EventBus};
use clinscribe_core::message::{Conversation, Message};
use clinscribe_core::tool::ToolResult;
use std::time::Duration;
use tracing::{debug, warn};

use crate::stream_event::{AgentStreamEvent, EventSink};
use crate::tool_buffer::{AssembledCall, ToolCallBuffer};

/// Turn-scoped count of completion calls and lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    max: u32,
    used: u32,
}

impl IterationBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Spend one iteration. Returns `false` once the budget is spent.
    pub fn try_charge(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn remaining(&self) -> u32 {
        self.max - self.used
    }

    pub fn is_spent(&self) -> bool {
        self.used >= self.max
    }
}

/// Model parameters for every completion call of a turn.
#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Deadline for one completion call, stream included
    pub timeout: Duration,
}

/// Result of dispatching one tool call.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub result: ToolResult,
    pub deduplicated: bool,
    /// The call asked the loop to stop after this batch
    pub stop: bool,
}

impl Dispatched {
    pub fn executed(result: ToolResult) -> Self {
        Self {
            result,
            deduplicated: false,
            stop: false,
        }
    }
}

/// Executes the tool calls a completion asked for.
#[async_trait]
pub trait ToolDispatch: Send {
    async fn dispatch(&mut self, call: &AssembledCall, budget: &mut IterationBudget) -> Dispatched;
}

/// How a drive ended.
#[derive(Debug, Clone)]
pub enum DriveOutcome {
    /// The model answered without calling tools
    Idle,
    /// A tool call signalled completion
    Signalled,
    /// The iteration budget ran out
    Exhausted,
    CompletionFailed(ProviderError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DriveReport {
    pub outcome: DriveOutcome,
    /// Every piece of text streamed during the drive
    pub text: String,
    /// Completion calls made
    pub completions: u32,
    pub tool_calls: usize,
    pub usage: Option<Usage>,
}

/// What one completion call produced.
#[derive(Debug, Default)]
struct Step {
    text: String,
    calls: Vec<AssembledCall>,
    usage: Option<Usage>,
}

enum StepError {
    Completion(ProviderError),
    Cancelled,
}

pub struct TurnDriver<'a> {
    client: &'a dyn CompletionClient,
    settings: &'a CompletionSettings,
    tools: Vec<ToolDefinition>,
    event_bus: Option<&'a EventBus>,
}

impl<'a> TurnDriver<'a> {
    pub fn new(client: &'a dyn CompletionClient, settings: &'a CompletionSettings, tools: Vec<ToolDefinition>) -> Self {
        Self {
            client,
            settings,
            tools,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: &'a EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Run completion calls and tool dispatches until a terminal state.
    pub async fn drive<D: ToolDispatch>(
        &self,
        conversation: &mut Conversation,
        dispatch: &mut D,
        budget: &mut IterationBudget,
        sink: &EventSink,
    ) -> DriveReport {
        let mut report = DriveReport {
            outcome: DriveOutcome::Idle,
            text: String::new(),
            completions: 0,
            tool_calls: 0,
            usage: None,
        };

        loop {
            if sink.is_cancelled() {
                report.outcome = DriveOutcome::Cancelled;
                return report;
            }
            if !budget.try_charge() {
                warn!(
                    conversation_id = %conversation.id,
                    max = budget.max(),
                    "Iteration budget exhausted"
                );
                report.outcome = DriveOutcome::Exhausted;
                return report;
            }
            report.completions += 1;

            debug!(
                conversation_id = %conversation.id,
                iteration = budget.used(),
                messages = conversation.messages.len(),
                "Completion call"
            );

            let mut streamed = String::new();
            let step = match self.complete(conversation, sink, &mut streamed).await {
                Ok(step) => step,
                Err(StepError::Cancelled) => {
                    report.outcome = DriveOutcome::Cancelled;
                    return report;
                }
                Err(StepError::Completion(e)) => {
                    warn!(conversation_id = %conversation.id, error = %e, "Completion failed");
                    // Text already shown to the user stays part of the answer
                    report.text.push_str(&streamed);
                    report.outcome = DriveOutcome::CompletionFailed(e);
                    return report;
                }
            };

            report.text.push_str(&step.text);
            if let Some(usage) = &step.usage {
                self.publish_usage(conversation, usage);
                report.usage = Some(accumulate(report.usage.take(), usage));
            }

            if step.calls.is_empty() {
                conversation.push(Message::assistant(step.text));
                report.outcome = DriveOutcome::Idle;
                return report;
            }

            let message_calls = step.calls.iter().map(AssembledCall::to_message_call).collect();
            conversation.push(Message::assistant_with_tools(step.text, message_calls));

            let mut stop = false;
            for call in &step.calls {
                sink.send(AgentStreamEvent::ToolStarted {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                })
                .await;

                let dispatched = dispatch.dispatch(call, budget).await;
                report.tool_calls += 1;

                sink.send(AgentStreamEvent::ToolFinished {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    success: dispatched.result.success,
                    deduplicated: dispatched.deduplicated,
                })
                .await;

                conversation.push(Message::tool_result(&call.id, dispatched.result.to_message_content()));
                stop |= dispatched.stop;
            }

            if stop {
                report.outcome = DriveOutcome::Signalled;
                return report;
            }
        }
    }

    /// One streamed completion call, racing its deadline and the cancel token.
    /// Text deltas collect in `streamed` until the step finishes.
    async fn complete(
        &self,
        conversation: &Conversation,
        sink: &EventSink,
        streamed: &mut String,
    ) -> Result<Step, StepError> {
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages: conversation.messages.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools: self.tools.clone(),
        };

        let work = async {
            let mut stream = self.client.stream(request).await?;
            let mut step = Step::default();
            let mut buffer = ToolCallBuffer::new();

            while let Some(event) = stream.recv().await {
                match event? {
                    CompletionEvent::ContentDelta { text } => {
                        sink.send(AgentStreamEvent::ContentDelta { text: text.clone() }).await;
                        streamed.push_str(&text);
                    }
                    CompletionEvent::ToolCallFragment {
                        index,
                        id,
                        name,
                        arguments,
                    } => buffer.push(index, id, name, arguments),
                    CompletionEvent::Finished { usage } => {
                        step.usage = usage;
                        break;
                    }
                }
            }

            step.text = std::mem::take(&mut *streamed);
            step.calls = buffer.finish();
            Ok::<_, ProviderError>(step)
        };

        tokio::select! {
            biased;
            _ = sink.cancelled() => Err(StepError::Cancelled),
            result = tokio::time::timeout(self.settings.timeout, work) => match result {
                Ok(Ok(step)) => Ok(step),
                Ok(Err(e)) => Err(StepError::Completion(e)),
                Err(_) => Err(StepError::Completion(ProviderError::Timeout(format!(
                    "no complete response within {}s",
                    self.settings.timeout.as_secs()
                )))),
            },
        }
    }

    fn publish_usage(&self, conversation: &Conversation, usage: &Usage) {
        if let Some(bus) = self.event_bus {
            bus.publish(DomainEvent::CompletionFinished {
                conversation_id: conversation.id.to_string(),
                model: self.settings.model.clone(),
                tokens_used: usage.total_tokens,
                timestamp: Utc::now(),
            });
        }
    }
}

fn accumulate(total: Option<Usage>, step: &Usage) -> Usage {
    let mut total = total.unwrap_or_default();
    total.prompt_tokens += step.prompt_tokens;
    total.completion_tokens += step.completion_tokens;
    total.total_tokens += step.total_tokens;
    total
}
