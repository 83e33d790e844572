//! Shared test helpers: a scripted completion client, recording tool
//! executors and an in-memory corpus.

use async_trait::async_trait;
use clinscribe_core::completion::{CompletionClient, CompletionEvent, CompletionRequest, CompletionStream, Usage};
use clinscribe_core::corpus::CorpusSource;
use clinscribe_core::error::{ProviderError, ToolError};
use clinscribe_core::message::ConversationId;
use clinscribe_core::tool::{ToolContext, ToolExecutor, ToolKind};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::driver::CompletionSettings;

pub const CLIENT_ID: &str = "3f2b8c1e-5d4a-4e6f-9a7b-1c2d3e4f5a6b";
pub const ASSIGNMENT_ID: &str = "9a8b7c6d-5e4f-4a3b-8c2d-1e0f9a8b7c6d";

pub fn settings() -> CompletionSettings {
    CompletionSettings {
        model: "test-model".into(),
        temperature: 0.0,
        max_tokens: None,
        timeout: Duration::from_secs(30),
    }
}

pub fn tool_ctx() -> ToolContext {
    ToolContext {
        user_id: "user-1".into(),
        conversation_id: ConversationId::from("conv-1"),
        auth_token: Some("token".into()),
        ..ToolContext::default()
    }
}

fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

fn split_half(s: &str) -> (&str, &str) {
    let mid = s
        .char_indices()
        .map(|(i, _)| i)
        .nth(s.chars().count() / 2)
        .unwrap_or(s.len());
    s.split_at(mid)
}

/// One scripted completion response.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Events(Vec<CompletionEvent>),
    /// `stream` itself fails
    Error(ProviderError),
    /// Send these events, then never finish
    Stall(Vec<CompletionEvent>),
    /// Send these events, then fail mid-stream
    FailAfter(Vec<CompletionEvent>, ProviderError),
}

impl ScriptedResponse {
    /// A text answer streamed as two deltas.
    pub fn text(text: &str) -> Self {
        let (a, b) = split_half(text);
        Self::Events(vec![
            CompletionEvent::ContentDelta { text: a.into() },
            CompletionEvent::ContentDelta { text: b.into() },
            CompletionEvent::Finished { usage: Some(usage()) },
        ])
    }

    /// Tool calls `(id, name, arguments)` with each argument string split
    /// across two fragments.
    pub fn tool_calls(calls: Vec<(&str, &str, &str)>) -> Self {
        let mut events = Vec::new();
        for (index, (id, name, args)) in calls.iter().enumerate() {
            let (a, _) = split_half(args);
            events.push(CompletionEvent::ToolCallFragment {
                index: index as u32,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(a.into()),
            });
        }
        for (index, (_, _, args)) in calls.iter().enumerate() {
            let (_, b) = split_half(args);
            events.push(CompletionEvent::ToolCallFragment {
                index: index as u32,
                id: None,
                name: None,
                arguments: Some(b.into()),
            });
        }
        events.push(CompletionEvent::Finished { usage: Some(usage()) });
        Self::Events(events)
    }
}

/// Completion client that replays a script and records every request.
pub struct ScriptedCompletionClient {
    script: Mutex<VecDeque<ScriptedResponse>>,
    repeat: Option<ScriptedResponse>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletionClient {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with the same response.
    pub fn repeating(response: ScriptedResponse) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(response),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, ProviderError> {
        let call = self.requests.lock().unwrap().len();
        self.requests.lock().unwrap().push(request);

        let next = self.script.lock().unwrap().pop_front().or_else(|| self.repeat.clone());
        let Some(response) = next else {
            panic!("ScriptedCompletionClient: no response for call #{}", call + 1);
        };

        let (tx, rx) = mpsc::channel(64);
        match response {
            ScriptedResponse::Error(e) => return Err(e),
            ScriptedResponse::Events(events) => {
                tokio::spawn(async move {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            ScriptedResponse::Stall(events) => {
                tokio::spawn(async move {
                    for event in events {
                        let _ = tx.send(Ok(event)).await;
                    }
                    // Keep the sender alive until the receiver goes away
                    tx.closed().await;
                });
            }
            ScriptedResponse::FailAfter(events, error) => {
                tokio::spawn(async move {
                    for event in events {
                        let _ = tx.send(Ok(event)).await;
                    }
                    let _ = tx.send(Err(error)).await;
                });
            }
        }
        Ok(rx)
    }
}

/// Tool executor that records its arguments and returns a fixed outcome.
pub struct RecordingTool {
    kind: ToolKind,
    required: Vec<&'static str>,
    response: Result<serde_json::Value, ToolError>,
    delay: Option<Duration>,
    calls: Mutex<Vec<serde_json::Value>>,
}

impl RecordingTool {
    pub fn new(kind: ToolKind, response: serde_json::Value) -> Self {
        Self {
            kind,
            required: Vec::new(),
            response: Ok(response),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(kind: ToolKind, error: ToolError) -> Self {
        Self {
            response: Err(error),
            ..Self::new(kind, serde_json::Value::Null)
        }
    }

    /// Declare required string parameters in the schema.
    pub fn requiring(mut self, fields: &[&'static str]) -> Self {
        self.required = fields.to_vec();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<serde_json::Value> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolExecutor for RecordingTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn description(&self) -> &str {
        "Recording test tool"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .required
            .iter()
            .map(|f| (f.to_string(), json!({ "type": "string" })))
            .collect();
        json!({ "type": "object", "properties": properties, "required": self.required })
    }

    async fn execute(&self, _ctx: &ToolContext, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        self.calls.lock().unwrap().push(arguments);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.clone()
    }
}

/// Corpus of numbered segments per source.
pub struct StaticCorpus {
    sources: HashMap<String, usize>,
    pulls: Mutex<Vec<String>>,
}

impl StaticCorpus {
    pub fn new(sources: &[(&str, usize)]) -> Self {
        Self {
            sources: sources.iter().map(|(id, n)| (id.to_string(), *n)).collect(),
            pulls: Mutex::new(Vec::new()),
        }
    }

    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }

    fn segments(&self, source_id: &str, limit: usize) -> Result<Vec<serde_json::Value>, ToolError> {
        let count = self
            .sources
            .get(source_id)
            .ok_or_else(|| ToolError::InvalidArguments(format!("no such source {source_id}")))?;
        Ok((0..(*count).min(limit))
            .map(|i| json!({ "session_id": source_id, "index": i, "text": format!("segment {i}") }))
            .collect())
    }
}

#[async_trait]
impl CorpusSource for StaticCorpus {
    async fn preview(&self, _ctx: &ToolContext, source_id: &str, limit: usize) -> Result<Vec<serde_json::Value>, ToolError> {
        self.segments(source_id, limit)
    }

    async fn pull(&self, _ctx: &ToolContext, source_id: &str) -> Result<Vec<serde_json::Value>, ToolError> {
        self.pulls.lock().unwrap().push(source_id.to_string());
        self.segments(source_id, usize::MAX)
    }

    async fn search(
        &self,
        _ctx: &ToolContext,
        source_id: &str,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, ToolError> {
        self.segments(source_id, limit)
    }
}
