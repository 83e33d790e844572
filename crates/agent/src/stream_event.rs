//! Agent-level streaming events.
//!
//! `AgentStreamEvent` is what the transport forwards to the operator's
//! browser over SSE or WebSocket, in the order the turn produced it.

use clinscribe_core::completion::Usage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events emitted by the agent during a turn.
///
/// - `content_delta` - partial text from the model
/// - `tool_started`  - a tool invocation is about to run
/// - `tool_finished` - the invocation produced a result
/// - `turn_complete` - the turn ended with an answer
/// - `error`         - the turn was aborted; `message` is user-facing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    ContentDelta { text: String },

    ToolStarted { call_id: String, tool: String },

    ToolFinished {
        call_id: String,
        tool: String,
        success: bool,
        /// Served from the duplicate guard without executing
        #[serde(default)]
        deduplicated: bool,
    },

    TurnComplete {
        conversation_id: String,
        iterations: u32,
        tool_calls: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    Error { message: String },
}

impl AgentStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ContentDelta { .. } => "content_delta",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolFinished { .. } => "tool_finished",
            Self::TurnComplete { .. } => "turn_complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Where a turn sends its events.
///
/// Once the turn's cancellation token fires the sink drops everything,
/// so no delta reaches the caller after a cancel.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<AgentStreamEvent>>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<AgentStreamEvent>, cancel: CancellationToken) -> Self {
        Self { tx: Some(tx), cancel }
    }

    /// A sink with no listener, for turns nobody watches.
    pub fn detached(cancel: CancellationToken) -> Self {
        Self { tx: None, cancel }
    }

    /// Deliver an event. Returns `false` if it was not delivered.
    pub async fn send(&self, event: AgentStreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the turn is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_serializes_with_tag() {
        let event = AgentStreamEvent::ContentDelta { text: "Hel".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"content_delta","text":"Hel"}"#);
    }

    #[test]
    fn turn_complete_omits_missing_usage() {
        let event = AgentStreamEvent::TurnComplete {
            conversation_id: "c1".into(),
            iterations: 2,
            tool_calls: 1,
            usage: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"turn_complete""#));
        assert!(!json.contains("usage"));
        assert_eq!(event.event_type(), "turn_complete");
    }

    #[test]
    fn tool_finished_deserializes_without_dedup_flag() {
        let json = r#"{"type":"tool_finished","call_id":"c","tool":"search_clients","success":true}"#;
        let event: AgentStreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            AgentStreamEvent::ToolFinished {
                call_id: "c".into(),
                tool: "search_clients".into(),
                success: true,
                deduplicated: false,
            }
        );
    }

    #[tokio::test]
    async fn sink_stops_delivering_after_cancel() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let sink = EventSink::new(tx, cancel.clone());

        assert!(sink.send(AgentStreamEvent::ContentDelta { text: "a".into() }).await);
        cancel.cancel();
        assert!(!sink.send(AgentStreamEvent::ContentDelta { text: "b".into() }).await);
        drop(sink);

        assert_eq!(rx.recv().await, Some(AgentStreamEvent::ContentDelta { text: "a".into() }));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn detached_sink_accepts_nothing() {
        let sink = EventSink::detached(CancellationToken::new());
        assert!(!sink.send(AgentStreamEvent::Error { message: "x".into() }).await);
    }
}
