//! Domain event system: decoupled observation of the agent runtime.
//!
//! Events are published when something interesting happens in a turn.
//! Other components (audit logging, metrics exporters, the transport's
//! activity feed) can subscribe without coupling to the agent loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A turn was admitted for a user
    TurnAdmitted {
        user_id: String,
        conversation_id: String,
        waited_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A completion call finished streaming
    CompletionFinished {
        conversation_id: String,
        model: String,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed (or served from the duplicate guard)
    ToolExecuted {
        tool_name: String,
        success: bool,
        deduplicated: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An identifier was resolved into a tool's arguments
    ArgumentRepaired {
        tool_name: String,
        param: String,
        via_lookup: bool,
        timestamp: DateTime<Utc>,
    },

    /// A turn completed normally
    TurnCompleted {
        conversation_id: String,
        iterations: u32,
        tool_calls: usize,
        timestamp: DateTime<Utc>,
    },

    /// A turn was aborted (completion failure, iteration cap, cancellation)
    TurnAborted {
        conversation_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Idle admission slots were reclaimed
    SlotsSwept { removed: usize, timestamp: DateTime<Utc> },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            tool_name: "search_clients".into(),
            success: true,
            deduplicated: false,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "search_clients");
                assert!(success);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::TurnAborted {
            conversation_id: "c1".into(),
            reason: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }
}
