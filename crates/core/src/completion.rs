//! Completion client trait: the abstraction over the hosted LLM.
//!
//! The agent runtime only ever streams: a request goes out with the full
//! message list and the tool schema, and comes back as a sequence of
//! [`CompletionEvent`]s. Tool-call fragments are forwarded raw; reassembly
//! happens in the agent loop once the stream has finished.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::Message;

/// A request to the completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The model to use (e.g., "gpt-4o")
    pub model: String,

    /// The conversation messages, system message first
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One event of a streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionEvent {
    /// Partial assistant text.
    ContentDelta { text: String },

    /// A piece of a tool call. `index` is assigned by the provider and
    /// groups fragments; `id` and `name` usually arrive on the first
    /// fragment only, `arguments` arrives in pieces.
    ToolCallFragment {
        index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },

    /// The stream is over.
    Finished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

/// Receiving half of a completion stream.
pub type CompletionStream = mpsc::Receiver<std::result::Result<CompletionEvent, ProviderError>>;

/// The hosted completion service.
///
/// Implementations: OpenAI-compatible SSE endpoint; scripted clients in tests.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// A human-readable name for this client (e.g., "openai").
    fn name(&self) -> &str;

    /// Open a streaming completion.
    ///
    /// Errors returned here (connection refused, 4xx/5xx before the first
    /// byte) and errors delivered through the stream are both completion
    /// failures and abort the turn.
    async fn stream(&self, request: CompletionRequest) -> std::result::Result<CompletionStream, ProviderError>;

    /// Health check: can we reach the service?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}
