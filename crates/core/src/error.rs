//! Error types for the Clinscribe domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error type; the agent runtime decides
//! which of them are recoverable (fed back to the model) and which abort a turn.

use thiserror::Error;

/// The top-level error type for all Clinscribe operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Completion service errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Session store errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Turn-level errors ---
    #[error("Turn error: {0}")]
    Turn(#[from] TurnError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// A failure of the completion service. Always aborts the current turn.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// A tool failure. Recoverable: the agent loop feeds it back to the model.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool not available in this catalog: {0}")]
    NotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Upstream request failed for {tool_name} (status {status}): {message}")]
    Upstream {
        tool_name: String,
        status: u16,
        message: String,
    },

    #[error("Not authorized to call {0}")]
    Unauthorized(String),

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Budget(#[from] BudgetExceeded),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },
}

/// Argument repair found no identifier. Never fatal: the original
/// arguments are passed through and the executor reports what it must.
#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    #[error("No identifier or display name to resolve '{param}' from")]
    NoCandidate { param: String },

    #[error("Lookup via {lookup} returned no usable identifier")]
    NoMatch { lookup: String },

    #[error("Lookup via {lookup} failed: {reason}")]
    LookupFailed { lookup: String, reason: String },

    #[error("Iteration budget spent; skipped lookup for '{param}'")]
    BudgetSpent { param: String },
}

/// An exploration retrieval that would push the running token estimate past
/// the budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Token budget exceeded: {used} used + {requested} requested > {budget}")]
pub struct BudgetExceeded {
    pub requested: usize,
    pub used: usize,
    pub budget: usize,
}

/// Errors that end a turn early.
#[derive(Debug, Clone, Error)]
pub enum TurnError {
    #[error("Completion failed: {0}")]
    Completion(#[from] ProviderError),

    #[error("Iteration limit of {max} reached")]
    IterationExhausted { max: u32 },

    #[error("Turn cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session serialization failed: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn budget_error_converts_into_tool_error() {
        let err: ToolError = BudgetExceeded {
            requested: 900,
            used: 59_500,
            budget: 60_000,
        }
        .into();
        let text = err.to_string();
        assert!(text.contains("59500"));
        assert!(text.contains("60000"));
    }

    #[test]
    fn turn_error_wraps_provider_error() {
        let err: TurnError = ProviderError::Timeout("no data in 60s".into()).into();
        assert!(matches!(err, TurnError::Completion(ProviderError::Timeout(_))));
        assert!(err.to_string().contains("no data"));
    }
}
