//! Tool catalog: the closed set of capabilities the model may invoke.
//!
//! Tool identities are a closed enumeration ([`ToolKind`]). The catalog maps
//! each identity to an executor when it is built; a name the model invents
//! fails to parse into a `ToolKind` and surfaces as
//! [`ToolError::UnknownTool`] rather than a silent lookup miss.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::completion::ToolDefinition;
use crate::error::ToolError;
use crate::message::ConversationId;

/// Every tool the practice-management catalog knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    // Clients
    SearchClients,
    GetClientSummary,
    GetClientMoodProfile,
    SetClientSelection,
    GenerateReport,
    // Conversations
    GetConversations,
    GetConversationMessages,
    GetLatestConversation,
    // Recorded sessions
    SearchSessions,
    LoadSession,
    LoadSessionDirect,
    LoadMultipleSessions,
    ValidateSessions,
    GetLoadedSessions,
    GetSessionContent,
    AnalyzeLoadedSession,
    AnalyzeSessionContent,
    // Templates and documents
    GetTemplates,
    SetSelectedTemplate,
    GenerateDocumentFromLoaded,
    GenerateDocumentAuto,
    // Navigation
    SuggestNavigation,
    NavigateToPage,
    // Wellbeing
    MoodCheckIn,
    CopingStrategies,
    BreathingExercise,
}

impl ToolKind {
    /// All tool identities, in catalog order.
    pub const ALL: [ToolKind; 26] = [
        ToolKind::SearchClients,
        ToolKind::GetClientSummary,
        ToolKind::GetClientMoodProfile,
        ToolKind::SetClientSelection,
        ToolKind::GenerateReport,
        ToolKind::GetConversations,
        ToolKind::GetConversationMessages,
        ToolKind::GetLatestConversation,
        ToolKind::SearchSessions,
        ToolKind::LoadSession,
        ToolKind::LoadSessionDirect,
        ToolKind::LoadMultipleSessions,
        ToolKind::ValidateSessions,
        ToolKind::GetLoadedSessions,
        ToolKind::GetSessionContent,
        ToolKind::AnalyzeLoadedSession,
        ToolKind::AnalyzeSessionContent,
        ToolKind::GetTemplates,
        ToolKind::SetSelectedTemplate,
        ToolKind::GenerateDocumentFromLoaded,
        ToolKind::GenerateDocumentAuto,
        ToolKind::SuggestNavigation,
        ToolKind::NavigateToPage,
        ToolKind::MoodCheckIn,
        ToolKind::CopingStrategies,
        ToolKind::BreathingExercise,
    ];

    /// The wire name sent to and received from the model.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchClients => "search_clients",
            Self::GetClientSummary => "get_client_summary",
            Self::GetClientMoodProfile => "get_client_mood_profile",
            Self::SetClientSelection => "set_client_selection",
            Self::GenerateReport => "generate_report",
            Self::GetConversations => "get_conversations",
            Self::GetConversationMessages => "get_conversation_messages",
            Self::GetLatestConversation => "get_latest_conversation",
            Self::SearchSessions => "search_sessions",
            Self::LoadSession => "load_session",
            Self::LoadSessionDirect => "load_session_direct",
            Self::LoadMultipleSessions => "load_multiple_sessions",
            Self::ValidateSessions => "validate_sessions",
            Self::GetLoadedSessions => "get_loaded_sessions",
            Self::GetSessionContent => "get_session_content",
            Self::AnalyzeLoadedSession => "analyze_loaded_session",
            Self::AnalyzeSessionContent => "analyze_session_content",
            Self::GetTemplates => "get_templates",
            Self::SetSelectedTemplate => "set_selected_template",
            Self::GenerateDocumentFromLoaded => "generate_document_from_loaded",
            Self::GenerateDocumentAuto => "generate_document_auto",
            Self::SuggestNavigation => "suggest_navigation",
            Self::NavigateToPage => "navigate_to_page",
            Self::MoodCheckIn => "mood_check_in",
            Self::CopingStrategies => "coping_strategies",
            Self::BreathingExercise => "breathing_exercise",
        }
    }

    /// Whether this tool produces a clinical document.
    pub fn generates_document(&self) -> bool {
        matches!(self, Self::GenerateDocumentAuto | Self::GenerateDocumentFromLoaded)
    }
}

impl FromStr for ToolKind {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ToolError::UnknownTool(s.to_string()))
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the UI the operator was when they sent the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub page_type: String,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tab: Option<String>,
}

/// Per-turn context threaded into every tool execution.
///
/// Carries the caller's credentials and page state explicitly so that two
/// concurrent turns can never see each other's auth token.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub user_id: String,
    pub conversation_id: ConversationId,
    pub auth_token: Option<String>,
    pub profile_id: Option<String>,
    pub page: Option<PageContext>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("user_id", &self.user_id)
            .field("conversation_id", &self.conversation_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("profile_id", &self.profile_id)
            .field("page", &self.page)
            .finish()
    }
}

/// A parsed request to execute one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Unique call ID (matches the model's tool_call.id)
    pub call_id: String,

    /// Which tool
    pub tool: ToolKind,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// The result of a tool execution, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// Payload on success
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,

    /// Error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            payload,
            error: None,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            payload: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// Build a result from an executor outcome.
    ///
    /// A successful payload that is an object with a non-empty `"error"`
    /// field is an upstream failure wrapped in a 200 and counts as a failure.
    pub fn from_outcome(call_id: impl Into<String>, outcome: Result<serde_json::Value, ToolError>) -> Self {
        match outcome {
            Ok(payload) => match embedded_error(&payload) {
                Some(err) => Self::failure(call_id, err),
                None => Self::success(call_id, payload),
            },
            Err(e) => Self::failure(call_id, e.to_string()),
        }
    }

    /// The same result re-addressed to another call id.
    pub fn readdressed(&self, call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ..self.clone()
        }
    }

    /// The content of the tool-result message sent back to the model.
    pub fn to_message_content(&self) -> String {
        if self.success {
            serde_json::to_string(&self.payload).unwrap_or_else(|_| "null".into())
        } else {
            serde_json::json!({ "error": self.error.as_deref().unwrap_or("Failed") }).to_string()
        }
    }
}

fn embedded_error(payload: &serde_json::Value) -> Option<String> {
    match payload.get("error")? {
        serde_json::Value::Null | serde_json::Value::Bool(false) => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Executes one kind of tool against the backend.
///
/// Ordinary failures (auth, upstream 4xx/5xx, malformed payloads) are
/// returned as `ToolError`s, never panics.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The tool this executor implements.
    fn kind(&self) -> ToolKind;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.kind().as_str().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// The set of executors available to a turn.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    executors: BTreeMap<ToolKind, Arc<dyn ToolExecutor>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor. Replaces any existing executor for the same kind.
    pub fn register(&mut self, executor: Arc<dyn ToolExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    /// Get an executor by kind.
    pub fn get(&self, kind: ToolKind) -> Option<&Arc<dyn ToolExecutor>> {
        self.executors.get(&kind)
    }

    pub fn contains(&self, kind: ToolKind) -> bool {
        self.executors.contains_key(&kind)
    }

    /// A catalog limited to the given kinds (e.g. a persona's tool list).
    pub fn restricted(&self, kinds: &[ToolKind]) -> Self {
        Self {
            executors: self
                .executors
                .iter()
                .filter(|(k, _)| kinds.contains(k))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }

    /// Get all tool definitions (for sending to the LLM), in catalog order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.executors.values().map(|t| t.to_definition()).collect()
    }

    /// Execute one tool.
    pub async fn execute(
        &self,
        kind: ToolKind,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        let executor = self
            .executors
            .get(&kind)
            .ok_or_else(|| ToolError::NotFound(kind.as_str().to_string()))?;
        executor.execute(ctx, arguments).await
    }

    /// List all registered tool kinds.
    pub fn kinds(&self) -> Vec<ToolKind> {
        self.executors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoSearch;

    #[async_trait]
    impl ToolExecutor for EchoSearch {
        fn kind(&self) -> ToolKind {
            ToolKind::SearchClients
        }
        fn description(&self) -> &str {
            "Echoes the query back"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            })
        }
        async fn execute(
            &self,
            _ctx: &ToolContext,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!([{ "name": arguments["query"] }]))
        }
    }

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for kind in ToolKind::ALL {
            assert_eq!(kind.as_str().parse::<ToolKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_name_is_typed_error() {
        let err = "delete_everything".parse::<ToolKind>().unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "delete_everything"));
    }

    #[test]
    fn serde_name_matches_wire_name() {
        let json = serde_json::to_string(&ToolKind::GetLatestConversation).unwrap();
        assert_eq!(json, "\"get_latest_conversation\"");
    }

    #[test]
    fn embedded_error_counts_as_failure() {
        let result = ToolResult::from_outcome(
            "call_1",
            Ok(serde_json::json!({ "name": "Client (API Error)", "error": "HTTP 500" })),
        );
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("HTTP 500"));
        assert!(result.to_message_content().contains("HTTP 500"));
    }

    #[test]
    fn empty_error_field_is_not_failure() {
        let result = ToolResult::from_outcome("call_1", Ok(serde_json::json!({ "error": "" })));
        assert!(result.success);
    }

    #[test]
    fn context_debug_redacts_token() {
        let ctx = ToolContext {
            auth_token: Some("Bearer secret".into()),
            ..ToolContext::default()
        };
        let debug = format!("{ctx:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn catalog_execute_and_restrict() {
        let mut catalog = ToolCatalog::new();
        catalog.register(Arc::new(EchoSearch));
        assert_eq!(catalog.definitions()[0].name, "search_clients");

        let out = catalog
            .execute(
                ToolKind::SearchClients,
                &ToolContext::default(),
                serde_json::json!({ "query": "Jane" }),
            )
            .await
            .unwrap();
        assert_eq!(out[0]["name"], "Jane");

        let restricted = catalog.restricted(&[ToolKind::GetTemplates]);
        assert!(restricted.is_empty());
        let err = restricted
            .execute(ToolKind::SearchClients, &ToolContext::default(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
