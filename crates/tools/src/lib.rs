//! Tool executors for Clinscribe.
//!
//! Tools give the agent access to the practice: client and conversation
//! lookups and recorded sessions over the REST API, UI actions the
//! frontend carries out, and local wellbeing exercises.
//!
//! [`default_catalog`] binds every implemented [`ToolKind`] to its executor.

pub mod client;
pub mod corpus;
pub mod rest;
pub mod ui;
pub mod wellbeing;

pub use client::PracticeApiClient;
pub use corpus::HttpCorpusSource;
pub use rest::{Method, RestTool, Route};
pub use ui::UiActionTool;
pub use wellbeing::WellbeingTool;

use clinscribe_core::tool::{ToolCatalog, ToolKind};
use serde_json::json;
use std::sync::Arc;

/// Route, description and parameter schema of each REST-backed tool.
fn rest_specs() -> Vec<(ToolKind, &'static str, serde_json::Value, Route)> {
    vec![
        (
            ToolKind::SearchClients,
            "Search for clients by name. Returns a list with client_id and name; use the client_id for follow-up calls.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Client name or part of it" },
                    "limit": { "type": "integer", "default": 10 }
                },
                "required": ["query"]
            }),
            Route::get("haystack/search-clients")
                .requires(&["query"])
                .unwrapping("clients"),
        ),
        (
            ToolKind::GetClientSummary,
            "Get detailed client information and treatment progress. Requires the client's UUID from search_clients.",
            json!({
                "type": "object",
                "properties": {
                    "client_id": { "type": "string", "description": "Client UUID" },
                    "client_name": { "type": "string", "description": "Client display name, if known" },
                    "include_recent_sessions": { "type": "boolean", "default": true }
                },
                "required": ["client_id"]
            }),
            Route::get("haystack/client-summary").requires(&["client_id"]),
        ),
        (
            ToolKind::GenerateReport,
            "Create a report (progress, summary, attendance) for a client.",
            json!({
                "type": "object",
                "properties": {
                    "report_type": { "type": "string" },
                    "client_id": { "type": "string" },
                    "date_range": {
                        "type": "object",
                        "properties": { "from": { "type": "string" }, "to": { "type": "string" } }
                    }
                },
                "required": ["report_type", "client_id"]
            }),
            Route::post("haystack/generate-report").requires(&["report_type", "client_id"]),
        ),
        (
            ToolKind::GetConversations,
            "List all conversation threads (homework assignments) for a client.",
            json!({
                "type": "object",
                "properties": {
                    "client_id": { "type": "string" },
                    "client_name": { "type": "string" }
                },
                "required": ["client_id"]
            }),
            Route::get("haystack/conversations").requires(&["client_id"]),
        ),
        (
            ToolKind::GetConversationMessages,
            "Get messages from one conversation thread. Requires client_id and assignment_id.",
            json!({
                "type": "object",
                "properties": {
                    "client_id": { "type": "string" },
                    "client_name": { "type": "string" },
                    "assignment_id": { "type": "string" },
                    "limit": { "type": "integer", "default": 100 },
                    "offset": { "type": "integer", "default": 0 }
                },
                "required": ["client_id", "assignment_id"]
            }),
            Route::get("haystack/conversation-messages").requires(&["client_id", "assignment_id"]),
        ),
        (
            ToolKind::GetLatestConversation,
            "Get the most recent conversation for a client, including latest_assignment_id.",
            json!({
                "type": "object",
                "properties": {
                    "client_id": { "type": "string" },
                    "client_name": { "type": "string" },
                    "message_limit": { "type": "integer", "default": 50 }
                },
                "required": ["client_id"]
            }),
            Route::get("haystack/latest-conversation").requires(&["client_id"]),
        ),
        (
            ToolKind::SearchSessions,
            "Search recorded sessions by client, date range or keywords.",
            json!({
                "type": "object",
                "properties": {
                    "client_name": { "type": "string" },
                    "client_id": { "type": "string" },
                    "date_from": { "type": "string", "description": "YYYY-MM-DD" },
                    "date_to": { "type": "string", "description": "YYYY-MM-DD" },
                    "keywords": { "type": "string" },
                    "limit": { "type": "integer", "default": 10 }
                }
            }),
            Route::get("haystack/search-sessions"),
        ),
        (
            ToolKind::LoadSession,
            "Load one recorded session with its transcript for analysis.",
            json!({
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "client_id": { "type": "string" },
                    "include_segments": { "type": "boolean", "default": true }
                },
                "required": ["session_id", "client_id"]
            }),
            Route::get("haystack/sessions/{session_id}").requires(&["client_id"]),
        ),
        (
            ToolKind::AnalyzeSessionContent,
            "Analyze a recorded session for themes, sentiment or a summary.",
            json!({
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "client_id": { "type": "string" },
                    "analysis_type": {
                        "type": "string",
                        "enum": ["summary", "topics", "themes", "comprehensive"],
                        "default": "comprehensive"
                    }
                },
                "required": ["session_id", "client_id"]
            }),
            Route::post("haystack/sessions/{session_id}/analyze").requires(&["client_id"]),
        ),
        (
            ToolKind::GetTemplates,
            "List the document templates available to the practice.",
            json!({
                "type": "object",
                "properties": {
                    "template_type": { "type": "string", "enum": ["all", "private", "clinic", "public"] },
                    "search_query": { "type": "string" }
                }
            }),
            Route::get("templates"),
        ),
    ]
}

/// Build the catalog of every implemented tool.
pub fn default_catalog(client: Arc<PracticeApiClient>) -> ToolCatalog {
    let mut catalog = ToolCatalog::new();

    for (kind, description, schema, route) in rest_specs() {
        catalog.register(Arc::new(RestTool::new(kind, description, schema, route, client.clone())));
    }

    for kind in ToolKind::ALL {
        if let Some(tool) = UiActionTool::new(kind) {
            catalog.register(Arc::new(tool));
        } else if let Some(tool) = WellbeingTool::new(kind) {
            catalog.register(Arc::new(tool));
        }
    }

    catalog
}
