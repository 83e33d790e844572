//! UI action tools: requests for the operator's browser to do something.
//!
//! These never touch the backend. They return a `ui_action` payload the
//! transport forwards to the frontend, or a navigation hint when the
//! operator is on a page that cannot perform the action.

use async_trait::async_trait;
use clinscribe_core::error::ToolError;
use clinscribe_core::tool::{ToolContext, ToolExecutor, ToolKind};
use serde_json::json;

/// Page that hosts session loading and client selection.
const SESSIONS_PAGE_URL: &str = "/live-transcribe";

pub struct UiActionTool {
    kind: ToolKind,
}

impl UiActionTool {
    /// Returns `None` for kinds that are not UI actions.
    pub fn new(kind: ToolKind) -> Option<Self> {
        matches!(
            kind,
            ToolKind::SetClientSelection
                | ToolKind::LoadSessionDirect
                | ToolKind::LoadMultipleSessions
                | ToolKind::SetSelectedTemplate
                | ToolKind::NavigateToPage
                | ToolKind::SuggestNavigation
        )
        .then_some(Self { kind })
    }

    fn required(&self) -> &'static [&'static str] {
        match self.kind {
            ToolKind::SetClientSelection => &["client_name", "client_id"],
            ToolKind::LoadSessionDirect => &["session_id", "client_id"],
            ToolKind::LoadMultipleSessions => &["sessions"],
            ToolKind::SetSelectedTemplate => &["template_id", "template_name"],
            ToolKind::NavigateToPage => &["page_url", "page_type"],
            ToolKind::SuggestNavigation => &["suggested_page", "reason"],
            _ => &[],
        }
    }

    /// Whether the action only works on pages that advertise it.
    fn capability_gated(&self) -> bool {
        !matches!(self.kind, ToolKind::NavigateToPage | ToolKind::SuggestNavigation)
    }
}

#[async_trait]
impl ToolExecutor for UiActionTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn description(&self) -> &str {
        match self.kind {
            ToolKind::SetClientSelection => {
                "Select a client in the UI, like choosing from the client dropdown. Requires client_name and client_id."
            }
            ToolKind::LoadSessionDirect => {
                "Open a recorded session as a new tab in the UI. Only call after validate_sessions confirmed it."
            }
            ToolKind::LoadMultipleSessions => "Open several validated sessions as separate tabs in the UI.",
            ToolKind::SetSelectedTemplate => "Select a document template in the UI for document generation.",
            ToolKind::NavigateToPage => "Navigate the operator's browser to another page.",
            _ => "Suggest that the operator move to a page where the requested action is available.",
        }
    }

    fn parameters_schema(&self) -> serde_json::Value {
        match self.kind {
            ToolKind::SetClientSelection => json!({
                "type": "object",
                "properties": {
                    "client_name": { "type": "string" },
                    "client_id": { "type": "string", "description": "Client UUID from search_clients" }
                },
                "required": ["client_name", "client_id"]
            }),
            ToolKind::LoadSessionDirect => json!({
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "client_id": { "type": "string" },
                    "client_name": { "type": "string" },
                    "recording_date": { "type": "string" },
                    "duration": { "type": "number" },
                    "total_segments": { "type": "integer" }
                },
                "required": ["session_id", "client_id"]
            }),
            ToolKind::LoadMultipleSessions => json!({
                "type": "object",
                "properties": {
                    "sessions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "session_id": { "type": "string" },
                                "client_id": { "type": "string" }
                            }
                        }
                    }
                },
                "required": ["sessions"]
            }),
            ToolKind::SetSelectedTemplate => json!({
                "type": "object",
                "properties": {
                    "template_id": { "type": "string" },
                    "template_name": { "type": "string" },
                    "template_content": { "type": "string" }
                },
                "required": ["template_id", "template_name"]
            }),
            ToolKind::NavigateToPage => json!({
                "type": "object",
                "properties": {
                    "page_url": { "type": "string" },
                    "page_type": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["page_url", "page_type"]
            }),
            _ => json!({
                "type": "object",
                "properties": {
                    "current_page": { "type": "string" },
                    "suggested_page": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["suggested_page", "reason"]
            }),
        }
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let args = arguments
            .as_object()
            .ok_or_else(|| ToolError::InvalidArguments(format!("{} expects an object", self.kind)))?;

        let missing: Vec<&str> = self
            .required()
            .iter()
            .copied()
            .filter(|k| args.get(*k).is_none_or(|v| v.is_null() || v.as_str().is_some_and(str::is_empty)))
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::InvalidArguments(format!(
                "{} requires {}",
                self.kind,
                missing.join(", ")
            )));
        }

        if self.capability_gated() {
            if let Some(page) = ctx.page.as_ref() {
                let known_page = !page.page_type.is_empty() && page.page_type != "unknown";
                if known_page && !page.capabilities.iter().any(|c| c == self.kind.as_str()) {
                    return Ok(json!({
                        "status": "navigation_required",
                        "user_message": format!(
                            "This action is not available on the current page ({}). Open the Sessions page and ask again.",
                            page.page_type
                        ),
                        "navigation_link": {
                            "text": "Go to Sessions Page",
                            "url": SESSIONS_PAGE_URL,
                            "page_type": "transcribe_page"
                        }
                    }));
                }
            }
        }

        let status = match self.kind {
            ToolKind::SuggestNavigation => "navigation_suggested",
            _ => "ui_action_requested",
        };

        Ok(json!({
            "status": status,
            "ui_action": {
                "type": self.kind.as_str(),
                "payload": args,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinscribe_core::tool::PageContext;

    fn on_page(page_type: &str, capabilities: &[&str]) -> ToolContext {
        ToolContext {
            page: Some(PageContext {
                page_type: page_type.into(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                ..PageContext::default()
            }),
            ..ToolContext::default()
        }
    }

    #[test]
    fn only_ui_kinds_construct() {
        assert!(UiActionTool::new(ToolKind::SetClientSelection).is_some());
        assert!(UiActionTool::new(ToolKind::SearchClients).is_none());
    }

    #[tokio::test]
    async fn action_on_capable_page() {
        let tool = UiActionTool::new(ToolKind::SetClientSelection).unwrap();
        let out = tool
            .execute(
                &on_page("transcribe_page", &["set_client_selection"]),
                json!({ "client_name": "Jane Doe", "client_id": "c-1" }),
            )
            .await
            .unwrap();
        assert_eq!(out["status"], "ui_action_requested");
        assert_eq!(out["ui_action"]["payload"]["client_id"], "c-1");
    }

    #[tokio::test]
    async fn wrong_page_asks_for_navigation() {
        let tool = UiActionTool::new(ToolKind::LoadSessionDirect).unwrap();
        let out = tool
            .execute(
                &on_page("clients_list", &[]),
                json!({ "session_id": "s-1", "client_id": "c-1" }),
            )
            .await
            .unwrap();
        assert_eq!(out["status"], "navigation_required");
        assert_eq!(out["navigation_link"]["url"], SESSIONS_PAGE_URL);
    }

    #[tokio::test]
    async fn navigation_is_never_gated() {
        let tool = UiActionTool::new(ToolKind::NavigateToPage).unwrap();
        let out = tool
            .execute(
                &on_page("clients_list", &[]),
                json!({ "page_url": "/templates", "page_type": "templates_page" }),
            )
            .await
            .unwrap();
        assert_eq!(out["status"], "ui_action_requested");
    }

    #[tokio::test]
    async fn missing_fields_rejected() {
        let tool = UiActionTool::new(ToolKind::SetClientSelection).unwrap();
        let err = tool
            .execute(&ToolContext::default(), json!({ "client_name": "Jane" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(msg) if msg.contains("client_id")));
    }
}
