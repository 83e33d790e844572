//! The read-only tools the exploration model may call.

use clinscribe_core::completion::ToolDefinition;
use clinscribe_core::error::ToolError;
use serde_json::json;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplorationTool {
    PreviewSource,
    PullSource,
    SearchSource,
    CheckBudget,
    SignalDone,
}

impl ExplorationTool {
    pub const ALL: [ExplorationTool; 5] = [
        Self::PreviewSource,
        Self::PullSource,
        Self::SearchSource,
        Self::CheckBudget,
        Self::SignalDone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreviewSource => "preview_source",
            Self::PullSource => "pull_source",
            Self::SearchSource => "search_source",
            Self::CheckBudget => "check_budget",
            Self::SignalDone => "signal_done",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::PreviewSource => "Read the first segments of a source to judge what it covers and when it took place.",
            Self::PullSource => "Retrieve every segment of a source. Refused if it would exceed the remaining token budget.",
            Self::SearchSource => "Retrieve the segments of a source most relevant to a query.",
            Self::CheckBudget => "Report items gathered, tokens used and remaining, and whether the material is likely sufficient.",
            Self::SignalDone => "Finish exploring. Call this once the gathered material is enough for the document.",
        }
    }

    fn parameters(&self) -> serde_json::Value {
        let reasoning = json!({ "type": "string", "description": "Why this step" });
        match self {
            Self::PreviewSource => json!({
                "type": "object",
                "properties": {
                    "source_id": { "type": "string" },
                    "limit": { "type": "integer", "default": 10 },
                    "reasoning": reasoning
                },
                "required": ["source_id"]
            }),
            Self::PullSource => json!({
                "type": "object",
                "properties": {
                    "source_id": { "type": "string" },
                    "reasoning": reasoning
                },
                "required": ["source_id"]
            }),
            Self::SearchSource => json!({
                "type": "object",
                "properties": {
                    "source_id": { "type": "string" },
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "default": 20 },
                    "reasoning": reasoning
                },
                "required": ["source_id", "query"]
            }),
            Self::CheckBudget => json!({
                "type": "object",
                "properties": { "reasoning": reasoning }
            }),
            Self::SignalDone => json!({
                "type": "object",
                "properties": { "reasoning": reasoning },
                "required": ["reasoning"]
            }),
        }
    }

    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.as_str().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        Self::ALL.iter().map(Self::to_definition).collect()
    }
}

impl FromStr for ExplorationTool {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ToolError::UnknownTool(s.to_string()))
    }
}

impl std::fmt::Display for ExplorationTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for tool in ExplorationTool::ALL {
            assert_eq!(tool.as_str().parse::<ExplorationTool>().unwrap(), tool);
        }
        assert!(matches!(
            "search_clients".parse::<ExplorationTool>(),
            Err(ToolError::UnknownTool(_))
        ));
    }

    #[test]
    fn definitions_cover_every_tool() {
        let defs = ExplorationTool::definitions();
        assert_eq!(defs.len(), 5);
        assert!(defs.iter().all(|d| d.parameters["type"] == "object"));
    }
}
