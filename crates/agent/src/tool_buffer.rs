//! Reassembly of streamed tool-call fragments.
//!
//! The completion service streams each tool call as fragments keyed by a
//! provider-assigned index: the id and name usually arrive first, the
//! argument string in pieces. Nothing is parsed until the stream ends.

use clinscribe_core::error::ToolError;
use clinscribe_core::message::MessageToolCall;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Fragments collected during one completion stream.
#[derive(Debug, Default)]
pub struct ToolCallBuffer {
    calls: BTreeMap<u32, PartialCall>,
}

/// One tool call after the stream finished.
#[derive(Debug, Clone)]
pub struct AssembledCall {
    pub id: String,
    pub name: String,
    /// Parsed argument object, or why it could not be parsed
    pub arguments: Result<serde_json::Value, ToolError>,
}

impl AssembledCall {
    /// The call as recorded on the assistant message.
    pub fn to_message_call(&self) -> MessageToolCall {
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: match &self.arguments {
                Ok(args) => args.to_string(),
                Err(_) => "{}".into(),
            },
        }
    }
}

impl ToolCallBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u32, id: Option<String>, name: Option<String>, arguments: Option<String>) {
        let call = self.calls.entry(index).or_default();
        if call.id.is_none() {
            call.id = id.filter(|s| !s.is_empty());
        }
        if let Some(name) = name {
            // Some servers repeat the full name on every fragment
            if call.name != name {
                call.name.push_str(&name);
            }
        }
        if let Some(fragment) = arguments {
            call.arguments.push_str(&fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finish the stream: calls in index order, arguments parsed once.
    pub fn finish(self) -> Vec<AssembledCall> {
        self.calls
            .into_values()
            .map(|call| {
                let arguments = parse_arguments(&call.name, &call.arguments);
                AssembledCall {
                    id: call
                        .id
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    name: call.name,
                    arguments,
                }
            })
            .collect()
    }
}

fn parse_arguments(name: &str, raw: &str) -> Result<serde_json::Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => Ok(value),
        Ok(other) => Err(ToolError::InvalidArguments(format!(
            "arguments for {name} must be a JSON object, got {other}"
        ))),
        Err(e) => Err(ToolError::InvalidArguments(format!(
            "arguments for {name} are not valid JSON: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_are_concatenated_per_index() {
        let mut buffer = ToolCallBuffer::new();
        buffer.push(0, Some("call_a".into()), Some("search_clients".into()), Some("{\"que".into()));
        buffer.push(1, Some("call_b".into()), Some("get_templates".into()), None);
        buffer.push(0, None, None, Some("ry\": \"Jane".into()));
        buffer.push(0, None, None, Some(" Doe\"}".into()));

        let calls = buffer.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].name, "search_clients");
        assert_eq!(calls[0].arguments.as_ref().unwrap()["query"], "Jane Doe");
        assert_eq!(calls[1].name, "get_templates");
        assert_eq!(calls[1].arguments.as_ref().unwrap(), &serde_json::json!({}));
    }

    #[test]
    fn repeated_name_is_not_doubled() {
        let mut buffer = ToolCallBuffer::new();
        buffer.push(0, Some("c".into()), Some("load_session".into()), Some("{".into()));
        buffer.push(0, None, Some("load_session".into()), Some("}".into()));
        assert_eq!(buffer.finish()[0].name, "load_session");
    }

    #[test]
    fn malformed_arguments_become_invalid_arguments() {
        let mut buffer = ToolCallBuffer::new();
        buffer.push(0, Some("c".into()), Some("search_clients".into()), Some("{\"query\": ".into()));
        buffer.push(1, Some("d".into()), Some("search_clients".into()), Some("[1,2]".into()));

        let calls = buffer.finish();
        assert!(matches!(calls[0].arguments, Err(ToolError::InvalidArguments(_))));
        assert!(matches!(calls[1].arguments, Err(ToolError::InvalidArguments(_))));
        assert_eq!(calls[0].to_message_call().arguments, "{}");
    }

    #[test]
    fn missing_id_is_generated() {
        let mut buffer = ToolCallBuffer::new();
        buffer.push(3, None, Some("get_templates".into()), None);
        let calls = buffer.finish();
        assert!(calls[0].id.starts_with("call_"));
    }
}
